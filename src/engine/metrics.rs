use serde::Serialize;
use std::ops::AddAssign;

/// Counters kept by each task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskMetrics {
    pub records_processed: u64,
    pub records_produced: u64,
    pub changelog_writes: u64,
    /// Records dropped because their window had already closed
    pub late_drops: u64,
    /// Reference lookups that fell back to the unknown sacco
    pub lookup_misses: u64,
    pub punctuations: u64,
}

impl AddAssign for TaskMetrics {
    fn add_assign(&mut self, other: Self) {
        self.records_processed += other.records_processed;
        self.records_produced += other.records_produced;
        self.changelog_writes += other.changelog_writes;
        self.late_drops += other.late_drops;
        self.lookup_misses += other.lookup_misses;
        self.punctuations += other.punctuations;
    }
}
