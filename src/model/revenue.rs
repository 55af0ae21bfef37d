use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Operator metadata for a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaccoInfo {
    pub sacco_id: String,
    pub sacco_name: String,
    pub terminus: String,
}

impl SaccoInfo {
    pub const UNKNOWN_ID: &'static str = "unknown";

    pub fn new(sacco_id: &str, sacco_name: &str, terminus: &str) -> Self {
        Self {
            sacco_id: sacco_id.to_string(),
            sacco_name: sacco_name.to_string(),
            terminus: terminus.to_string(),
        }
    }

    /// Stand-in used when a route or matatu has no operator on record.
    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN_ID, "Unknown Sacco", "Unknown Terminus")
    }

    pub fn is_unknown(&self) -> bool {
        self.sacco_id == Self::UNKNOWN_ID
    }
}

/// Fare revenue collected by one SACCO in one tumbling window `[window_start, window_end)`.
///
/// Emitted exactly once, when the window closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaccoRevenueWindow {
    pub sacco_id: String,
    pub sacco_name: String,
    pub total_revenue_kes: Decimal,
    pub transaction_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}
