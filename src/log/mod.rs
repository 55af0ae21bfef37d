//! The partitioned event log the engine reads from and writes to.
//!
//! [`EventLog`] is the whole contract the engine relies on: named topics split
//! into partitions, records addressed by offset, a deterministic key to
//! partition mapping, and per-group committed positions. [`InMemoryLog`] is the
//! in-process implementation used by the CLI and the tests.

mod memory;
pub mod partitioner;

pub use memory::InMemoryLog;
pub use partitioner::partition_for;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::LogError;

/// A record stored in a topic partition.
///
/// A `None` value is a tombstone: the key was deleted from the table the
/// topic describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// A record on its way into the log.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    /// Explicit partition; derived from the key when `None`.
    pub partition: Option<u32>,
    pub key: String,
    pub value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProducerRecord {
    pub fn keyed(topic: &str, key: &str, value: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            topic: topic.to_string(),
            partition: None,
            key: key.to_string(),
            value: Some(value),
            timestamp,
        }
    }

    pub fn to_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }
}

/// Where an appended record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    pub partition: u32,
    pub offset: u64,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Creates `topic` with `partitions` partitions. Creating an existing
    /// topic with the same partition count is a no-op.
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), LogError>;

    async fn partition_count(&self, topic: &str) -> Result<u32, LogError>;

    /// All topics with their partition counts, sorted by name.
    async fn list_topics(&self) -> Vec<(String, u32)>;

    /// Appends one record and returns once it is durable in the log.
    async fn produce(&self, record: ProducerRecord) -> Result<RecordMetadata, LogError>;

    /// Reads up to `max` records of one partition starting at `offset`.
    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max: usize,
    ) -> Result<Vec<Record>, LogError>;

    /// Offset the next appended record of the partition will receive.
    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, LogError>;

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: u64,
    ) -> Result<(), LogError>;

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, LogError>;

    /// Notified after every successful append.
    fn append_signal(&self) -> Arc<Notify>;
}
