use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use super::{EventLog, ProducerRecord, Record, RecordMetadata, partition_for};
use crate::error::LogError;

type GroupOffsets = HashMap<(String, String, u32), u64>;

/// An event log held entirely in process memory.
///
/// Ordering and offsets behave like a broker: each partition is append-only
/// and offsets start at zero. Nothing survives the process.
#[derive(Default)]
pub struct InMemoryLog {
    topics: RwLock<BTreeMap<String, Vec<Vec<Record>>>>,
    offsets: RwLock<GroupOffsets>,
    signal: Arc<Notify>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record of a topic, partition by partition.
    pub async fn records(&self, topic: &str) -> Result<Vec<Record>, LogError> {
        let topics = self.topics.read().await;
        let partitions = topics
            .get(topic)
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;
        Ok(partitions.iter().flatten().cloned().collect())
    }
}

#[async_trait]
impl EventLog for InMemoryLog {
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), LogError> {
        let mut topics = self.topics.write().await;
        if let Some(existing) = topics.get(topic) {
            let existing = existing.len() as u32;
            if existing != partitions {
                return Err(LogError::PartitionMismatch {
                    topic: topic.to_string(),
                    existing,
                    requested: partitions,
                });
            }
            return Ok(());
        }
        debug!(topic, partitions, "Creating topic");
        topics.insert(topic.to_string(), vec![Vec::new(); partitions as usize]);
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> Result<u32, LogError> {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|p| p.len() as u32)
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))
    }

    async fn list_topics(&self) -> Vec<(String, u32)> {
        self.topics
            .read()
            .await
            .iter()
            .map(|(name, p)| (name.clone(), p.len() as u32))
            .collect()
    }

    async fn produce(&self, record: ProducerRecord) -> Result<RecordMetadata, LogError> {
        let metadata = {
            let mut topics = self.topics.write().await;
            let partitions = topics
                .get_mut(&record.topic)
                .ok_or_else(|| LogError::UnknownTopic(record.topic.clone()))?;

            let count = partitions.len() as u32;
            let partition = record
                .partition
                .unwrap_or_else(|| partition_for(&record.key, count));
            let log = partitions
                .get_mut(partition as usize)
                .ok_or_else(|| LogError::UnknownPartition {
                    topic: record.topic.clone(),
                    partition,
                })?;

            let offset = log.len() as u64;
            log.push(Record {
                topic: record.topic,
                partition,
                offset,
                key: record.key,
                value: record.value,
                timestamp: record.timestamp,
            });
            RecordMetadata { partition, offset }
        };

        self.signal.notify_waiters();
        Ok(metadata)
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max: usize,
    ) -> Result<Vec<Record>, LogError> {
        let topics = self.topics.read().await;
        let log = topics
            .get(topic)
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?
            .get(partition as usize)
            .ok_or_else(|| LogError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;

        Ok(log.iter().skip(offset as usize).take(max).cloned().collect())
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, LogError> {
        let topics = self.topics.read().await;
        topics
            .get(topic)
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?
            .get(partition as usize)
            .map(|log| log.len() as u64)
            .ok_or_else(|| LogError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: u64,
    ) -> Result<(), LogError> {
        self.offsets
            .write()
            .await
            .insert((group.to_string(), topic.to_string(), partition), offset);
        Ok(())
    }

    async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>, LogError> {
        Ok(self
            .offsets
            .read()
            .await
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied())
    }

    fn append_signal(&self) -> Arc<Notify> {
        self.signal.clone()
    }
}
