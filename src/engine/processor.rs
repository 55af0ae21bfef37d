//! The processor API.
//!
//! A [`Processor`] instance is created per task by its [`ProcessorSupplier`],
//! so its fields are private to one partition. Stores, forwarding and
//! punctuator scheduling all go through the [`ProcessorContext`] handed to
//! each call.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::metrics::TaskMetrics;
use super::store::KeyValueStore;
use crate::error::{EngineError, Result, StoreError};

/// A record travelling between nodes of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub key: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    /// Topic the record was read from
    pub topic: Arc<str>,
}

impl StreamRecord {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.value).map_err(|source| EngineError::Decode {
            topic: self.topic.to_string(),
            key: self.key.clone(),
            source,
        })
    }
}

pub trait Processor: Send {
    /// Called once after the task's stores are restored.
    fn init(&mut self, _ctx: &mut ProcessorContext<'_>) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()>;

    /// Called by the punctuator registered through [`ProcessorContext::schedule`].
    fn punctuate(&mut self, _ctx: &mut ProcessorContext<'_>) -> Result<()> {
        Ok(())
    }
}

pub type ProcessorSupplier = Arc<dyn Fn() -> Box<dyn Processor> + Send + Sync>;

/// Wraps a constructor closure as a [`ProcessorSupplier`].
pub fn supplier<P, F>(make: F) -> ProcessorSupplier
where
    P: Processor + 'static,
    F: Fn() -> P + Send + Sync + 'static,
{
    Arc::new(move || Box::new(make()) as Box<dyn Processor>)
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Emitted {
    /// Child node name, or `None` for every child
    pub target: Option<String>,
    pub record: StreamRecord,
}

pub struct ProcessorContext<'a> {
    node: &'a str,
    partition: u32,
    topic: Arc<str>,
    now: DateTime<Utc>,
    stores: &'a mut HashMap<String, KeyValueStore>,
    connected: &'a [String],
    metrics: &'a mut TaskMetrics,
    emitted: Vec<Emitted>,
    schedule: Option<Duration>,
}

impl<'a> ProcessorContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node: &'a str,
        partition: u32,
        topic: Arc<str>,
        now: DateTime<Utc>,
        stores: &'a mut HashMap<String, KeyValueStore>,
        connected: &'a [String],
        metrics: &'a mut TaskMetrics,
    ) -> Self {
        Self {
            node,
            partition,
            topic,
            now,
            stores,
            connected,
            metrics,
            emitted: Vec::new(),
            schedule: None,
        }
    }

    pub fn node(&self) -> &str {
        self.node
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Wall-clock time of this call.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// A store connected to this processor in the topology.
    pub fn store(&mut self, name: &str) -> std::result::Result<&mut KeyValueStore, StoreError> {
        if !self.connected.iter().any(|s| s == name) {
            return Err(StoreError::NotConnected(name.to_string()));
        }
        self.stores
            .get_mut(name)
            .ok_or_else(|| StoreError::NotConnected(name.to_string()))
    }

    /// Sends a record to every child of this node.
    pub fn forward<V: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &V,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let record = self.record(key.into(), value, timestamp)?;
        self.emitted.push(Emitted {
            target: None,
            record,
        });
        Ok(())
    }

    /// Sends a record to the named child only.
    pub fn forward_to<V: Serialize>(
        &mut self,
        child: &str,
        key: impl Into<String>,
        value: &V,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let record = self.record(key.into(), value, timestamp)?;
        self.emitted.push(Emitted {
            target: Some(child.to_string()),
            record,
        });
        Ok(())
    }

    /// Passes the input record on untouched.
    pub fn forward_record(&mut self, record: &StreamRecord) {
        self.emitted.push(Emitted {
            target: None,
            record: record.clone(),
        });
    }

    /// Registers a wall-clock punctuator for this processor. Only valid in `init`.
    pub fn schedule(&mut self, interval: Duration) {
        self.schedule = Some(interval);
    }

    pub fn record_late_drop(&mut self) {
        self.metrics.late_drops += 1;
    }

    pub fn record_lookup_miss(&mut self) {
        self.metrics.lookup_misses += 1;
    }

    pub(crate) fn into_parts(self) -> (Vec<Emitted>, Option<Duration>) {
        (self.emitted, self.schedule)
    }

    fn record<V: Serialize>(
        &self,
        key: String,
        value: &V,
        timestamp: DateTime<Utc>,
    ) -> Result<StreamRecord> {
        Ok(StreamRecord {
            key,
            value: serde_json::to_value(value)?,
            timestamp,
            topic: self.topic.clone(),
        })
    }
}
