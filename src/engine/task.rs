//! One sub-topology instance bound to one partition.
//!
//! A task owns its processors and stores outright. Records are pushed
//! depth-first through the node graph, so a record's whole downstream effect
//! (store updates and sink output) is complete before the next record starts.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use super::checkpoint::{StoreCheckpoint, TaskCheckpoint};
use super::metrics::TaskMetrics;
use super::processor::{Emitted, Processor, ProcessorContext, StreamRecord};
use super::store::KeyValueStore;
use super::topology::{NodeKind, Topology};
use crate::error::{Result, TopologyError};
use crate::log::{ProducerRecord, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    pub sub_topology: usize,
    pub partition: u32,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.sub_topology, self.partition)
    }
}

struct Punctuation {
    interval: TimeDelta,
    next: DateTime<Utc>,
}

enum TaskNodeKind {
    Source,
    Processor {
        processor: Box<dyn Processor>,
        stores: Vec<String>,
        punctuation: Option<Punctuation>,
    },
    Sink {
        topic: String,
    },
}

struct TaskNode {
    name: String,
    kind: TaskNodeKind,
    children: Vec<usize>,
}

pub struct StreamTask {
    id: TaskId,
    /// Nodes keyed by their index in the topology, in insertion order
    nodes: BTreeMap<usize, TaskNode>,
    sources: HashMap<String, usize>,
    stores: HashMap<String, KeyValueStore>,
    /// Next offset to read, per source topic
    positions: BTreeMap<String, u64>,
    output: Vec<ProducerRecord>,
    metrics: TaskMetrics,
}

impl StreamTask {
    pub fn new(topology: &Topology, sub_topology: usize, partition: u32) -> Result<Self> {
        let sub = topology
            .sub_topologies()
            .get(sub_topology)
            .ok_or(TopologyError::Empty)?;

        let mut nodes = BTreeMap::new();
        let mut sources = HashMap::new();
        for &index in &sub.nodes {
            let def = &topology.nodes[index];
            let kind = match &def.kind {
                NodeKind::Source { topic, .. } => {
                    sources.insert(topic.clone(), index);
                    TaskNodeKind::Source
                }
                NodeKind::Processor(node) => TaskNodeKind::Processor {
                    processor: (node.supplier)(),
                    stores: node.stores.clone(),
                    punctuation: None,
                },
                NodeKind::Sink { topic } => TaskNodeKind::Sink {
                    topic: topic.clone(),
                },
            };
            nodes.insert(
                index,
                TaskNode {
                    name: def.name.clone(),
                    kind,
                    children: def.children.clone(),
                },
            );
        }

        let mut stores = HashMap::new();
        for name in &sub.stores {
            let changelog = topology
                .changelog_topic(name)
                .ok_or_else(|| TopologyError::UnknownStore {
                    processor: format!("task {sub_topology}_{partition}"),
                    store: name.clone(),
                })?;
            stores.insert(name.clone(), KeyValueStore::new(name, changelog, partition));
        }

        Ok(Self {
            id: TaskId {
                sub_topology,
                partition,
            },
            nodes,
            sources,
            stores,
            positions: BTreeMap::new(),
            output: Vec::new(),
            metrics: TaskMetrics::default(),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn partition(&self) -> u32 {
        self.id.partition
    }

    pub fn source_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.sources.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn store(&self, name: &str) -> Option<&KeyValueStore> {
        self.stores.get(name)
    }

    pub(crate) fn store_mut(&mut self, name: &str) -> Option<&mut KeyValueStore> {
        self.stores.get_mut(name)
    }

    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn metrics(&self) -> TaskMetrics {
        self.metrics
    }

    pub fn position(&self, topic: &str) -> Option<u64> {
        self.positions.get(topic).copied()
    }

    pub fn positions(&self) -> &BTreeMap<String, u64> {
        &self.positions
    }

    pub(crate) fn set_position(&mut self, topic: &str, offset: u64) {
        self.positions.insert(topic.to_string(), offset);
    }

    /// Initialises every processor once its stores are restored, and arms the
    /// punctuators they register.
    pub fn init(&mut self, now: DateTime<Utc>) -> Result<()> {
        let indices: Vec<usize> = self.nodes.keys().copied().collect();
        for index in indices {
            let emitted = {
                let Some(node) = self.nodes.get_mut(&index) else {
                    continue;
                };
                let TaskNodeKind::Processor {
                    processor,
                    stores,
                    punctuation,
                } = &mut node.kind
                else {
                    continue;
                };
                let mut ctx = ProcessorContext::new(
                    &node.name,
                    self.id.partition,
                    Arc::from(""),
                    now,
                    &mut self.stores,
                    stores,
                    &mut self.metrics,
                );
                processor.init(&mut ctx)?;
                let (emitted, schedule) = ctx.into_parts();
                if let Some(interval) = schedule {
                    let interval = TimeDelta::milliseconds(interval.as_millis().max(1) as i64);
                    *punctuation = Some(Punctuation {
                        interval,
                        next: now + interval,
                    });
                }
                emitted
            };
            self.deliver(index, emitted, now)?;
        }
        Ok(())
    }

    /// Pushes one input record through the sub-topology.
    pub fn process(&mut self, record: Record, now: DateTime<Utc>) -> Result<()> {
        let next_offset = record.offset + 1;
        let Some(&source) = self.sources.get(&record.topic) else {
            return Ok(());
        };

        if let Some(value) = record.value {
            self.metrics.records_processed += 1;
            let input = StreamRecord {
                key: record.key,
                value,
                timestamp: record.timestamp,
                topic: Arc::from(record.topic.as_str()),
            };
            self.visit(source, &input, now)?;
        }
        self.positions.insert(record.topic, next_offset);
        Ok(())
    }

    /// Earliest time a punctuator is due.
    pub fn next_punctuation(&self) -> Option<DateTime<Utc>> {
        self.nodes
            .values()
            .filter_map(|node| match &node.kind {
                TaskNodeKind::Processor {
                    punctuation: Some(p),
                    ..
                } => Some(p.next),
                _ => None,
            })
            .min()
    }

    /// Fires every punctuator due at `now` once. A punctuator that fell
    /// behind skips the missed intervals instead of firing repeatedly.
    pub fn punctuate(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let indices: Vec<usize> = self.nodes.keys().copied().collect();
        let mut fired = 0;
        for index in indices {
            let emitted = {
                let Some(node) = self.nodes.get_mut(&index) else {
                    continue;
                };
                let TaskNodeKind::Processor {
                    processor,
                    stores,
                    punctuation: Some(punctuation),
                } = &mut node.kind
                else {
                    continue;
                };
                if punctuation.next > now {
                    continue;
                }
                while punctuation.next <= now {
                    punctuation.next += punctuation.interval;
                }
                trace!(task = %self.id, node = %node.name, "Punctuating");
                let mut ctx = ProcessorContext::new(
                    &node.name,
                    self.id.partition,
                    Arc::from(""),
                    now,
                    &mut self.stores,
                    stores,
                    &mut self.metrics,
                );
                processor.punctuate(&mut ctx)?;
                ctx.into_parts().0
            };
            self.metrics.punctuations += 1;
            fired += 1;
            self.deliver(index, emitted, now)?;
        }
        Ok(fired)
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty() || self.stores.values().any(KeyValueStore::has_pending)
    }

    /// Drains buffered sink output and store changelog entries.
    pub fn take_output(&mut self, now: DateTime<Utc>) -> Vec<ProducerRecord> {
        let mut records = Vec::new();
        for name in self.store_names() {
            let Some(store) = self.stores.get_mut(&name) else {
                continue;
            };
            let topic = store.changelog_topic().to_string();
            for entry in store.take_changelog() {
                records.push(ProducerRecord {
                    topic: topic.clone(),
                    partition: Some(self.id.partition),
                    key: entry.key,
                    value: entry.value,
                    timestamp: now,
                });
                self.metrics.changelog_writes += 1;
            }
        }
        records.append(&mut self.output);
        records
    }

    /// Puts back output that could not be written, ahead of anything newer.
    pub(crate) fn requeue(&mut self, mut records: Vec<ProducerRecord>) {
        records.append(&mut self.output);
        self.output = records;
    }

    /// Captures store contents. `changelog_offsets` are the changelog end
    /// offsets the contents correspond to.
    pub fn checkpoint(
        &self,
        changelog_offsets: &BTreeMap<String, u64>,
        now: DateTime<Utc>,
    ) -> TaskCheckpoint {
        let stores = self
            .stores
            .iter()
            .map(|(name, store)| {
                (
                    name.clone(),
                    StoreCheckpoint {
                        changelog_offset: changelog_offsets.get(name).copied().unwrap_or(0),
                        entries: store.snapshot(),
                    },
                )
            })
            .collect();
        TaskCheckpoint {
            task: self.id.to_string(),
            written_at: Some(now),
            stores,
        }
    }

    fn visit(&mut self, index: usize, record: &StreamRecord, now: DateTime<Utc>) -> Result<()> {
        let partition = self.id.partition;
        let Some(node) = self.nodes.get_mut(&index) else {
            return Ok(());
        };

        let emitted = match &mut node.kind {
            TaskNodeKind::Source => vec![Emitted {
                target: None,
                record: record.clone(),
            }],
            TaskNodeKind::Sink { topic } => {
                self.output.push(ProducerRecord {
                    topic: topic.clone(),
                    partition: None,
                    key: record.key.clone(),
                    value: Some(record.value.clone()),
                    timestamp: record.timestamp,
                });
                self.metrics.records_produced += 1;
                return Ok(());
            }
            TaskNodeKind::Processor {
                processor, stores, ..
            } => {
                let mut ctx = ProcessorContext::new(
                    &node.name,
                    partition,
                    record.topic.clone(),
                    now,
                    &mut self.stores,
                    stores,
                    &mut self.metrics,
                );
                processor.process(record, &mut ctx)?;
                ctx.into_parts().0
            }
        };
        self.deliver(index, emitted, now)
    }

    fn deliver(&mut self, from: usize, emitted: Vec<Emitted>, now: DateTime<Utc>) -> Result<()> {
        if emitted.is_empty() {
            return Ok(());
        }
        let children: Vec<(usize, String)> = match self.nodes.get(&from) {
            Some(node) => node
                .children
                .iter()
                .filter_map(|c| self.nodes.get(c).map(|n| (*c, n.name.clone())))
                .collect(),
            None => return Ok(()),
        };
        for Emitted { target, record } in emitted {
            for (child, name) in &children {
                if target.as_ref().is_none_or(|t| t == name) {
                    self.visit(*child, &record, now)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for StreamTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTask")
            .field("id", &self.id)
            .field("sources", &self.sources)
            .field("stores", &self.store_names())
            .field("positions", &self.positions)
            .finish_non_exhaustive()
    }
}
