//! Topology construction and validation.
//!
//! A topology is a DAG of sources, processors and sinks. Parents must exist
//! before a node naming them is added, so insertion order is already a
//! topological order and cycles cannot be expressed.
//!
//! [`TopologyBuilder::build`] tracks which key each node's records are keyed
//! by, and whether they are still physically partitioned by that key. A
//! processor that re-keys breaks partitioning until the records pass through
//! a repartition topic; a stateful processor that sees records in that state
//! is rejected, because its store would see one key's records on several
//! partitions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use super::processor::ProcessorSupplier;
use crate::error::TopologyError;
use crate::topics;

/// How a processor treats the key of the records it forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keying {
    Preserves,
    /// Forwards records under a new key, named for validation.
    Rekeys(String),
}

#[derive(Clone)]
pub struct ProcessorNode {
    pub(crate) supplier: ProcessorSupplier,
    pub(crate) keying: Keying,
    pub(crate) stores: Vec<String>,
    pub(crate) required_key: Option<String>,
}

impl ProcessorNode {
    pub fn new(supplier: ProcessorSupplier) -> Self {
        Self {
            supplier,
            keying: Keying::Preserves,
            stores: Vec::new(),
            required_key: None,
        }
    }

    pub fn rekeys(mut self, new_key: &str) -> Self {
        self.keying = Keying::Rekeys(new_key.to_string());
        self
    }

    pub fn with_stores(mut self, stores: &[&str]) -> Self {
        self.stores = stores.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Declares the key this processor's stores are partitioned by.
    pub fn requires_key(mut self, key: &str) -> Self {
        self.required_key = Some(key.to_string());
        self
    }

    pub fn is_stateful(&self) -> bool {
        !self.stores.is_empty()
    }
}

impl fmt::Debug for ProcessorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorNode")
            .field("keying", &self.keying)
            .field("stores", &self.stores)
            .field("required_key", &self.required_key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    Source { topic: String, key: String },
    Processor(ProcessorNode),
    Sink { topic: String },
}

#[derive(Debug, Clone)]
pub(crate) struct NodeDef {
    pub name: String,
    pub kind: NodeKind,
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
}

/// A connected group of nodes. One task runs per sub-topology and partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTopology {
    pub id: usize,
    pub(crate) nodes: Vec<usize>,
    pub source_topics: Vec<String>,
    pub stores: Vec<String>,
}

#[derive(Debug)]
pub struct TopologyBuilder {
    application_id: String,
    nodes: Vec<NodeDef>,
    index: HashMap<String, usize>,
    stores: BTreeSet<String>,
    repartition_topics: BTreeSet<String>,
}

impl TopologyBuilder {
    pub fn new(application_id: &str) -> Self {
        Self {
            application_id: application_id.to_string(),
            nodes: Vec::new(),
            index: HashMap::new(),
            stores: BTreeSet::new(),
            repartition_topics: BTreeSet::new(),
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Reads `topic`, whose records are keyed by `key`.
    pub fn add_source(
        &mut self,
        name: &str,
        topic: &str,
        key: &str,
    ) -> Result<&mut Self, TopologyError> {
        let taken = self
            .nodes
            .iter()
            .any(|n| matches!(&n.kind, NodeKind::Source { topic: t, .. } if t == topic));
        if taken {
            return Err(TopologyError::TopicAlreadySourced(topic.to_string()));
        }
        self.insert(
            name,
            NodeKind::Source {
                topic: topic.to_string(),
                key: key.to_string(),
            },
            &[],
        )?;
        Ok(self)
    }

    pub fn add_processor(
        &mut self,
        name: &str,
        processor: ProcessorNode,
        parents: &[&str],
    ) -> Result<&mut Self, TopologyError> {
        self.insert(name, NodeKind::Processor(processor), parents)?;
        Ok(self)
    }

    pub fn add_sink(
        &mut self,
        name: &str,
        topic: &str,
        parents: &[&str],
    ) -> Result<&mut Self, TopologyError> {
        self.insert(
            name,
            NodeKind::Sink {
                topic: topic.to_string(),
            },
            parents,
        )?;
        Ok(self)
    }

    pub fn add_state_store(&mut self, name: &str) -> Result<&mut Self, TopologyError> {
        if !self.stores.insert(name.to_string()) {
            return Err(TopologyError::DuplicateStore(name.to_string()));
        }
        Ok(self)
    }

    /// Routes the parent's records through an internal topic so that they
    /// land on the partition of their current key, which must be `key`.
    ///
    /// Adds a sink `<name>-sink` and a source `<name>-source`; returns the
    /// source name for downstream nodes to attach to.
    pub fn add_repartition(
        &mut self,
        name: &str,
        key: &str,
        parent: &str,
    ) -> Result<String, TopologyError> {
        let topic = topics::repartition(&self.application_id, name);
        let sink = format!("{name}-sink");
        let source = format!("{name}-source");

        self.add_sink(&sink, &topic, &[parent])?;
        self.add_source(&source, &topic, key)?;
        self.repartition_topics.insert(topic);
        Ok(source)
    }

    pub fn build(self) -> Result<Topology, TopologyError> {
        if !self
            .nodes
            .iter()
            .any(|n| matches!(n.kind, NodeKind::Source { .. }))
        {
            return Err(TopologyError::Empty);
        }

        self.check_stores()?;
        self.check_keys()?;

        let sub_topologies = self.group()?;
        let stores = self
            .stores
            .iter()
            .map(|s| (s.clone(), topics::changelog(&self.application_id, s)))
            .collect();

        Ok(Topology {
            application_id: self.application_id,
            nodes: self.nodes,
            stores,
            sub_topologies,
            repartition_topics: self.repartition_topics.into_iter().collect(),
        })
    }

    fn insert(
        &mut self,
        name: &str,
        kind: NodeKind,
        parents: &[&str],
    ) -> Result<usize, TopologyError> {
        if self.index.contains_key(name) {
            return Err(TopologyError::DuplicateNode(name.to_string()));
        }
        if !matches!(kind, NodeKind::Source { .. }) && parents.is_empty() {
            return Err(TopologyError::NoParents(name.to_string()));
        }

        let mut parent_ids = Vec::with_capacity(parents.len());
        for parent in parents {
            let id = *self
                .index
                .get(*parent)
                .ok_or_else(|| TopologyError::UnknownParent {
                    node: name.to_string(),
                    parent: parent.to_string(),
                })?;
            if matches!(self.nodes[id].kind, NodeKind::Sink { .. }) {
                return Err(TopologyError::SinkAsParent {
                    node: name.to_string(),
                    parent: parent.to_string(),
                });
            }
            parent_ids.push(id);
        }

        let id = self.nodes.len();
        for parent in &parent_ids {
            self.nodes[*parent].children.push(id);
        }
        self.nodes.push(NodeDef {
            name: name.to_string(),
            kind,
            parents: parent_ids,
            children: Vec::new(),
        });
        self.index.insert(name.to_string(), id);
        Ok(id)
    }

    fn check_stores(&self) -> Result<(), TopologyError> {
        for node in &self.nodes {
            if let NodeKind::Processor(p) = &node.kind {
                if let Some(store) = p.stores.iter().find(|s| !self.stores.contains(*s)) {
                    return Err(TopologyError::UnknownStore {
                        processor: node.name.clone(),
                        store: store.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_keys(&self) -> Result<(), TopologyError> {
        let mut states: Vec<KeyState> = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let input = match &node.kind {
                NodeKind::Source { key, .. } => KeyState {
                    key: key.clone(),
                    partitioned: true,
                    rekeyed_by: None,
                },
                _ => merge(&node.name, node.parents.iter().map(|p| &states[*p]))?,
            };

            let output = match &node.kind {
                NodeKind::Processor(p) => {
                    if p.is_stateful() || p.required_key.is_some() {
                        check_stateful_input(&node.name, p, &input)?;
                    }
                    match &p.keying {
                        Keying::Preserves => input,
                        Keying::Rekeys(key) => KeyState {
                            key: key.clone(),
                            partitioned: false,
                            rekeyed_by: Some(node.name.clone()),
                        },
                    }
                }
                NodeKind::Sink { topic } if self.repartition_topics.contains(topic) => {
                    // the matching source declares the key it expects
                    let expected = self.nodes.iter().find_map(|n| match &n.kind {
                        NodeKind::Source { topic: t, key } if t == topic => Some(key),
                        _ => None,
                    });
                    if let Some(expected) = expected {
                        if *expected != input.key {
                            return Err(TopologyError::KeyMismatch {
                                processor: node.name.clone(),
                                required: expected.clone(),
                                actual: input.key,
                            });
                        }
                    }
                    input
                }
                _ => input,
            };
            states.push(output);
        }
        Ok(())
    }

    /// Splits nodes into connected components along parent edges.
    fn group(&self) -> Result<Vec<SubTopology>, TopologyError> {
        let mut component: Vec<usize> = (0..self.nodes.len()).collect();
        fn find(component: &mut [usize], mut i: usize) -> usize {
            while component[i] != i {
                component[i] = component[component[i]];
                i = component[i];
            }
            i
        }

        for (id, node) in self.nodes.iter().enumerate() {
            for parent in &node.parents {
                let a = find(&mut component, id);
                let b = find(&mut component, *parent);
                component[a.max(b)] = a.min(b);
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for id in 0..self.nodes.len() {
            let root = find(&mut component, id);
            groups.entry(root).or_default().push(id);
        }

        let mut store_owner: HashMap<&str, usize> = HashMap::new();
        let mut sub_topologies = Vec::with_capacity(groups.len());
        for (id, nodes) in groups.into_values().enumerate() {
            let mut source_topics = Vec::new();
            let mut stores = BTreeSet::new();
            for n in &nodes {
                match &self.nodes[*n].kind {
                    NodeKind::Source { topic, .. } => source_topics.push(topic.clone()),
                    NodeKind::Processor(p) => {
                        for store in &p.stores {
                            if let Some(owner) = store_owner.insert(store, id) {
                                if owner != id {
                                    return Err(TopologyError::StoreSpansSubTopologies {
                                        store: store.clone(),
                                    });
                                }
                            }
                            stores.insert(store.clone());
                        }
                    }
                    NodeKind::Sink { .. } => {}
                }
            }
            sub_topologies.push(SubTopology {
                id,
                nodes,
                source_topics,
                stores: stores.into_iter().collect(),
            });
        }
        Ok(sub_topologies)
    }
}

#[derive(Debug, Clone)]
struct KeyState {
    key: String,
    partitioned: bool,
    rekeyed_by: Option<String>,
}

fn merge<'a>(
    node: &str,
    mut parents: impl Iterator<Item = &'a KeyState>,
) -> Result<KeyState, TopologyError> {
    let first = parents
        .next()
        .cloned()
        .ok_or_else(|| TopologyError::NoParents(node.to_string()))?;
    parents.try_fold(first, |acc, next| {
        if acc.key != next.key {
            return Err(TopologyError::KeyMismatch {
                processor: node.to_string(),
                required: acc.key.clone(),
                actual: next.key.clone(),
            });
        }
        Ok(KeyState {
            key: acc.key,
            partitioned: acc.partitioned && next.partitioned,
            rekeyed_by: acc.rekeyed_by.or_else(|| next.rekeyed_by.clone()),
        })
    })
}

fn check_stateful_input(
    name: &str,
    processor: &ProcessorNode,
    input: &KeyState,
) -> Result<(), TopologyError> {
    let required = processor.required_key.as_ref().unwrap_or(&input.key);
    if *required != input.key {
        return Err(TopologyError::KeyMismatch {
            processor: name.to_string(),
            required: required.clone(),
            actual: input.key.clone(),
        });
    }
    if !input.partitioned {
        return Err(TopologyError::MissingRepartition {
            processor: name.to_string(),
            required: required.clone(),
            upstream: input.rekeyed_by.clone().unwrap_or_default(),
        });
    }
    Ok(())
}

/// A validated topology, ready to be run by [`super::StreamsRuntime`].
#[derive(Debug)]
pub struct Topology {
    application_id: String,
    pub(crate) nodes: Vec<NodeDef>,
    stores: BTreeMap<String, String>,
    sub_topologies: Vec<SubTopology>,
    repartition_topics: Vec<String>,
}

impl Topology {
    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn sub_topologies(&self) -> &[SubTopology] {
        &self.sub_topologies
    }

    pub fn changelog_topic(&self, store: &str) -> Option<&str> {
        self.stores.get(store).map(String::as_str)
    }

    /// Repartition and changelog topics the runtime must create.
    pub fn internal_topics(&self) -> Vec<String> {
        self.repartition_topics
            .iter()
            .chain(self.stores.values())
            .cloned()
            .collect()
    }

    /// Topics read by the topology that it does not write itself.
    pub fn external_source_topics(&self) -> Vec<String> {
        self.sub_topologies
            .iter()
            .flat_map(|s| s.source_topics.iter())
            .filter(|t| !self.repartition_topics.contains(t))
            .cloned()
            .collect()
    }

    /// Topics written by sinks, excluding repartition topics.
    pub fn sink_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Sink { topic } if !self.repartition_topics.contains(topic) => {
                    Some(topic.clone())
                }
                _ => None,
            })
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Topology: {}", self.application_id)?;
        for sub in &self.sub_topologies {
            writeln!(f, "  Sub-topology: {}", sub.id)?;
            for id in &sub.nodes {
                let node = &self.nodes[*id];
                match &node.kind {
                    NodeKind::Source { topic, key } => {
                        writeln!(f, "    Source: {} (topic: {topic}, key: {key})", node.name)?
                    }
                    NodeKind::Processor(p) => {
                        writeln!(f, "    Processor: {} (stores: {:?})", node.name, p.stores)?
                    }
                    NodeKind::Sink { topic } => {
                        writeln!(f, "    Sink: {} (topic: {topic})", node.name)?
                    }
                }
                let children: Vec<&str> = node
                    .children
                    .iter()
                    .map(|c| self.nodes[*c].name.as_str())
                    .collect();
                if !children.is_empty() {
                    writeln!(f, "      --> {}", children.join(", "))?;
                }
            }
        }
        Ok(())
    }
}
