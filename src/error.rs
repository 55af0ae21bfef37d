//! Error types for the streams engine.
//!
//! The library reports failures through these enums; the binary wraps them in
//! `anyhow` at the edges.

use thiserror::Error;

/// Main engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("event log error: {0}")]
    Log(#[from] LogError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    /// A record value did not match the payload a processor expects
    #[error("failed to decode record on '{topic}' at key '{key}': {source}")]
    Decode {
        topic: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker stopped because one of its partitions could not continue
    #[error("worker {worker} failed: {reason}")]
    WorkerFailed { worker: usize, reason: String },
}

/// Raised while building or validating a topology
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    #[error("node name '{0}' is already in use")]
    DuplicateNode(String),

    #[error("node '{node}' names unknown parent '{parent}'")]
    UnknownParent { node: String, parent: String },

    #[error("node '{node}' cannot have a sink '{parent}' as parent")]
    SinkAsParent { node: String, parent: String },

    #[error("node '{0}' has no parents")]
    NoParents(String),

    #[error("topic '{0}' is already read by another source")]
    TopicAlreadySourced(String),

    #[error("processor '{processor}' uses unregistered store '{store}'")]
    UnknownStore { processor: String, store: String },

    #[error("store '{0}' is already registered")]
    DuplicateStore(String),

    #[error("store '{store}' is shared by processors in different sub-topologies")]
    StoreSpansSubTopologies { store: String },

    #[error("processor '{processor}' requires records keyed by '{required}' but receives '{actual}'")]
    KeyMismatch {
        processor: String,
        required: String,
        actual: String,
    },

    #[error(
        "processor '{processor}' requires partitioning by '{required}' but upstream '{upstream}' re-keyed without a repartition"
    )]
    MissingRepartition {
        processor: String,
        required: String,
        upstream: String,
    },

    #[error("topology has no sources")]
    Empty,
}

/// State store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store '{0}' is not available to this processor")]
    NotConnected(String),

    #[error("failed to encode value for key '{key}' in store '{store}': {source}")]
    Encode {
        store: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt value for key '{key}' in store '{store}': {source}")]
    Corrupt {
        store: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("restore of store '{store}' partition {partition} failed: {reason}")]
    RestoreFailed {
        store: String,
        partition: u32,
        reason: String,
    },

    #[error("checkpoint I/O failed: {0}")]
    Checkpoint(#[from] std::io::Error),
}

/// Event log failures
#[derive(Error, Debug)]
pub enum LogError {
    #[error("topic '{0}' does not exist")]
    UnknownTopic(String),

    #[error("topic '{topic}' has no partition {partition}")]
    UnknownPartition { topic: String, partition: u32 },

    #[error("topic '{topic}' already exists with {existing} partitions, requested {requested}")]
    PartitionMismatch {
        topic: String,
        existing: u32,
        requested: u32,
    },

    #[error("log unavailable: {0}")]
    Unavailable(String),
}

/// Malformed input rejected at the producer boundary
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{field} must not be blank")]
    Blank { field: &'static str },

    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },

    #[error("amountKes must be positive, got {0}")]
    NonPositiveAmount(String),
}

/// Invalid settings
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;
