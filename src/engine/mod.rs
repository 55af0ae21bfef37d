//! The stream topology engine.
//!
//! Build a [`Topology`] with [`TopologyBuilder`], then hand it to
//! [`StreamsRuntime::start`] together with an [`crate::log::EventLog`].

pub mod checkpoint;
pub mod clock;
pub mod metrics;
pub mod ops;
pub mod processor;
pub mod runtime;
pub mod store;
pub mod task;
pub mod topology;
pub mod window;

pub use checkpoint::{CheckpointDir, StoreCheckpoint, TaskCheckpoint};
pub use clock::{Clock, ManualClock, SystemClock};
pub use metrics::TaskMetrics;
pub use ops::{BranchBuilder, filter, map_values, peek, select_key};
pub use processor::{Processor, ProcessorContext, ProcessorSupplier, StreamRecord, supplier};
pub use runtime::{RuntimeConfig, RuntimeReport, StreamsRuntime, TaskFailure};
pub use store::KeyValueStore;
pub use task::{StreamTask, TaskId};
pub use topology::{Keying, ProcessorNode, SubTopology, Topology, TopologyBuilder};
pub use window::{TimeWindow, TumblingWindows, WindowAggregate, WindowedAggregator};
