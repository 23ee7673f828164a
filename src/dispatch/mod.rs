//! Batched task dispatch.
//!
//! Producers submit keyed push tasks into a [`TaskAdmissionQueue`], which merges repeated
//! keys, bounds its size and ages items out. A [`TaskDrainLoop`] moves batches to a
//! [`PushSink`] and replays whatever the sink could not deliver.

pub mod drain;
pub mod metrics;
pub mod queue;
pub mod sink;

pub use drain::{DrainCycleReport, DrainWorker, TaskDrainLoop};
pub use metrics::{
    PipelineMetrics, PipelineMetricsSnapshot, PipelineMetricsSource, PipelineRegistry,
};
pub use queue::{Admission, ReplayOutcome, TaskAdmissionQueue, TaskItem};
pub use sink::{CoalescingSink, DeliveryFailure, MergeMetrics, MergeMetricsSource, PushSink};
