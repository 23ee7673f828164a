use crate::core::{RegistryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Live counters of one pipeline.
///
/// Admission counters are written by the queue under its buffer lock, drain counters by
/// the drain loop; readers only ever take snapshots.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    accepted: AtomicU64,
    replayed: AtomicU64,
    overflowed: AtomicU64,
    expired: AtomicU64,
    overridden: AtomicU64,
    pending: AtomicU64,
    max_buffer_seen: AtomicU64,
    batches_drained: AtomicU64,
    items_delivered: AtomicU64,
    delivery_failures: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replayed(&self, count: usize) {
        self.replayed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_overflowed(&self, count: usize) {
        self.overflowed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self, count: usize) {
        self.expired.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_overridden(&self) {
        self.overridden.fetch_add(1, Ordering::Relaxed);
    }

    /// Publishes the buffer size and raises the high-water mark.
    pub(crate) fn set_pending(&self, pending: usize) {
        let pending = pending as u64;
        self.pending.store(pending, Ordering::Relaxed);
        self.max_buffer_seen.fetch_max(pending, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_drained(&self) {
        self.batches_drained.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self, count: usize) {
        self.items_delivered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn replayed(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn overridden(&self) -> u64 {
        self.overridden.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn max_buffer_seen(&self) -> u64 {
        self.max_buffer_seen.load(Ordering::Relaxed)
    }

    pub fn batches_drained(&self) -> u64 {
        self.batches_drained.load(Ordering::Relaxed)
    }

    pub fn items_delivered(&self) -> u64 {
        self.items_delivered.load(Ordering::Relaxed)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, name: &str, capacity: usize) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            name: name.to_string(),
            capacity,
            accepted: self.accepted(),
            replayed: self.replayed(),
            overflowed: self.overflowed(),
            expired: self.expired(),
            overridden: self.overridden(),
            pending: self.pending(),
            max_buffer_seen: self.max_buffer_seen(),
            batches_drained: self.batches_drained(),
            items_delivered: self.items_delivered(),
            delivery_failures: self.delivery_failures(),
            taken_at: Utc::now(),
        }
    }
}

/// Point-in-time copy of a pipeline's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMetricsSnapshot {
    pub name: String,
    pub capacity: usize,
    pub accepted: u64,
    pub replayed: u64,
    pub overflowed: u64,
    pub expired: u64,
    pub overridden: u64,
    pub pending: u64,
    pub max_buffer_seen: u64,
    pub batches_drained: u64,
    pub items_delivered: u64,
    pub delivery_failures: u64,
    pub taken_at: DateTime<Utc>,
}

impl std::fmt::Display for PipelineMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, AcceptedTasks:{}, ReplayedTasks:{}, QueueOverflows:{}, PendingTaskSize:{}, ExpiredTasks:{}, OverriddenTasks:{}, MaxBuffer:{}/{}",
            self.name,
            self.accepted,
            self.replayed,
            self.overflowed,
            self.pending,
            self.expired,
            self.overridden,
            self.max_buffer_seen,
            self.capacity
        )
    }
}

/// Anything that can report pipeline counters under a stable name.
pub trait PipelineMetricsSource: Send + Sync {
    fn pipeline_name(&self) -> &str;

    fn metrics_snapshot(&self) -> PipelineMetricsSnapshot;
}

/// Named set of pipelines polled by reporting.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<BTreeMap<String, Arc<dyn PipelineMetricsSource>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: Arc<dyn PipelineMetricsSource>) -> Result<()> {
        let name = source.pipeline_name().to_string();
        let mut pipelines = self
            .pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if pipelines.contains_key(&name) {
            return Err(RegistryError::InvalidConfiguration(format!(
                "pipeline '{}' is already registered",
                name
            )));
        }
        pipelines.insert(name, source);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self, name: &str) -> Option<PipelineMetricsSnapshot> {
        self.pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|source| source.metrics_snapshot())
    }

    /// Snapshots of every pipeline, ordered by name.
    pub fn snapshots(&self) -> Vec<PipelineMetricsSnapshot> {
        let sources = self
            .pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        sources
            .iter()
            .map(|source| source.metrics_snapshot())
            .collect()
    }
}
