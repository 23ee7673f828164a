use super::queue::TaskItem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Items a sink could not deliver, handed back for replay.
#[derive(Debug)]
pub struct DeliveryFailure<K, P> {
    pub failed: Vec<TaskItem<K, P>>,
    pub reason: String,
}

impl<K, P> DeliveryFailure<K, P> {
    pub fn new(failed: Vec<TaskItem<K, P>>, reason: impl Into<String>) -> Self {
        Self {
            failed,
            reason: reason.into(),
        }
    }
}

/// Counters of a sink that merges tasks before sending them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMetrics {
    pub put_tasks: u64,
    pub send_tasks: u64,
    pub pending_tasks: u64,
    pub overridden_tasks: u64,
}

/// Capability of sinks that merge tasks and count what they merged.
pub trait MergeMetricsSource: Send + Sync {
    fn merge_metrics(&self) -> MergeMetrics;
}

/// Downstream receiver of drained batches (push to watchers, replication, ...).
#[async_trait]
pub trait PushSink<K, P>: Send + Sync
where
    K: Send + 'static,
    P: Send + 'static,
{
    /// Delivers a batch. On failure, returns the items that were not delivered.
    async fn deliver(&self, batch: Vec<TaskItem<K, P>>) -> Result<(), DeliveryFailure<K, P>>;

    /// Merge counters, for sinks that have the capability.
    fn merge_metrics_source(&self) -> Option<&dyn MergeMetricsSource> {
        None
    }
}

#[derive(Debug, Default)]
struct MergeCounters {
    put_tasks: AtomicU64,
    send_tasks: AtomicU64,
    pending_tasks: AtomicU64,
    overridden_tasks: AtomicU64,
}

impl MergeMetricsSource for MergeCounters {
    fn merge_metrics(&self) -> MergeMetrics {
        MergeMetrics {
            put_tasks: self.put_tasks.load(Ordering::Relaxed),
            send_tasks: self.send_tasks.load(Ordering::Relaxed),
            pending_tasks: self.pending_tasks.load(Ordering::Relaxed),
            overridden_tasks: self.overridden_tasks.load(Ordering::Relaxed),
        }
    }
}

/// Sink adapter that collapses a batch to one item per group before forwarding it.
///
/// `group_of` maps a task key to its merge group (e.g. many subscriber keys of one data
/// id). Within a group the newest item wins; groups keep first-seen order.
pub struct CoalescingSink<K, G, S> {
    inner: S,
    group_of: Box<dyn Fn(&K) -> G + Send + Sync>,
    counters: MergeCounters,
}

impl<K, G, S> CoalescingSink<K, G, S> {
    pub fn new(inner: S, group_of: impl Fn(&K) -> G + Send + Sync + 'static) -> Self {
        Self {
            inner,
            group_of: Box::new(group_of),
            counters: MergeCounters::default(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<K, P, G, S> PushSink<K, P> for CoalescingSink<K, G, S>
where
    K: Send + Sync + 'static,
    P: Send + 'static,
    G: Eq + Hash + Send + 'static,
    S: PushSink<K, P>,
{
    async fn deliver(&self, batch: Vec<TaskItem<K, P>>) -> Result<(), DeliveryFailure<K, P>> {
        let put = batch.len() as u64;
        self.counters.put_tasks.fetch_add(put, Ordering::Relaxed);
        self.counters.pending_tasks.fetch_add(put, Ordering::Relaxed);

        let mut slots: HashMap<G, usize> = HashMap::new();
        let mut merged: Vec<TaskItem<K, P>> = Vec::with_capacity(batch.len());
        for item in batch {
            let group = (self.group_of)(&item.key);
            match slots.get(&group) {
                Some(&index) => {
                    merged[index] = item;
                    self.counters.overridden_tasks.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    slots.insert(group, merged.len());
                    merged.push(item);
                }
            }
        }

        self.counters
            .send_tasks
            .fetch_add(merged.len() as u64, Ordering::Relaxed);
        let result = self.inner.deliver(merged).await;
        self.counters.pending_tasks.fetch_sub(put, Ordering::Relaxed);
        result
    }

    fn merge_metrics_source(&self) -> Option<&dyn MergeMetricsSource> {
        Some(&self.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        batches: Mutex<Vec<Vec<(String, u32)>>>,
    }

    #[async_trait]
    impl PushSink<String, u32> for Recording {
        async fn deliver(
            &self,
            batch: Vec<TaskItem<String, u32>>,
        ) -> Result<(), DeliveryFailure<String, u32>> {
            self.batches.lock().unwrap().push(
                batch
                    .into_iter()
                    .map(|item| (item.key, item.payload))
                    .collect(),
            );
            Ok(())
        }
    }

    fn item(key: &str, payload: u32) -> TaskItem<String, u32> {
        TaskItem::new(key.to_string(), payload)
    }

    #[tokio::test]
    async fn test_plain_sink_lacks_merge_capability() {
        let sink = Recording::default();
        assert!(PushSink::<String, u32>::merge_metrics_source(&sink).is_none());
    }

    #[tokio::test]
    async fn test_coalescing_keeps_newest_per_group() {
        let sink = CoalescingSink::new(Recording::default(), |key: &String| {
            key.split('#').next().unwrap_or_default().to_string()
        });

        sink.deliver(vec![
            item("data-1#sub-a", 1),
            item("data-2#sub-a", 1),
            item("data-1#sub-b", 2),
        ])
        .await
        .unwrap();

        let batches = sink.inner().batches.lock().unwrap().clone();
        assert_eq!(
            batches,
            vec![vec![
                ("data-1#sub-b".to_string(), 2),
                ("data-2#sub-a".to_string(), 1)
            ]]
        );

        let metrics = PushSink::<String, u32>::merge_metrics_source(&sink)
            .unwrap()
            .merge_metrics();
        assert_eq!(
            metrics,
            MergeMetrics {
                put_tasks: 3,
                send_tasks: 2,
                pending_tasks: 0,
                overridden_tasks: 1,
            }
        );
    }
}
