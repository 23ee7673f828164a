use super::queue::TaskAdmissionQueue;
use super::sink::PushSink;
use crate::config::PipelineConfig;
use crate::core::{RegistryError, Result};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// What one drain cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainCycleReport {
    pub drained: usize,
    pub delivered: usize,
    /// Failed items put back into the queue.
    pub replayed: usize,
    /// Sink failure reason, if delivery failed.
    pub failure: Option<String>,
}

/// Moves batches from a [`TaskAdmissionQueue`] to a [`PushSink`].
///
/// Undelivered items are replayed into the queue, never dropped here. The loop does not
/// log; its outcome is visible through the queue's pipeline metrics.
pub struct TaskDrainLoop<K, P> {
    queue: Arc<TaskAdmissionQueue<K, P>>,
    sink: Arc<dyn PushSink<K, P>>,
    batch_size: usize,
    interval: Duration,
}

impl<K, P> TaskDrainLoop<K, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    pub fn new(
        queue: Arc<TaskAdmissionQueue<K, P>>,
        sink: Arc<dyn PushSink<K, P>>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            queue,
            sink,
            batch_size: config.batch_size,
            interval: config.drain_interval(),
        })
    }

    pub fn queue(&self) -> &Arc<TaskAdmissionQueue<K, P>> {
        &self.queue
    }

    /// Drains one batch and delivers it.
    pub async fn run_cycle(&self) -> DrainCycleReport {
        let batch = self.queue.drain_batch(self.batch_size);
        if batch.is_empty() {
            return DrainCycleReport::default();
        }

        let metrics = self.queue.metrics();
        let drained = batch.len();
        metrics.record_batch_drained();

        match self.sink.deliver(batch).await {
            Ok(()) => {
                metrics.record_delivered(drained);
                DrainCycleReport {
                    drained,
                    delivered: drained,
                    ..DrainCycleReport::default()
                }
            }
            Err(failure) => {
                let delivered = drained.saturating_sub(failure.failed.len());
                metrics.record_delivery_failure();
                metrics.record_delivered(delivered);
                let outcome = self.queue.replay(failure.failed);
                DrainCycleReport {
                    drained,
                    delivered,
                    replayed: outcome.requeued,
                    failure: Some(failure.reason),
                }
            }
        }
    }

    /// Runs cycles until the queue is empty, returning the number of items delivered.
    ///
    /// Stops early if a cycle fails, so a broken sink cannot spin on replayed items.
    pub async fn flush(&self) -> usize {
        let mut delivered = 0;
        loop {
            let report = self.run_cycle().await;
            delivered += report.delivered;
            if report.drained == 0 || report.failure.is_some() {
                return delivered;
            }
        }
    }

    /// Runs the loop on the tokio runtime until the returned worker is stopped.
    ///
    /// A full batch is followed immediately by another cycle; otherwise the loop waits
    /// for the drain interval. Stop requests are honored between cycles only.
    pub fn spawn(self) -> DrainWorker {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            loop {
                let report = self.run_cycle().await;
                let backlog = report.drained == self.batch_size && report.failure.is_none();
                if backlog {
                    match stop_rx.try_recv() {
                        Err(TryRecvError::Empty) => continue,
                        _ => break,
                    }
                }

                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(self.interval) => {}
                }
            }
        });

        DrainWorker {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }
}

/// Handle to a spawned [`TaskDrainLoop`].
pub struct DrainWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl DrainWorker {
    /// Signals the loop to stop after its current cycle and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| RegistryError::WorkerJoin(format!("drain worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for DrainWorker {
    fn drop(&mut self) {
        // no abort: an in-flight batch still finishes delivery or is replayed
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::queue::TaskItem;
    use crate::dispatch::sink::DeliveryFailure;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlakySink {
        failures_left: AtomicUsize,
        delivered: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl PushSink<&'static str, u32> for FlakySink {
        async fn deliver(
            &self,
            batch: Vec<TaskItem<&'static str, u32>>,
        ) -> std::result::Result<(), DeliveryFailure<&'static str, u32>> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                // first item goes through, the rest bounce
                let mut batch = batch;
                let first = batch.remove(0);
                self.delivered.lock().unwrap().push(first.key);
                return Err(DeliveryFailure::new(batch, "watcher unreachable"));
            }
            let mut delivered = self.delivered.lock().unwrap();
            delivered.extend(batch.into_iter().map(|item| item.key));
            Ok(())
        }
    }

    fn pipeline(
        failures: usize,
    ) -> (
        Arc<TaskAdmissionQueue<&'static str, u32>>,
        Arc<FlakySink>,
        TaskDrainLoop<&'static str, u32>,
    ) {
        let config = PipelineConfig::new("drain").capacity(16).batch_size(3);
        let queue = Arc::new(TaskAdmissionQueue::new(&config).unwrap());
        let sink = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(failures),
            ..FlakySink::default()
        });
        let drain = TaskDrainLoop::new(queue.clone(), sink.clone(), &config).unwrap();
        (queue, sink, drain)
    }

    #[tokio::test]
    async fn test_empty_cycle_is_noop() {
        let (queue, _sink, drain) = pipeline(0);
        assert_eq!(drain.run_cycle().await, DrainCycleReport::default());
        assert_eq!(queue.metrics().batches_drained(), 0);
    }

    #[tokio::test]
    async fn test_failed_subset_is_replayed() {
        let (queue, sink, drain) = pipeline(1);
        for key in ["a", "b", "c", "d"] {
            queue.submit(key, 1);
        }

        let report = drain.run_cycle().await;
        assert_eq!(report.drained, 3);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.replayed, 2);
        assert_eq!(report.failure.as_deref(), Some("watcher unreachable"));
        assert_eq!(queue.pending_keys(), vec!["b", "c", "d"]);

        assert_eq!(drain.flush().await, 3);
        assert_eq!(*sink.delivered.lock().unwrap(), vec!["a", "b", "c", "d"]);

        let metrics = queue.metrics();
        assert_eq!(metrics.replayed(), 2);
        assert_eq!(metrics.pending(), 0);
        assert_eq!(metrics.overflowed(), 0);
        assert_eq!(metrics.batches_drained(), 2);
        assert_eq!(metrics.items_delivered(), 4);
        assert_eq!(metrics.delivery_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_worker_drains_and_stops() {
        let (queue, sink, drain) = pipeline(0);
        let worker = drain.spawn();

        for (n, key) in ["k0", "k1", "k2", "k3", "k4", "k5", "k6"].into_iter().enumerate() {
            queue.submit(key, n as u32);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(sink.delivered.lock().unwrap().len(), 7);
        assert!(queue.is_empty());
        worker.stop().await.unwrap();
    }
}
