use crate::config::ReporterConfig;
use crate::core::{RegistryError, Result};
use crate::dispatch::{MergeMetrics, PipelineMetricsSnapshot, PipelineRegistry, PushSink};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::info;

/// Live population counts of the registry around the dispatch core.
pub trait RegistryCounters: Send + Sync {
    fn subscriber_count(&self) -> u64;
    fn publisher_count(&self) -> u64;
    fn watcher_count(&self) -> u64;
    fn connection_count(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCountsSnapshot {
    pub subscribers: u64,
    pub publishers: u64,
    pub watchers: u64,
    pub connections: u64,
}

impl std::fmt::Display for RegistryCountsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RegistryCounts, Subscribers:{}, Publishers:{}, Watchers:{}, Connections:{}",
            self.subscribers, self.publishers, self.watchers, self.connections
        )
    }
}

/// Everything one reporting tick observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSnapshot {
    pub pipelines: Vec<PipelineMetricsSnapshot>,
    pub merges: Vec<(String, MergeMetrics)>,
    pub registry: Option<RegistryCountsSnapshot>,
}

impl ReportSnapshot {
    /// One log line per pipeline, merging sink and the registry counts.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = self
            .pipelines
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        lines.extend(self.merges.iter().map(|(name, merge)| {
            format!(
                "{}, PutTasks:{}, SendTasks:{}, PendingTasks:{}, OverriddenTasks:{}",
                name,
                merge.put_tasks,
                merge.send_tasks,
                merge.pending_tasks,
                merge.overridden_tasks
            )
        }));
        if let Some(registry) = &self.registry {
            lines.push(registry.to_string());
        }
        lines
    }
}

type MergeProbe = Box<dyn Fn() -> Option<MergeMetrics> + Send + Sync>;

/// Periodically logs pipeline, merge and registry counters. It only reads.
pub struct MetricsReporter {
    config: ReporterConfig,
    pipelines: Arc<PipelineRegistry>,
    merges: Mutex<Vec<(String, MergeProbe)>>,
    counters: Option<Arc<dyn RegistryCounters>>,
}

impl MetricsReporter {
    pub fn new(config: ReporterConfig, pipelines: Arc<PipelineRegistry>) -> Self {
        Self {
            config,
            pipelines,
            merges: Mutex::new(Vec::new()),
            counters: None,
        }
    }

    pub fn with_registry_counters(mut self, counters: Arc<dyn RegistryCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Reports the sink's merge counters if it has the merge capability.
    ///
    /// Returns whether the sink is watched.
    pub fn watch_sink<K, P, S>(&self, name: &str, sink: Arc<S>) -> bool
    where
        K: Send + 'static,
        P: Send + 'static,
        S: PushSink<K, P> + 'static,
    {
        if sink.merge_metrics_source().is_none() {
            return false;
        }

        let probe: MergeProbe = Box::new(move || {
            sink.merge_metrics_source()
                .map(|source| source.merge_metrics())
        });
        self.merges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), probe));
        true
    }

    pub fn collect(&self) -> ReportSnapshot {
        let merges = self
            .merges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(name, probe)| probe().map(|metrics| (name.clone(), metrics)))
            .collect();

        ReportSnapshot {
            pipelines: self.pipelines.snapshots(),
            merges,
            registry: self.counters.as_ref().map(|counters| RegistryCountsSnapshot {
                subscribers: counters.subscriber_count(),
                publishers: counters.publisher_count(),
                watchers: counters.watcher_count(),
                connections: counters.connection_count(),
            }),
        }
    }

    /// Collects and logs one report.
    pub fn report_once(&self) -> ReportSnapshot {
        let report = self.collect();
        for line in report.lines() {
            info!(target: "registry_core::metrics", "{}", line);
        }
        report
    }

    pub fn interval(&self) -> Duration {
        self.config.interval()
    }

    pub fn spawn(self: Arc<Self>) -> ReporterWorker {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval(self.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = ticker.tick() => {
                        self.report_once();
                    }
                }
            }
        });

        ReporterWorker {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }
}

pub struct ReporterWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ReporterWorker {
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| RegistryError::WorkerJoin(format!("reporter join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for ReporterWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::dispatch::{CoalescingSink, DeliveryFailure, TaskAdmissionQueue, TaskItem};
    use async_trait::async_trait;

    struct Discard;

    #[async_trait]
    impl PushSink<u32, u32> for Discard {
        async fn deliver(
            &self,
            _batch: Vec<TaskItem<u32, u32>>,
        ) -> std::result::Result<(), DeliveryFailure<u32, u32>> {
            Ok(())
        }
    }

    struct FixedCounts;

    impl RegistryCounters for FixedCounts {
        fn subscriber_count(&self) -> u64 {
            4
        }
        fn publisher_count(&self) -> u64 {
            3
        }
        fn watcher_count(&self) -> u64 {
            2
        }
        fn connection_count(&self) -> u64 {
            1
        }
    }

    #[test]
    fn test_only_merging_sinks_are_watched() {
        let reporter =
            MetricsReporter::new(ReporterConfig::default(), Arc::new(PipelineRegistry::new()));
        assert!(!reporter.watch_sink::<u32, u32, _>("plain", Arc::new(Discard)));

        let merging = CoalescingSink::new(Discard, |key: &u32| *key % 2);
        assert!(reporter.watch_sink::<u32, u32, _>("merged", Arc::new(merging)));

        let report = reporter.collect();
        assert_eq!(report.merges.len(), 1);
        assert_eq!(report.merges[0].0, "merged");
    }

    #[test]
    fn test_report_lines() {
        let pipelines = Arc::new(PipelineRegistry::new());
        let queue = Arc::new(
            TaskAdmissionQueue::<u32, u32>::new(&PipelineConfig::new("push").capacity(4)).unwrap(),
        );
        queue.submit(1, 1);
        pipelines.register(queue).unwrap();

        let reporter = MetricsReporter::new(ReporterConfig::default(), pipelines)
            .with_registry_counters(Arc::new(FixedCounts));
        let lines = reporter.report_once().lines();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("push, AcceptedTasks:1,"));
        assert!(lines[0].ends_with("MaxBuffer:1/4"));
        assert_eq!(
            lines[1],
            "RegistryCounts, Subscribers:4, Publishers:3, Watchers:2, Connections:1"
        );
    }
}
