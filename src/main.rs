use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use registry_core::{
    CoalescingSink, ConsensusRequest, ConsensusRoutedClient, DeliveryFailure, InMemoryConsensusGroup,
    MetricsReporter, PipelineConfig, PipelineRegistry, PushSink, RegistryCounters,
    RouteViewRegistry, ServerConfig, TaskAdmissionQueue, TaskDrainLoop, TaskItem,
    TokioTaskExecutor,
};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Runs a simulated registry node against an in-process consensus group.
#[derive(Parser, Debug)]
#[command(name = "registry-core", version, about)]
struct Args {
    /// JSON node configuration; overrides --group and --members
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "naming_service_metadata")]
    group: String,

    #[arg(long, default_value = "127.0.0.1:7848,127.0.0.1:7849,127.0.0.1:7850")]
    members: String,

    /// How long producers keep submitting push tasks
    #[arg(long, default_value_t = 3)]
    duration_secs: u64,
}

struct LoggingSink;

#[async_trait]
impl PushSink<String, Value> for LoggingSink {
    async fn deliver(
        &self,
        batch: Vec<TaskItem<String, Value>>,
    ) -> std::result::Result<(), DeliveryFailure<String, Value>> {
        for item in &batch {
            debug!(key = %item.key, payload = %item.payload, "pushed");
        }
        Ok(())
    }
}

#[derive(Default)]
struct DemoCounters {
    subscribers: AtomicU64,
    publishers: AtomicU64,
    watchers: AtomicU64,
    connections: AtomicU64,
}

impl RegistryCounters for DemoCounters {
    fn subscriber_count(&self) -> u64 {
        self.subscribers.load(Ordering::Relaxed)
    }

    fn publisher_count(&self) -> u64 {
        self.publishers.load(Ordering::Relaxed)
    }

    fn watcher_count(&self) -> u64 {
        self.watchers.load(Ordering::Relaxed)
    }

    fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

type PushQueue = TaskAdmissionQueue<String, Value>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => default_config(&args)?,
    };
    let members = config.member_configuration()?;

    let group = Arc::new(InMemoryConsensusGroup::new(&config.group_id, &members));
    let client = ConsensusRoutedClient::new(
        &config.group_id,
        &config.members,
        Arc::new(RouteViewRegistry::new(group.clone())),
        group.clone(),
        Arc::new(TokioTaskExecutor::from_current()?),
        config.client.clone(),
    )?;
    client.start();

    let entity = client
        .send_request(ConsensusRequest::new(json!({ "op": "register", "service": "demo" })))
        .await
        .context("initial request failed")?;
    info!(entity = %entity, "request applied");

    // leadership moves without the client hearing about it; the next call is redirected
    if let Some(next) = members.peers().get(1) {
        group.set_leader(next);
        let entity = client
            .send_request(ConsensusRequest::new(json!({ "op": "renew", "service": "demo" })))
            .await
            .context("redirected request failed")?;
        info!(entity = %entity, leader = ?client.routes().get_leader(&config.group_id), "request applied after leader move");
    }

    let pipelines = Arc::new(PipelineRegistry::new());
    let counters = Arc::new(DemoCounters::default());
    counters
        .connections
        .store(members.len() as u64, Ordering::Relaxed);
    let reporter = Arc::new(
        MetricsReporter::new(config.reporter.clone(), pipelines.clone())
            .with_registry_counters(counters.clone()),
    );

    let mut queues: Vec<Arc<PushQueue>> = Vec::new();
    let mut workers = Vec::new();
    for pipeline in &config.pipelines {
        let queue = Arc::new(PushQueue::new(pipeline)?);
        let sink = Arc::new(CoalescingSink::new(LoggingSink, |key: &String| {
            key.split('#').next().unwrap_or_default().to_string()
        }));
        pipelines.register(queue.clone())?;
        reporter.watch_sink::<String, Value, _>(&pipeline.name, sink.clone());
        workers.push(TaskDrainLoop::new(queue.clone(), sink, pipeline)?.spawn());
        queues.push(queue);
    }
    // one watcher per push pipeline
    counters
        .watchers
        .store(queues.len() as u64, Ordering::Relaxed);
    let reporter_worker = reporter.clone().spawn();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration_secs);
    let mut sequence: u64 = 0;
    while tokio::time::Instant::now() < deadline {
        for queue in &queues {
            let key = format!("service-{}#subscriber-{}", sequence % 7, sequence % 3);
            queue.submit(key, json!({ "revision": sequence }));
        }
        counters.publishers.store(sequence.min(7), Ordering::Relaxed);
        counters.subscribers.store(sequence.min(21), Ordering::Relaxed);
        sequence += 1;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for worker in workers {
        worker.stop().await?;
    }
    reporter_worker.stop().await?;
    reporter.report_once();

    if let Err(err) = client.refresh_leader().await {
        warn!(error = %err, "final leader refresh failed");
    }
    client.shutdown().await;
    Ok(())
}

fn default_config(args: &Args) -> Result<ServerConfig> {
    let mut config = ServerConfig::new(&args.group, &args.members);
    config.client.redirect_grace_ms = 200;
    config.reporter.interval_ms = 1_000;
    config.pipelines.push(
        PipelineConfig::new("push")
            .capacity(64)
            .max_age_ms(2_000)
            .batch_size(16),
    );
    config.validate()?;
    Ok(config)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("registry_core=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
