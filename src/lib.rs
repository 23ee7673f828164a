// ============================================================================
// Registry Core Library
// ============================================================================

pub mod config;
pub mod consensus;
pub mod core;
pub mod dispatch;
pub mod reporter;

// Re-export main types for convenience
pub use config::{ConsensusClientConfig, PipelineConfig, ReporterConfig, ServerConfig};
pub use core::{GroupId, MemberConfiguration, PeerAddress, RegistryError, Result};

// ============================================================================
// Consensus routing
// ============================================================================

pub use consensus::{
    ConnectionEvent, ConnectionEventKind, ConsensusProvider, ConsensusRequest,
    ConsensusResponse, ConsensusRoutedClient, ConsensusTransport, InMemoryConsensusGroup,
    LifecycleGuard, LifecycleState, RouteView, RouteViewRegistry, TaskExecutor,
    TokioTaskExecutor,
};

// ============================================================================
// Task dispatch
// ============================================================================

pub use dispatch::{
    Admission, CoalescingSink, DeliveryFailure, DrainWorker, MergeMetrics, PipelineMetrics,
    PipelineMetricsSnapshot, PipelineRegistry, PushSink, TaskAdmissionQueue, TaskDrainLoop,
    TaskItem,
};
pub use reporter::{MetricsReporter, RegistryCounters, ReportSnapshot};
