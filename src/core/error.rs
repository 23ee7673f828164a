use crate::consensus::lifecycle::LifecycleState;
use crate::core::types::PeerAddress;
use thiserror::Error;

/// Boxed cause carried by transport failures.
pub type TransportFault = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Client is not started (state: {0})")]
    NotStarted(LifecycleState),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Routing unavailable for group '{group_id}': {reason}")]
    RoutingUnavailable { group_id: String, reason: String },

    #[error("No response from {peer}")]
    NoResponse { peer: PeerAddress },

    #[error("Server error from {peer}: {message}")]
    ServerError { peer: PeerAddress, message: String },

    #[error("Transport error talking to {peer}")]
    TransportError {
        peer: PeerAddress,
        #[source]
        source: TransportFault,
    },

    #[error("Worker join error: {0}")]
    WorkerJoin(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    pub(crate) fn routing_unavailable(group_id: &str, reason: impl Into<String>) -> Self {
        Self::RoutingUnavailable {
            group_id: group_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether a caller may reasonably retry after refreshing routes or backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RoutingUnavailable { .. } | Self::NoResponse { .. } | Self::TransportError { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
