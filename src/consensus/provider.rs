use crate::core::{PeerAddress, TransportFault};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A mutating request routed to the leader of a consensus group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRequest {
    pub request_id: Uuid,
    pub payload: serde_json::Value,
}

impl ConsensusRequest {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            payload,
        }
    }
}

/// Reply of a group member to a [`ConsensusRequest`].
///
/// `success == false` with no redirect is a definitive server-side rejection. Members that
/// are not the leader answer with `redirect` set and never apply the request themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResponse {
    pub success: bool,
    #[serde(default)]
    pub entity: serde_json::Value,
    #[serde(default)]
    pub redirect: Option<PeerAddress>,
}

impl ConsensusResponse {
    pub fn ok(entity: serde_json::Value) -> Self {
        Self {
            success: true,
            entity,
            redirect: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            entity: serde_json::Value::String(message.into()),
            redirect: None,
        }
    }

    pub fn redirect(leader: PeerAddress) -> Self {
        Self {
            success: false,
            entity: serde_json::Value::Null,
            redirect: Some(leader),
        }
    }

    /// Remote message for error reporting; strings are unquoted.
    pub fn entity_message(&self) -> String {
        match &self.entity {
            serde_json::Value::String(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEventKind {
    Connect,
    Close,
    Exception,
}

/// Connection lifecycle event raised by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub kind: ConnectionEventKind,
    pub peer: PeerAddress,
}

impl ConnectionEvent {
    pub fn new(kind: ConnectionEventKind, peer: PeerAddress) -> Self {
        Self { kind, peer }
    }

    /// Whether the connection to `peer` can no longer be trusted.
    pub fn is_loss(&self) -> bool {
        matches!(
            self.kind,
            ConnectionEventKind::Close | ConnectionEventKind::Exception
        )
    }
}

pub trait ConnectionEventListener: Send + Sync {
    fn on_connection_event(&self, event: ConnectionEvent);
}

pub trait LeaderChangeListener: Send + Sync {
    /// Called when the provider learns the group's leader changed. `new_leader` is a hint
    /// and may be absent.
    fn on_leader_change(&self, group_id: &str, new_leader: Option<PeerAddress>);
}

/// External consensus provider: answers who leads a group and who belongs to it.
///
/// Errors are the provider's non-OK status message.
#[async_trait]
pub trait ConsensusProvider: Send + Sync {
    async fn query_leader(
        &self,
        group_id: &str,
        members: &[PeerAddress],
        timeout: Duration,
    ) -> Result<PeerAddress, String>;

    async fn query_members(
        &self,
        group_id: &str,
        leader: &PeerAddress,
        timeout: Duration,
    ) -> Result<Vec<PeerAddress>, String>;

    fn register_leader_change_listener(
        &self,
        group_id: &str,
        listener: Arc<dyn LeaderChangeListener>,
    );

    /// Releases provider resources.
    async fn shutdown(&self) {}
}

/// RPC substrate used to reach group members.
///
/// `Ok(None)` means the call completed without any response.
#[async_trait]
pub trait ConsensusTransport: Send + Sync {
    async fn invoke(
        &self,
        target: &PeerAddress,
        request: &ConsensusRequest,
        timeout: Duration,
    ) -> Result<Option<ConsensusResponse>, TransportFault>;

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionEventListener>);
}
