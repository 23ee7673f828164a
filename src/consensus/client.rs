use super::executor::TaskExecutor;
use super::lifecycle::{LifecycleGuard, LifecycleState};
use super::provider::{
    ConnectionEvent, ConnectionEventListener, ConsensusRequest, ConsensusResponse,
    ConsensusTransport, LeaderChangeListener,
};
use super::route_view::RouteViewRegistry;
use crate::config::ConsensusClientConfig;
use crate::core::{GroupId, MemberConfiguration, PeerAddress, RegistryError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Client that routes mutating requests to the leader of one consensus group.
///
/// Requests go to the cached leader. A follower's redirect is honored for exactly one hop:
/// on success the route view adopts the redirect target, on failure the route is fully
/// refreshed and the call fails. Nothing is retried beyond that hop.
pub struct ConsensusRoutedClient {
    group_id: GroupId,
    members: MemberConfiguration,
    config: ConsensusClientConfig,
    routes: Arc<RouteViewRegistry>,
    transport: Arc<dyn ConsensusTransport>,
    executor: Arc<dyn TaskExecutor>,
    lifecycle: Arc<LifecycleGuard>,
}

impl ConsensusRoutedClient {
    /// Creates a client for `group_id` whose members are listed in `members`
    /// (`host:port,host:port,...`).
    ///
    /// Fails with `ConfigParse` if any member entry is malformed.
    pub fn new(
        group_id: &str,
        members: &str,
        routes: Arc<RouteViewRegistry>,
        transport: Arc<dyn ConsensusTransport>,
        executor: Arc<dyn TaskExecutor>,
        config: ConsensusClientConfig,
    ) -> Result<Self> {
        if group_id.trim().is_empty() {
            return Err(RegistryError::InvalidConfiguration(
                "group_id must not be empty".to_string(),
            ));
        }
        let members = MemberConfiguration::parse(members)?;
        config.validate()?;

        Ok(Self {
            group_id: group_id.to_string(),
            members,
            config,
            routes,
            transport,
            executor,
            lifecycle: Arc::new(LifecycleGuard::new()),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn members(&self) -> &MemberConfiguration {
        &self.members
    }

    pub fn config(&self) -> &ConsensusClientConfig {
        &self.config
    }

    pub fn routes(&self) -> &Arc<RouteViewRegistry> {
        &self.routes
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Seeds the route view and subscribes to connection and leader-change events.
    ///
    /// Only the first call has any effect; calls after `shutdown` are ignored.
    pub fn start(&self) {
        if !self.lifecycle.try_start() {
            debug!(group_id = %self.group_id, state = %self.lifecycle.state(), "start ignored");
            return;
        }

        self.routes.bootstrap(&self.group_id, &self.members);

        let handler = Arc::new(RouteEventHandler {
            group_id: self.group_id.clone(),
            routes: self.routes.clone(),
            executor: self.executor.clone(),
            lifecycle: self.lifecycle.clone(),
            refresh_timeout: self.config.refresh_timeout(),
        });
        self.transport.add_connection_listener(handler.clone());
        self.routes
            .provider()
            .register_leader_change_listener(&self.group_id, handler);

        info!(group_id = %self.group_id, members = %self.members, "consensus client started");
    }

    /// Releases provider resources. A no-op before `start` and on repeated calls.
    pub async fn shutdown(&self) {
        if !self.lifecycle.try_stop() {
            return;
        }
        self.routes.provider().shutdown().await;
        info!(group_id = %self.group_id, "consensus client stopped");
    }

    /// Re-queries leader and membership from the provider.
    pub async fn refresh_leader(&self) -> Result<PeerAddress> {
        self.lifecycle.ensure_started()?;
        self.routes
            .refresh(&self.group_id, self.config.refresh_timeout())
            .await
    }

    /// Returns the cached leader, refreshing once if none is known.
    pub async fn get_leader(&self) -> Result<PeerAddress> {
        self.lifecycle.ensure_started()?;
        match self.routes.get_leader(&self.group_id) {
            Some(leader) => Ok(leader),
            None => self.refresh_leader().await,
        }
    }

    /// Sends `request` to the group leader and returns the entity it answered with.
    pub async fn send_request(&self, request: ConsensusRequest) -> Result<serde_json::Value> {
        if let Err(err) = self.lifecycle.ensure_started() {
            error!(group_id = %self.group_id, "Client must be started before send request");
            return Err(err);
        }

        let leader = self.get_leader().await?;
        debug!(
            group_id = %self.group_id,
            request_id = %request.request_id,
            peer = %leader,
            "sending request to leader"
        );

        let response = self.invoke(&leader, &request).await?;
        if response.success {
            return Ok(response.entity);
        }

        match response.redirect.clone() {
            Some(target) => self.redirect_request(&request, &leader, target).await,
            None => Err(RegistryError::ServerError {
                peer: leader,
                message: response.entity_message(),
            }),
        }
    }

    async fn redirect_request(
        &self,
        request: &ConsensusRequest,
        from: &PeerAddress,
        target: PeerAddress,
    ) -> Result<serde_json::Value> {
        // give the new leader time to finish promotion before it sees traffic
        sleep(self.config.redirect_grace()).await;

        info!(
            group_id = %self.group_id,
            request_id = %request.request_id,
            from = %from,
            peer = %target,
            "redirecting request"
        );
        let response = self.invoke(&target, request).await?;
        if response.success {
            self.routes.update_leader(&self.group_id, target);
            return Ok(response.entity);
        }

        if let Err(err) = self.refresh_leader().await {
            warn!(group_id = %self.group_id, error = %err, "refresh after failed redirect failed");
        }
        Err(RegistryError::ServerError {
            peer: target,
            message: response.entity_message(),
        })
    }

    /// One round trip bounded by the rpc timeout.
    ///
    /// A peer that gives no answer or fails at transport level is dropped as cached
    /// leader, so the next request refreshes instead of retrying it.
    async fn invoke(
        &self,
        target: &PeerAddress,
        request: &ConsensusRequest,
    ) -> Result<ConsensusResponse> {
        let deadline = self.config.rpc_timeout();
        let outcome = timeout(deadline, self.transport.invoke(target, request, deadline)).await;

        let err = match outcome {
            Ok(Ok(Some(response))) => return Ok(response),
            Ok(Ok(None)) | Err(_) => {
                error!(group_id = %self.group_id, peer = %target, "request has no response");
                RegistryError::NoResponse {
                    peer: target.clone(),
                }
            }
            Ok(Err(source)) => {
                error!(group_id = %self.group_id, peer = %target, error = %source, "transport failure");
                RegistryError::TransportError {
                    peer: target.clone(),
                    source,
                }
            }
        };
        self.routes.invalidate_leader(&self.group_id, Some(target));
        Err(err)
    }
}

/// Keeps a group's route view in step with transport and provider signals.
struct RouteEventHandler {
    group_id: GroupId,
    routes: Arc<RouteViewRegistry>,
    executor: Arc<dyn TaskExecutor>,
    lifecycle: Arc<LifecycleGuard>,
    refresh_timeout: Duration,
}

impl ConnectionEventListener for RouteEventHandler {
    fn on_connection_event(&self, event: ConnectionEvent) {
        if !self.lifecycle.is_started() {
            return;
        }

        let group_id = self.group_id.clone();
        let routes = self.routes.clone();
        self.executor.submit(Box::pin(async move {
            if !event.is_loss() {
                debug!(group_id = %group_id, peer = %event.peer, "connection established");
                return;
            }
            if routes.invalidate_leader(&group_id, Some(&event.peer)) {
                info!(
                    group_id = %group_id,
                    peer = %event.peer,
                    kind = ?event.kind,
                    "lost connection to leader, cached leader invalidated"
                );
            }
        }));
    }
}

impl LeaderChangeListener for RouteEventHandler {
    fn on_leader_change(&self, group_id: &str, new_leader: Option<PeerAddress>) {
        if group_id != self.group_id || !self.lifecycle.is_started() {
            return;
        }

        if let Some(leader) = new_leader {
            info!(group_id, leader = %leader, "leader change notified");
            self.routes.update_leader(group_id, leader);
            return;
        }

        let group_id = self.group_id.clone();
        let routes = self.routes.clone();
        let refresh_timeout = self.refresh_timeout;
        self.executor.submit(Box::pin(async move {
            if let Err(err) = routes.refresh(&group_id, refresh_timeout).await {
                warn!(group_id = %group_id, error = %err, "refresh after leader change failed");
            }
        }));
    }
}
