use super::provider::{
    ConnectionEvent, ConnectionEventListener, ConsensusProvider, ConsensusRequest,
    ConsensusResponse, ConsensusTransport, LeaderChangeListener,
};
use crate::core::{GroupId, MemberConfiguration, PeerAddress, TransportFault};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type ApplyHandler = Arc<dyn Fn(&ConsensusRequest) -> Result<serde_json::Value, String> + Send + Sync>;

#[derive(Default)]
struct GroupState {
    members: Vec<PeerAddress>,
    leader: Option<PeerAddress>,
    provider_failure: Option<String>,
    provider_stalled: bool,
    unreachable: HashSet<PeerAddress>,
    stalled: HashSet<PeerAddress>,
    faulty: HashMap<PeerAddress, String>,
    scripted: HashMap<PeerAddress, VecDeque<ConsensusResponse>>,
    invocations: Vec<PeerAddress>,
    applied: Vec<ConsensusRequest>,
    provider_queries: usize,
    shutdown_calls: usize,
}

enum Outcome {
    Respond(Option<ConsensusResponse>),
    Apply(ApplyHandler, ConsensusRequest),
    Fault(String),
    Stall,
}

/// An in-process consensus group acting as both provider and transport.
///
/// Members answer the way a real group does: the leader applies requests, every other
/// member redirects to the leader. Failures, stalls and scripted replies can be injected
/// per peer to simulate leader moves and partitions.
pub struct InMemoryConsensusGroup {
    group_id: GroupId,
    state: Mutex<GroupState>,
    apply: Mutex<ApplyHandler>,
    connection_listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
    leader_listeners: Mutex<HashMap<GroupId, Vec<Arc<dyn LeaderChangeListener>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryConsensusGroup {
    /// Creates a group whose first configured member is the leader.
    pub fn new(group_id: &str, members: &MemberConfiguration) -> Self {
        let state = GroupState {
            members: members.peers().to_vec(),
            leader: members.peers().first().cloned(),
            ..GroupState::default()
        };
        let echo: ApplyHandler = Arc::new(|request: &ConsensusRequest| Ok(request.payload.clone()));
        Self {
            group_id: group_id.to_string(),
            state: Mutex::new(state),
            apply: Mutex::new(echo),
            connection_listeners: Mutex::new(Vec::new()),
            leader_listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Replaces how the leader applies requests. Defaults to echoing the payload.
    pub fn set_apply_handler(
        &self,
        handler: impl Fn(&ConsensusRequest) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    ) {
        *lock(&self.apply) = Arc::new(handler);
    }

    pub fn leader(&self) -> Option<PeerAddress> {
        lock(&self.state).leader.clone()
    }

    /// Moves leadership without notifying anyone, as a client with a stale view sees it.
    pub fn set_leader(&self, leader: &PeerAddress) {
        let mut state = lock(&self.state);
        if !state.members.contains(leader) {
            state.members.push(leader.clone());
        }
        state.leader = Some(leader.clone());
    }

    pub fn add_member(&self, peer: &PeerAddress) {
        let mut state = lock(&self.state);
        if !state.members.contains(peer) {
            state.members.push(peer.clone());
        }
    }

    /// Makes leader/membership queries fail with `status`, or succeed again with `None`.
    pub fn fail_provider(&self, status: Option<&str>) {
        lock(&self.state).provider_failure = status.map(str::to_string);
    }

    /// Makes leader/membership queries hang forever.
    pub fn stall_provider(&self, stalled: bool) {
        lock(&self.state).provider_stalled = stalled;
    }

    /// The peer completes calls without any response.
    pub fn set_unreachable(&self, peer: &PeerAddress, unreachable: bool) {
        let mut state = lock(&self.state);
        if unreachable {
            state.unreachable.insert(peer.clone());
        } else {
            state.unreachable.remove(peer);
        }
    }

    /// Calls to the peer never complete.
    pub fn set_stalled(&self, peer: &PeerAddress, stalled: bool) {
        let mut state = lock(&self.state);
        if stalled {
            state.stalled.insert(peer.clone());
        } else {
            state.stalled.remove(peer);
        }
    }

    /// Calls to the peer raise a transport fault carrying `message`.
    pub fn set_faulty(&self, peer: &PeerAddress, message: Option<&str>) {
        let mut state = lock(&self.state);
        match message {
            Some(message) => {
                state.faulty.insert(peer.clone(), message.to_string());
            }
            None => {
                state.faulty.remove(peer);
            }
        }
    }

    /// Queues a reply the peer returns instead of its normal behavior, once.
    pub fn script_response(&self, peer: &PeerAddress, response: ConsensusResponse) {
        lock(&self.state)
            .scripted
            .entry(peer.clone())
            .or_default()
            .push_back(response);
    }

    /// Every peer a request was sent to, in order.
    pub fn invocations(&self) -> Vec<PeerAddress> {
        lock(&self.state).invocations.clone()
    }

    /// Requests applied by a leader.
    pub fn applied(&self) -> Vec<ConsensusRequest> {
        lock(&self.state).applied.clone()
    }

    pub fn provider_queries(&self) -> usize {
        lock(&self.state).provider_queries
    }

    pub fn shutdown_calls(&self) -> usize {
        lock(&self.state).shutdown_calls
    }

    pub fn connection_listener_count(&self) -> usize {
        lock(&self.connection_listeners).len()
    }

    pub fn leader_listener_count(&self, group_id: &str) -> usize {
        lock(&self.leader_listeners)
            .get(group_id)
            .map_or(0, Vec::len)
    }

    pub fn emit_connection_event(&self, event: ConnectionEvent) {
        let listeners = lock(&self.connection_listeners).clone();
        for listener in listeners {
            listener.on_connection_event(event.clone());
        }
    }

    /// Notifies registered listeners that leadership changed.
    pub fn notify_leader_change(&self, hint: Option<PeerAddress>) {
        let listeners = lock(&self.leader_listeners)
            .get(&self.group_id)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener.on_leader_change(&self.group_id, hint.clone());
        }
    }

    fn provider_outcome(&self, group_id: &str) -> Result<bool, String> {
        let mut state = lock(&self.state);
        state.provider_queries += 1;
        if group_id != self.group_id {
            return Err(format!("unknown group '{}'", group_id));
        }
        if let Some(status) = state.provider_failure.clone() {
            return Err(status);
        }
        Ok(state.provider_stalled)
    }

    fn outcome_for(&self, target: &PeerAddress, request: &ConsensusRequest) -> Outcome {
        let mut state = lock(&self.state);
        state.invocations.push(target.clone());

        if let Some(response) = state
            .scripted
            .get_mut(target)
            .and_then(VecDeque::pop_front)
        {
            return Outcome::Respond(Some(response));
        }
        if state.stalled.contains(target) {
            return Outcome::Stall;
        }
        if let Some(message) = state.faulty.get(target) {
            return Outcome::Fault(message.clone());
        }
        if state.unreachable.contains(target) {
            return Outcome::Respond(None);
        }
        if !state.members.contains(target) {
            return Outcome::Fault(format!("no route to {}", target));
        }

        match state.leader.clone() {
            Some(leader) if &leader == target => {
                state.applied.push(request.clone());
                Outcome::Apply(lock(&self.apply).clone(), request.clone())
            }
            Some(leader) => Outcome::Respond(Some(ConsensusResponse::redirect(leader))),
            None => Outcome::Respond(Some(ConsensusResponse::error("no leader elected"))),
        }
    }
}

#[async_trait]
impl ConsensusProvider for InMemoryConsensusGroup {
    async fn query_leader(
        &self,
        group_id: &str,
        _members: &[PeerAddress],
        _timeout: Duration,
    ) -> Result<PeerAddress, String> {
        if self.provider_outcome(group_id)? {
            futures::future::pending::<()>().await;
        }
        self.leader()
            .ok_or_else(|| "no leader elected".to_string())
    }

    async fn query_members(
        &self,
        group_id: &str,
        _leader: &PeerAddress,
        _timeout: Duration,
    ) -> Result<Vec<PeerAddress>, String> {
        if self.provider_outcome(group_id)? {
            futures::future::pending::<()>().await;
        }
        Ok(lock(&self.state).members.clone())
    }

    fn register_leader_change_listener(
        &self,
        group_id: &str,
        listener: Arc<dyn LeaderChangeListener>,
    ) {
        lock(&self.leader_listeners)
            .entry(group_id.to_string())
            .or_default()
            .push(listener);
    }

    async fn shutdown(&self) {
        lock(&self.state).shutdown_calls += 1;
        lock(&self.connection_listeners).clear();
        lock(&self.leader_listeners).clear();
    }
}

#[async_trait]
impl ConsensusTransport for InMemoryConsensusGroup {
    async fn invoke(
        &self,
        target: &PeerAddress,
        request: &ConsensusRequest,
        _timeout: Duration,
    ) -> Result<Option<ConsensusResponse>, TransportFault> {
        match self.outcome_for(target, request) {
            Outcome::Respond(response) => Ok(response),
            Outcome::Apply(handler, request) => Ok(Some(match handler(&request) {
                Ok(entity) => ConsensusResponse::ok(entity),
                Err(message) => ConsensusResponse::error(message),
            })),
            Outcome::Fault(message) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                message,
            ))),
            Outcome::Stall => {
                futures::future::pending::<()>().await;
                Ok(None)
            }
        }
    }

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        lock(&self.connection_listeners).push(listener);
    }
}
