use super::provider::ConsensusProvider;
use crate::core::{GroupId, MemberConfiguration, PeerAddress, RegistryError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Cached routing knowledge for one consensus group.
///
/// Views are immutable; every mutation publishes a whole new view, so readers see either
/// the old or the new leader/members pair, never a mix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteView {
    pub group_id: GroupId,
    pub leader: Option<PeerAddress>,
    pub members: Vec<PeerAddress>,
    /// Time of the last full refresh, if any.
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl RouteView {
    fn empty(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            leader: None,
            members: Vec::new(),
            refreshed_at: None,
        }
    }
}

struct GroupRoute {
    view: RwLock<Arc<RouteView>>,
    /// Serializes refreshes of this group only.
    refresh_lock: Mutex<()>,
}

impl GroupRoute {
    fn new(view: RouteView) -> Self {
        Self {
            view: RwLock::new(Arc::new(view)),
            refresh_lock: Mutex::new(()),
        }
    }

    // A poisoned lock still holds a complete view: writers only ever swap the Arc.
    fn load(&self) -> Arc<RouteView> {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, view: RouteView) {
        *self.view.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(view);
    }

    fn update(&self, f: impl FnOnce(&RouteView) -> Option<RouteView>) -> bool {
        let mut guard = self.view.write().unwrap_or_else(PoisonError::into_inner);
        match f(&guard) {
            Some(next) => {
                *guard = Arc::new(next);
                true
            }
            None => false,
        }
    }
}

/// Route views of every known group, keyed by group id.
///
/// Owned by (or shared between) clients explicitly; there is no process-wide table.
pub struct RouteViewRegistry {
    provider: Arc<dyn ConsensusProvider>,
    groups: RwLock<HashMap<GroupId, Arc<GroupRoute>>>,
}

impl RouteViewRegistry {
    pub fn new(provider: Arc<dyn ConsensusProvider>) -> Self {
        Self {
            provider,
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn ConsensusProvider> {
        &self.provider
    }

    fn group(&self, group_id: &str) -> Option<Arc<GroupRoute>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_id)
            .cloned()
    }

    fn group_or_insert(&self, group_id: &str) -> Arc<GroupRoute> {
        if let Some(group) = self.group(group_id) {
            return group;
        }
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(GroupRoute::new(RouteView::empty(group_id))))
            .clone()
    }

    /// Seeds a group's membership from static configuration.
    ///
    /// A cached leader survives only if it is still a member.
    pub fn bootstrap(&self, group_id: &str, members: &MemberConfiguration) {
        let group = self.group_or_insert(group_id);
        group.update(|current| {
            let leader = current
                .leader
                .clone()
                .filter(|leader| members.contains(leader));
            Some(RouteView {
                group_id: group_id.to_string(),
                leader,
                members: members.peers().to_vec(),
                refreshed_at: current.refreshed_at,
            })
        });
        debug!(group_id, members = %members, "route view bootstrapped");
    }

    pub fn view(&self, group_id: &str) -> Option<Arc<RouteView>> {
        self.group(group_id).map(|group| group.load())
    }

    /// Non-blocking read of the cached leader.
    pub fn get_leader(&self, group_id: &str) -> Option<PeerAddress> {
        self.group(group_id)
            .and_then(|group| group.load().leader.clone())
    }

    pub fn groups(&self) -> Vec<GroupId> {
        let mut groups = self
            .groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        groups.sort();
        groups
    }

    /// Re-queries leader and membership from the provider and publishes both at once.
    pub async fn refresh(&self, group_id: &str, deadline: Duration) -> Result<PeerAddress> {
        let group = self.group(group_id).ok_or_else(|| {
            RegistryError::routing_unavailable(group_id, "group has no bootstrapped members")
        })?;
        let _refreshing = group.refresh_lock.lock().await;

        let members = group.load().members.clone();
        if members.is_empty() {
            return Err(RegistryError::routing_unavailable(
                group_id,
                "group has no known members",
            ));
        }

        let leader = timeout(deadline, self.provider.query_leader(group_id, &members, deadline))
            .await
            .map_err(|_| {
                RegistryError::routing_unavailable(
                    group_id,
                    format!("Refresh leader timed out after {:?}", deadline),
                )
            })?
            .map_err(|status| {
                warn!(group_id, error = %status, "refresh leader failed");
                RegistryError::routing_unavailable(
                    group_id,
                    format!("Refresh leader failed, error={}", status),
                )
            })?;

        let members = timeout(deadline, self.provider.query_members(group_id, &leader, deadline))
            .await
            .map_err(|_| {
                RegistryError::routing_unavailable(
                    group_id,
                    format!("Refresh configuration timed out after {:?}", deadline),
                )
            })?
            .map_err(|status| {
                warn!(group_id, error = %status, "refresh configuration failed");
                RegistryError::routing_unavailable(
                    group_id,
                    format!("Refresh configuration failed, error={}", status),
                )
            })?;
        if members.is_empty() {
            return Err(RegistryError::routing_unavailable(
                group_id,
                "provider reported an empty configuration",
            ));
        }

        group.store(RouteView {
            group_id: group_id.to_string(),
            leader: Some(leader.clone()),
            members,
            refreshed_at: Some(Utc::now()),
        });
        info!(group_id, leader = %leader, "Leader is {}", leader);
        Ok(leader)
    }

    /// Point update of the leader after a successful redirect. Membership is untouched.
    pub fn update_leader(&self, group_id: &str, leader: PeerAddress) {
        let group = self.group_or_insert(group_id);
        group.update(|current| {
            Some(RouteView {
                leader: Some(leader.clone()),
                ..current.clone()
            })
        });
        debug!(group_id, leader = %leader, "route view leader updated");
    }

    /// Clears the cached leader so the next lookup refreshes.
    ///
    /// With `only_if`, the leader is cleared only while it still equals that peer, so a
    /// late connection-loss event cannot wipe out a newer leader.
    pub fn invalidate_leader(&self, group_id: &str, only_if: Option<&PeerAddress>) -> bool {
        let Some(group) = self.group(group_id) else {
            return false;
        };
        group.update(|current| {
            let matches = match (&current.leader, only_if) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(leader), Some(expected)) => leader == expected,
            };
            matches.then(|| RouteView {
                leader: None,
                ..current.clone()
            })
        })
    }
}
