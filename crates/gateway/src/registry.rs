//! Connection registry: group id → live connections.
//!
//! Groups live in a sharded `DashMap`, so structural access to unrelated
//! groups does not contend. Each group guards its connection list with its
//! own async mutex.
//!
//! Lock order is always map shard, then group. A shard guard is never held
//! across an await, and no map access happens while a group lock is held.

use crate::connection::{Connection, ConnectionId};
use crate::error::{GatewayError, Result};
use crate::header::GroupId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Creates and removes broker routing for a group.
#[async_trait]
pub trait Binder: Send + Sync + 'static {
    async fn bind(&self, group: &GroupId) -> Result<()>;
    async fn unbind(&self, group: &GroupId) -> Result<()>;
}

/// What happens to a group's binding once its last connection is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnbindPolicy {
    /// Keep the group and its binding until process exit.
    #[default]
    Lazy,
    /// Remove the group and unbind it as soon as it becomes empty.
    Eager,
}

impl FromStr for UnbindPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "lazy" => Ok(UnbindPolicy::Lazy),
            "eager" => Ok(UnbindPolicy::Eager),
            other => Err(format!("unknown unbind policy '{}'", other)),
        }
    }
}

#[derive(Default)]
struct GroupState {
    connections: Vec<Arc<dyn Connection>>,
    /// Set when the group has been removed from the map; a retired group
    /// never accepts connections again.
    retired: bool,
}

/// Ordered set of connections under one group id.
#[derive(Default)]
pub struct Group {
    state: Mutex<GroupState>,
}

/// Outcome of registering a connection.
#[derive(Debug)]
pub struct Registration {
    /// The connection created its group.
    pub group_created: bool,
    /// Binding the new group failed. The connection is registered anyway.
    pub binding_error: Option<GatewayError>,
}

/// Counts from one broadcast pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Target groups that existed.
    pub groups: usize,
    /// Successful writes.
    pub delivered: usize,
    /// Connections removed after the pass, failed writes included.
    pub dropped: usize,
}

/// Drop connections listed in `failed` or no longer open, keeping survivor
/// order.
fn compact(
    connections: &mut Vec<Arc<dyn Connection>>,
    failed: &[ConnectionId],
) -> Vec<Arc<dyn Connection>> {
    let mut removed = Vec::new();
    connections.retain(|conn| {
        let keep = conn.is_open() && !failed.contains(&conn.id());
        if !keep {
            removed.push(Arc::clone(conn));
        }
        keep
    });
    removed
}

/// Registry of groups and their live connections.
pub struct Registry {
    groups: DashMap<GroupId, Arc<Group>>,
    binder: Arc<dyn Binder>,
    policy: UnbindPolicy,
    active: AtomicUsize,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(binder: Arc<dyn Binder>, policy: UnbindPolicy) -> Self {
        Self {
            groups: DashMap::new(),
            binder,
            policy,
            active: AtomicUsize::new(0),
        }
    }

    fn group(&self, group_id: &GroupId) -> Option<Arc<Group>> {
        self.groups.get(group_id).map(|g| Arc::clone(g.value()))
    }

    fn get_or_create(&self, group_id: &GroupId) -> (Arc<Group>, bool) {
        match self.groups.entry(group_id.clone()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => (Arc::clone(e.insert(Arc::new(Group::default())).value()), true),
        }
    }

    fn remove_retired(&self, group_id: &GroupId, group: &Arc<Group>) {
        self.groups.remove_if(group_id, |_, g| Arc::ptr_eq(g, group));
    }

    fn track_removed(&self, n: usize) {
        if n > 0 {
            self.active.fetch_sub(n, Ordering::Relaxed);
            gauge!("gateway_active_connections").decrement(n as f64);
        }
    }

    /// Remove dead connections from a locked group and close each of them.
    async fn remove_dead(&self, state: &mut GroupState, failed: &[ConnectionId]) -> usize {
        let removed = compact(&mut state.connections, failed);
        for conn in &removed {
            conn.close().await;
        }
        self.track_removed(removed.len());
        removed.len()
    }

    /// Under [`UnbindPolicy::Eager`], retire and unbind a group left empty.
    ///
    /// The unbind runs under the group lock; the map entry is removed after
    /// the lock is released.
    async fn retire_if_empty(
        &self,
        group_id: &GroupId,
        group: &Arc<Group>,
        mut state: MutexGuard<'_, GroupState>,
    ) {
        if self.policy != UnbindPolicy::Eager || state.retired || !state.connections.is_empty() {
            return;
        }

        state.retired = true;
        if let Err(e) = self.binder.unbind(group_id).await {
            warn!("Failed to unbind group {}: {}", group_id, e);
        }
        drop(state);
        self.remove_retired(group_id, group);
        info!("Retired empty group {}", group_id);
    }

    /// Register `conn` under `group_id`.
    ///
    /// The first connection of a group binds it on the broker. A binding
    /// failure is reported in the returned [`Registration`]; it is not
    /// retried.
    pub async fn add_connection(
        &self,
        group_id: GroupId,
        conn: Arc<dyn Connection>,
    ) -> Registration {
        loop {
            let (group, created) = self.get_or_create(&group_id);
            let mut state = group.state.lock().await;
            if state.retired {
                drop(state);
                self.remove_retired(&group_id, &group);
                continue;
            }

            state.connections.push(conn);
            self.active.fetch_add(1, Ordering::Relaxed);
            counter!("gateway_connections_total").increment(1);
            gauge!("gateway_active_connections").increment(1.0);
            debug!(
                "Connection added to group {} ({} in group)",
                group_id,
                state.connections.len()
            );

            let mut binding_error = None;
            if created {
                // Bound under the group lock so a concurrent retirement can
                // never unbind before this bind lands.
                match self.binder.bind(&group_id).await {
                    Ok(()) => {
                        counter!("gateway_bindings_total").increment(1);
                        info!("Bound group {}", group_id);
                    }
                    Err(e) => {
                        counter!("gateway_binding_failures_total").increment(1);
                        warn!("Failed to bind group {}: {}", group_id, e);
                        binding_error = Some(e);
                    }
                }
            }

            return Registration {
                group_created: created,
                binding_error,
            };
        }
    }

    /// Write `payload` to every live connection of each target group.
    ///
    /// Unknown groups are skipped. A failed write closes and removes that
    /// connection only; the rest of the pass continues. Connections whose
    /// peer left during the pass are removed as well.
    pub async fn broadcast(&self, targets: &[GroupId], payload: &Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for group_id in targets {
            let Some(group) = self.group(group_id) else {
                debug!("Group {} not registered, skipping", group_id);
                continue;
            };

            let mut state = group.state.lock().await;
            if state.retired {
                continue;
            }
            report.groups += 1;

            let mut failed = Vec::new();
            for conn in state.connections.iter() {
                match conn.send(payload).await {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        debug!(
                            "Write to connection {} in group {} failed: {}",
                            conn.id(),
                            group_id,
                            e
                        );
                        counter!("gateway_connection_write_failures_total").increment(1);
                        failed.push(conn.id());
                    }
                }
            }

            report.dropped += self.remove_dead(&mut state, &failed).await;
            self.retire_if_empty(group_id, &group, state).await;
        }

        report
    }

    /// Drop closed connections from one group without writing to it.
    ///
    /// Returns the number of connections removed. An emptied group is
    /// retired under [`UnbindPolicy::Eager`].
    pub async fn compact(&self, group_id: &GroupId) -> usize {
        let Some(group) = self.group(group_id) else {
            return 0;
        };
        let mut state = group.state.lock().await;
        if state.retired {
            return 0;
        }
        let removed = self.remove_dead(&mut state, &[]).await;
        self.retire_if_empty(group_id, &group, state).await;
        removed
    }

    /// Close every registered connection and clear the registry.
    pub async fn shutdown(&self) {
        let groups: Vec<Arc<Group>> = self.groups.iter().map(|g| Arc::clone(g.value())).collect();
        let mut closed = 0;

        for group in groups {
            let mut state = group.state.lock().await;
            state.retired = true;
            for conn in state.connections.drain(..) {
                conn.close().await;
                closed += 1;
            }
        }

        self.groups.clear();
        self.track_removed(closed);
        info!("Registry shut down, closed {} connections", closed);
    }

    /// Number of groups currently in the map.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Whether `group_id` is currently registered.
    pub fn contains(&self, group_id: &GroupId) -> bool {
        self.groups.contains_key(group_id)
    }

    /// Connection ids of a group in registration order.
    pub async fn members(&self, group_id: &GroupId) -> Vec<u64> {
        match self.group(group_id) {
            Some(group) => group
                .state
                .lock()
                .await
                .connections
                .iter()
                .map(|c| c.id())
                .collect(),
            None => Vec::new(),
        }
    }
}
