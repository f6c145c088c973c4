//! Per-shard connection pool.
//!
//! A shard owns one instance per endpoint it currently tracks. Instances
//! move through three states:
//!
//! - **Pending** — connection created, handshake not finished. Never
//!   picked for dispatch.
//! - **Live** — connection reported ready.
//! - **Draining** — endpoint left the topology. No new commands; the
//!   instance is reaped once its in-flight count hits zero.
//!
//! Mutation happens only on the engine loop. The pool still sits behind
//! a `std::sync::RwLock` because callers hold shard handles for the
//! read-only statistics surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::connection::Connection;
use crate::stats::{InstanceStats, InstanceStatistics, ShardStatistics};
use crate::types::{ConnectionId, Endpoint, Role, RoleRequirement, ShardId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstanceState {
    Pending,
    Live,
    Draining,
}

impl InstanceState {
    fn label(self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Live => "live",
            InstanceState::Draining => "draining",
        }
    }
}

struct Instance {
    id: ConnectionId,
    endpoint: Endpoint,
    role: Role,
    state: InstanceState,
    conn: Arc<dyn Connection>,
    stats: Arc<InstanceStats>,
}

/// A connection chosen for one dispatch.
#[derive(Clone)]
pub(crate) struct PickedConnection {
    pub id: ConnectionId,
    pub instance_idx: usize,
    pub conn: Arc<dyn Connection>,
    pub stats: Arc<InstanceStats>,
}

/// Difference between the tracked endpoint set and a desired one.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct EndpointDiff {
    pub added: Vec<(Endpoint, Role)>,
    pub removed: Vec<ConnectionId>,
    /// Endpoints kept but whose role flipped (failover promotions).
    pub role_changed: Vec<(ConnectionId, Role)>,
}

impl EndpointDiff {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.role_changed.is_empty()
    }
}

/// One logical shard and its pool of connections.
pub struct Shard {
    id: ShardId,
    name: String,
    instances: RwLock<Vec<Instance>>,
    cursor: AtomicUsize,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Shard {
    pub(crate) fn new(id: ShardId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            instances: RwLock::new(Vec::new()),
            // start pools at different offsets so shards don't probe
            // their instance lists in lockstep
            cursor: AtomicUsize::new(rand::random::<u32>() as usize),
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Instance>> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Instance>> {
        self.instances.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Picks a live connection for a dispatch.
    ///
    /// `prev_instance` is the pool index that just failed for this
    /// command; it is skipped whenever an alternative exists so retries
    /// land elsewhere. Selection round-robins over the candidates.
    pub(crate) fn pick_connection(
        &self,
        role: RoleRequirement,
        prev_instance: Option<usize>,
    ) -> Option<PickedConnection> {
        let instances = self.read();

        let mut candidates: Vec<usize> = instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| {
                inst.state == InstanceState::Live
                    && inst.conn.is_ready()
                    && match role {
                        RoleRequirement::MustPrimary => inst.role == Role::Primary,
                        RoleRequirement::Any => true,
                    }
            })
            .map(|(idx, _)| idx)
            .collect();

        if candidates.len() > 1 {
            if let Some(prev) = prev_instance {
                candidates.retain(|&idx| idx != prev);
            }
        }
        if candidates.is_empty() {
            return None;
        }

        let pick = candidates[self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()];
        let inst = &instances[pick];
        Some(PickedConnection {
            id: inst.id,
            instance_idx: pick,
            conn: Arc::clone(&inst.conn),
            stats: Arc::clone(&inst.stats),
        })
    }

    /// Finds the live connection for a specific endpoint (ASK target).
    pub(crate) fn connection_for_endpoint(&self, endpoint: &Endpoint) -> Option<PickedConnection> {
        let instances = self.read();
        instances
            .iter()
            .enumerate()
            .find(|(_, inst)| {
                inst.state == InstanceState::Live
                    && inst.conn.is_ready()
                    && inst.endpoint == *endpoint
            })
            .map(|(idx, inst)| PickedConnection {
                id: inst.id,
                instance_idx: idx,
                conn: Arc::clone(&inst.conn),
                stats: Arc::clone(&inst.stats),
            })
    }

    /// Compares the tracked endpoints against a desired set.
    pub(crate) fn diff_endpoints(&self, desired: &[(Endpoint, Role)]) -> EndpointDiff {
        let instances = self.read();
        let mut diff = EndpointDiff::default();

        let mut desired_map: HashMap<&Endpoint, Role> = HashMap::with_capacity(desired.len());
        for (ep, role) in desired {
            desired_map.entry(ep).or_insert(*role);
        }

        for inst in instances
            .iter()
            .filter(|i| i.state != InstanceState::Draining)
        {
            match desired_map.remove(&inst.endpoint) {
                None => diff.removed.push(inst.id),
                Some(role) if role != inst.role => diff.role_changed.push((inst.id, role)),
                Some(_) => {}
            }
        }

        for (ep, role) in desired {
            if desired_map.contains_key(ep) {
                diff.added.push((ep.clone(), *role));
                desired_map.remove(ep);
            }
        }

        diff
    }

    /// Inserts a freshly created connection in the pending state.
    pub(crate) fn insert_pending(
        &self,
        id: ConnectionId,
        endpoint: Endpoint,
        role: Role,
        conn: Arc<dyn Connection>,
    ) -> Arc<InstanceStats> {
        let stats = Arc::new(InstanceStats::default());
        self.write().push(Instance {
            id,
            endpoint,
            role,
            state: InstanceState::Pending,
            conn,
            stats: Arc::clone(&stats),
        });
        stats
    }

    /// Applies a role flip from a topology refresh.
    pub(crate) fn set_role(&self, id: ConnectionId, role: Role) {
        if let Some(inst) = self.write().iter_mut().find(|i| i.id == id) {
            debug!("{}: {} at {} is now {role}", self.name, id, inst.endpoint);
            inst.role = role;
        }
    }

    /// Marks an instance live. Returns its role when the flip happened.
    pub(crate) fn mark_ready(&self, id: ConnectionId) -> Option<Role> {
        let mut instances = self.write();
        let inst = instances.iter_mut().find(|i| i.id == id)?;
        if inst.state == InstanceState::Pending {
            inst.state = InstanceState::Live;
            Some(inst.role)
        } else {
            None
        }
    }

    /// Handles a connection loss. A pending or live instance goes back
    /// to pending (the factory's connection keeps reconnecting under the
    /// same id); a draining instance is dropped outright. Returns the
    /// state the instance was in, `None` for an unknown id.
    pub(crate) fn mark_disconnected(&self, id: ConnectionId) -> Option<InstanceState> {
        let mut instances = self.write();
        let pos = instances.iter().position(|i| i.id == id)?;
        let prev = instances[pos].state;
        if prev == InstanceState::Draining {
            let inst = instances.remove(pos);
            inst.conn.close();
        } else {
            instances[pos].state = InstanceState::Pending;
        }
        Some(prev)
    }

    /// Moves an instance into the draining state.
    pub(crate) fn begin_drain(&self, id: ConnectionId) {
        if let Some(inst) = self.write().iter_mut().find(|i| i.id == id) {
            debug!("{}: draining {} at {}", self.name, id, inst.endpoint);
            inst.state = InstanceState::Draining;
        }
    }

    /// Closes and removes draining instances with nothing in flight.
    /// Returns the ids that were reaped.
    pub(crate) fn reap_drained(&self) -> Vec<ConnectionId> {
        let mut instances = self.write();
        let mut reaped = Vec::new();
        instances.retain(|inst| {
            let done = inst.state == InstanceState::Draining && inst.stats.in_flight() == 0;
            if done {
                inst.conn.close();
                reaped.push(inst.id);
            }
            !done
        });
        reaped
    }

    /// Marks every non-draining instance draining (shard leaving the
    /// topology).
    pub(crate) fn drain_all(&self) {
        for inst in self.write().iter_mut() {
            inst.state = InstanceState::Draining;
        }
    }

    /// Clones of every live connection, for discovery fan-out.
    pub(crate) fn live_connections(&self) -> Vec<Arc<dyn Connection>> {
        self.read()
            .iter()
            .filter(|i| i.state == InstanceState::Live && i.conn.is_ready())
            .map(|i| Arc::clone(&i.conn))
            .collect()
    }

    /// Closes every connection unconditionally (engine shutdown).
    pub(crate) fn close_all(&self) {
        let mut instances = self.write();
        for inst in instances.drain(..) {
            inst.conn.close();
        }
    }

    /// Whether some live instance serves the given role.
    pub(crate) fn has_live(&self, role: Role) -> bool {
        self.read()
            .iter()
            .any(|i| i.state == InstanceState::Live && i.role == role)
    }

    /// Number of non-draining instances configured for a role.
    pub(crate) fn configured(&self, role: Role) -> usize {
        self.read()
            .iter()
            .filter(|i| i.state != InstanceState::Draining && i.role == role)
            .count()
    }

    /// Endpoints currently tracked (non-draining), with their roles.
    pub fn endpoints(&self) -> Vec<(Endpoint, Role)> {
        self.read()
            .iter()
            .filter(|i| i.state != InstanceState::Draining)
            .map(|i| (i.endpoint.clone(), i.role))
            .collect()
    }

    /// Weights for client-side balancing across this shard's servers.
    ///
    /// Replicas are always included, the primary only when asked.
    /// Weight falls with the latency EWMA and with recent errors, so a
    /// slow or flapping instance draws less traffic without being cut
    /// off entirely. `max_latency_us` excludes instances whose EWMA
    /// already exceeds the caller's remaining deadline.
    pub(crate) fn weighted_servers(
        &self,
        with_primary: bool,
        max_latency_us: Option<u64>,
    ) -> HashMap<ConnectionId, u32> {
        self.read()
            .iter()
            .filter(|inst| inst.state == InstanceState::Live)
            .filter(|inst| with_primary || inst.role == Role::Replica)
            .filter(|inst| {
                max_latency_us.is_none_or(|max| inst.stats.latency_ewma_us() <= max)
            })
            .map(|inst| {
                let base = 1_000_000 / (1_000 + inst.stats.latency_ewma_us());
                let weight = base / (1 + inst.stats.recent_errors() as u64);
                (inst.id, weight.max(1) as u32)
            })
            .collect()
    }

    /// Read-only statistics snapshot for this shard.
    pub fn statistics(&self) -> ShardStatistics {
        ShardStatistics {
            name: self.name.clone(),
            instances: self
                .read()
                .iter()
                .map(|inst| InstanceStatistics {
                    id: inst.id,
                    endpoint: inst.endpoint.clone(),
                    role: inst.role,
                    state: inst.state.label(),
                    requests: inst.stats.requests(),
                    errors: inst.stats.errors(),
                    latency_ewma_us: inst.stats.latency_ewma_us(),
                })
                .collect(),
        }
    }
}
