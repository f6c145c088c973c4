//! The live shard collection and the reconfiguration protocol.
//!
//! [`ShardSet`] owns one [`Shard`] arena per logical shard plus the
//! sentinel pool. Applying a topology snapshot runs the reconfiguration
//! protocol:
//!
//! 1. validate the snapshot (a bad one changes nothing),
//! 2. per shard, diff desired endpoints against tracked ones,
//! 3. keep retained connections, apply role flips in place,
//! 4. open added endpoints in the pending state,
//! 5. mark removed endpoints draining,
//! 6. publish the new host index and slot map,
//! 7. only afterwards let the sweep reap drained connections.
//!
//! Publishing before closing means a redirect naming a still-valid
//! target can never observe a stale-empty host index.

use std::sync::Arc;

use rudder_routing::{generate_keys_for_shards, HostIndex, SlotMap};
use tracing::{debug, info, warn};

use crate::connection::ConnectionEvents;
use crate::controller::{EngineCore, RoutingTable};
use crate::error::TopologyError;
use crate::poller::{SnapshotSource, TopologySnapshot};
use crate::readiness::ReadinessGate;
use crate::shard::Shard;
use crate::types::{ConnectionId, Endpoint, Role, ShardId, SENTINEL_SHARD};

/// The engine's shard arenas: tracked data shards plus the sentinel pool.
#[derive(Default)]
pub(crate) struct ShardSet {
    shards: Vec<Arc<Shard>>,
    sentinel: Option<Arc<Shard>>,
}

impl ShardSet {
    pub fn count(&self) -> usize {
        self.shards.len()
    }

    pub fn get(&self, id: ShardId) -> Option<&Arc<Shard>> {
        if id == SENTINEL_SHARD {
            self.sentinel.as_ref()
        } else {
            self.shards.get(id.index())
        }
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    pub fn sentinel(&self) -> Option<&Arc<Shard>> {
        self.sentinel.as_ref()
    }

    pub fn set_sentinel(&mut self, shard: Arc<Shard>) {
        self.sentinel = Some(shard);
    }

    pub fn push(&mut self, shard: Arc<Shard>) {
        self.shards.push(shard);
    }

    /// Every arena including the sentinel pool, for sweeps and shutdown.
    pub fn all(&self) -> impl Iterator<Item = &Arc<Shard>> {
        self.shards.iter().chain(self.sentinel.iter())
    }

    pub fn close_all(&self) {
        for shard in self.all() {
            shard.close_all();
        }
    }

    /// Published copy of the shard list for external readers.
    pub fn published(&self) -> Arc<Vec<Arc<Shard>>> {
        Arc::new(self.shards.clone())
    }
}

impl EngineCore {
    /// Opens a connection for an endpoint and registers it in a shard.
    pub(crate) fn open_connection(&mut self, shard: &Arc<Shard>, endpoint: Endpoint, role: Role) {
        let id = ConnectionId(self.next_conn);
        self.next_conn += 1;
        let events = ConnectionEvents::new(id, self.conn_tx.clone());
        let conn = self.factory.connect(&endpoint, events);
        debug!("{}: opening {} to {} as {}", shard.name(), id, endpoint, role);
        shard.insert_pending(id, endpoint, role, conn);
        self.conn_shards.insert(id, shard.id());
    }

    /// Applies one discovery snapshot to the shard set.
    pub(crate) fn apply_snapshot(&mut self, snap: TopologySnapshot) {
        if let Err(e) = self.validate_snapshot(&snap) {
            warn!("discarding topology snapshot: {e}");
            return;
        }

        // slot map first: a rejected rebuild must leave everything alone
        let old = self.shared.routing_snapshot();
        let slot_map = match &snap.slots {
            Some(intervals) => {
                match SlotMap::from_intervals(intervals, old.slot_map.epoch() + 1) {
                    Ok(map) => map,
                    Err(e) => {
                        warn!(
                            "discarding topology snapshot: {}",
                            TopologyError::InconsistentSnapshot(e.to_string())
                        );
                        return;
                    }
                }
            }
            None => old.slot_map.clone(),
        };
        let slots_changed = snap.slots.is_some() && slot_map != old.slot_map;

        // grow the arena for newly discovered shards (cluster mode)
        while self.shard_set.count() < snap.shards.len() {
            let id = ShardId(self.shard_set.count() as u16);
            let name = snap.shards[id.index()].name.clone();
            info!("tracking new {id} ({name})");
            self.shard_set.push(Arc::new(Shard::new(id, name)));
            self.gates.push(Arc::new(ReadinessGate::new()));
        }

        // per-shard endpoint diff
        for (idx, desired) in snap.shards.iter().enumerate() {
            let shard = Arc::clone(&self.shard_set.shards()[idx]);
            let mut endpoints: Vec<(Endpoint, Role)> = Vec::new();
            for ep in &desired.primaries {
                endpoints.push((ep.clone(), Role::Primary));
            }
            for ep in &desired.replicas {
                endpoints.push((ep.clone(), Role::Replica));
            }

            let diff = shard.diff_endpoints(&endpoints);
            if diff.is_noop() {
                continue;
            }
            info!(
                "{}: topology change, +{} -{} ~{}",
                shard.name(),
                diff.added.len(),
                diff.removed.len(),
                diff.role_changed.len()
            );
            for (id, role) in diff.role_changed {
                shard.set_role(id, role);
            }
            for id in diff.removed {
                shard.begin_drain(id);
            }
            for (endpoint, role) in diff.added {
                self.open_connection(&shard, endpoint, role);
            }
        }

        // shards the snapshot no longer mentions lose their endpoints
        for shard in &self.shard_set.shards()[snap.shards.len()..] {
            if shard.configured(Role::Primary) + shard.configured(Role::Replica) > 0 {
                info!("{}: no longer in topology, draining", shard.name());
                shard.drain_all();
            }
        }

        // publish the new routing pair before anything drains away
        let host_index = HostIndex::from_entries(self.shard_set.shards().iter().flat_map(
            |shard| {
                let id = shard.id();
                shard
                    .endpoints()
                    .into_iter()
                    .map(move |(ep, _)| (ep.host, ep.port, id))
            },
        ));
        self.shared.publish_routing(RoutingTable {
            slot_map,
            host_index,
        });
        self.shared.publish_shards(self.shard_set.published());
        self.shared.publish_gates(Arc::new(self.gates.clone()));

        if slots_changed {
            let routing = self.shared.routing_snapshot();
            let keys = generate_keys_for_shards(
                &routing.slot_map,
                self.shard_set.count() as u16,
                self.cfg.key_gen_max_len,
            );
            self.shared.publish_keys(keys);
        }

        self.refresh_all_gates();
        self.topology_seen = true;
        self.bump_refresh_counter();
        self.drain_pending();
    }

    fn validate_snapshot(&self, snap: &TopologySnapshot) -> Result<(), TopologyError> {
        match snap.source {
            SnapshotSource::Sentinel => {
                // must cover every tracked shard with a usable primary;
                // partial answers keep the previous topology
                if snap.shards.len() != self.shard_set.count() {
                    return Err(TopologyError::InconsistentSnapshot(format!(
                        "snapshot names {} shards, tracking {}",
                        snap.shards.len(),
                        self.shard_set.count()
                    )));
                }
                if let Some(uncovered) =
                    snap.shards.iter().find(|shard| shard.primaries.is_empty())
                {
                    return Err(TopologyError::InconsistentSnapshot(format!(
                        "no usable primary reported for {}",
                        uncovered.name
                    )));
                }
                Ok(())
            }
            SnapshotSource::Cluster => {
                // a cluster reply is authoritative for the whole
                // keyspace; it must carry slots and cover each shard
                if snap.slots.as_ref().is_none_or(|slots| slots.is_empty()) {
                    return Err(TopologyError::InconsistentSnapshot(
                        "cluster snapshot without slot ranges".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Recomputes both readiness bits of one shard from its pool.
    pub(crate) fn refresh_gate(&self, shard_id: ShardId) {
        if shard_id == SENTINEL_SHARD {
            return;
        }
        let (Some(shard), Some(gate)) = (
            self.shard_set.get(shard_id),
            self.gates.get(shard_id.index()),
        ) else {
            return;
        };
        gate.set_primary_ready(shard.has_live(Role::Primary));
        gate.set_replica_ready(shard.has_live(Role::Replica));
    }

    pub(crate) fn refresh_all_gates(&self) {
        for idx in 0..self.shard_set.count() {
            self.refresh_gate(ShardId(idx as u16));
        }
    }
}
