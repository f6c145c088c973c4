//! Engine lifecycle, event loop, and public handle.
//!
//! All mutable topology state (shard set, slot map and host index
//! producer sides, readiness gates, pending queue) is owned by a single
//! tokio task, the engine loop. Everything else talks to it through an
//! unbounded mpsc inbox; sending is the "append under a short lock plus
//! async wakeup" hand-off, and the loop drains bursts with `try_recv`
//! before sleeping again.
//!
//! External readers never wait on the loop: lookups go against
//! `RwLock<Arc<_>>`-published immutable snapshots, readiness waits go
//! against per-shard watch channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rudder_routing::{key_slot, HostIndex, KeyShard, KeysForShards, ShardId, SlotMap};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandOutcome, CommandTask, Hint};
use crate::config::{CommandControl, DiscoveryMode, EngineConfig};
use crate::connection::{ConnectionEvent, ConnectionEventKind, ConnectionFactory, ReplyResult};
use crate::error::{CommandError, InitError, TopologyError};
use crate::pending::PendingQueue;
use crate::poller::{
    fetch_cluster_snapshot, fetch_sentinel_snapshot, PollerState, SnapshotSource,
    TopologySnapshot,
};
use crate::readiness::{ReadinessGate, WaitMode};
use crate::shard::Shard;
use crate::shard_set::ShardSet;
use crate::stats::{counters_snapshot, EngineCounters, InstanceStats, SentinelStatistics};
use crate::types::{ConnectionId, Endpoint, Role, RoleRequirement, SENTINEL_SHARD};

/// Lifecycle of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineState {
    Created = 0,
    Initialized = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EngineState::Created,
            1 => EngineState::Initialized,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Created => "created",
            EngineState::Initialized => "initialized",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        }
    }
}

/// Everything the engine loop reacts to.
pub(crate) enum LoopEvent {
    Submit(CommandTask),
    Reply {
        dispatch: u64,
        result: ReplyResult,
    },
    Topology {
        source: SnapshotSource,
        result: Result<TopologySnapshot, TopologyError>,
    },
    ForceRefresh,
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// The atomically swapped routing pair. Readers always see a coherent
/// (slot map, host index) combination, possibly one refresh behind.
#[derive(Debug, Clone)]
pub(crate) struct RoutingTable {
    pub slot_map: SlotMap,
    pub host_index: HostIndex,
}

impl RoutingTable {
    fn initial() -> Self {
        Self {
            slot_map: SlotMap::unknown(),
            host_index: HostIndex::empty(),
        }
    }
}

/// State shared between the engine loop and public handles.
pub(crate) struct EngineShared {
    routing: RwLock<Arc<RoutingTable>>,
    shards: RwLock<Arc<Vec<Arc<Shard>>>>,
    sentinel: RwLock<Option<Arc<Shard>>>,
    gates: RwLock<Arc<Vec<Arc<ReadinessGate>>>>,
    keys: RwLock<Arc<KeysForShards>>,
    pub counters: EngineCounters,
    state: AtomicU8,
    pub tx: mpsc::UnboundedSender<LoopEvent>,
    key_shard: Option<Arc<dyn KeyShard>>,
    stop_grace: Duration,
    default_control: CommandControl,
}

impl EngineShared {
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn routing_snapshot(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.routing.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn shards_snapshot(&self) -> Arc<Vec<Arc<Shard>>> {
        Arc::clone(&self.shards.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn sentinel_snapshot(&self) -> Option<Arc<Shard>> {
        self.sentinel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn gates_snapshot(&self) -> Arc<Vec<Arc<ReadinessGate>>> {
        Arc::clone(&self.gates.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn keys_snapshot(&self) -> Arc<KeysForShards> {
        Arc::clone(&self.keys.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn publish_routing(&self, table: RoutingTable) {
        *self.routing.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
    }

    pub fn publish_shards(&self, shards: Arc<Vec<Arc<Shard>>>) {
        *self.shards.write().unwrap_or_else(|e| e.into_inner()) = shards;
    }

    pub fn publish_gates(&self, gates: Arc<Vec<Arc<ReadinessGate>>>) {
        *self.gates.write().unwrap_or_else(|e| e.into_inner()) = gates;
    }

    pub fn publish_keys(&self, keys: KeysForShards) {
        *self.keys.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(keys);
    }

    fn set_sentinel(&self, shard: Arc<Shard>) {
        *self.sentinel.write().unwrap_or_else(|e| e.into_inner()) = Some(shard);
    }

    /// Applies a single-slot ownership fix observed from a `MOVED`
    /// reply. The update only lands if the routing table is still at the
    /// epoch the redirect was interpreted against; a full rebuild that
    /// swapped in meanwhile wins. Returns whether the update was
    /// applied.
    pub(crate) fn apply_point_update(
        &self,
        observed_epoch: u64,
        slot: u16,
        shard: ShardId,
    ) -> bool {
        let current = self.routing_snapshot();
        if current.slot_map.epoch() != observed_epoch {
            debug!(
                "slot {slot} point update dropped: epoch {} moved past {}",
                current.slot_map.epoch(),
                observed_epoch
            );
            return false;
        }
        self.publish_routing(RoutingTable {
            slot_map: current.slot_map.with_point_update(slot, shard),
            host_index: current.host_index.clone(),
        });
        true
    }
}

/// One dispatched command awaiting its reply.
pub(crate) struct InFlight {
    pub task: CommandTask,
    pub instance_idx: usize,
    pub stats: Arc<InstanceStats>,
    pub sent_at: Instant,
}

pub(crate) struct StopState {
    ack: oneshot::Sender<()>,
    deadline: Instant,
}

/// The loop-owned core. Only `run()` ever touches it.
pub(crate) struct EngineCore {
    pub cfg: EngineConfig,
    pub factory: Arc<dyn ConnectionFactory>,
    pub shared: Arc<EngineShared>,
    pub shard_set: ShardSet,
    pub gates: Vec<Arc<ReadinessGate>>,
    pub pending: PendingQueue,
    pub in_flight: HashMap<u64, InFlight>,
    pub next_dispatch: u64,
    pub next_conn: u32,
    pub conn_shards: HashMap<ConnectionId, ShardId>,
    pub poller: PollerState,
    pub topology_seen: bool,
    rx: mpsc::UnboundedReceiver<LoopEvent>,
    pub conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    stop: Option<StopState>,
    finished: bool,
}

impl EngineCore {
    async fn run(mut self) {
        let mut poll_tick = tokio::time::interval(self.cfg.check_interval);
        let mut sweep_tick = tokio::time::interval(Duration::from_millis(100));
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("engine loop running ({:?})", self.cfg.mode);

        while !self.finished {
            tokio::select! {
                Some(ev) = self.rx.recv() => {
                    self.handle(ev);
                    // drain the burst before sleeping again
                    while !self.finished {
                        match self.rx.try_recv() {
                            Ok(ev) => self.handle(ev),
                            Err(_) => break,
                        }
                    }
                }
                Some(ev) = self.conn_rx.recv() => {
                    self.on_conn_event(ev);
                    while let Ok(ev) = self.conn_rx.try_recv() {
                        self.on_conn_event(ev);
                    }
                }
                _ = poll_tick.tick() => self.start_discovery(),
                _ = sweep_tick.tick() => self.on_sweep(),
            }
        }

        info!("engine loop stopped");
    }

    fn handle(&mut self, ev: LoopEvent) {
        match ev {
            LoopEvent::Submit(task) => self.dispatch(task),
            LoopEvent::Reply { dispatch, result } => self.on_reply(dispatch, result),
            LoopEvent::Topology { source, result } => self.on_topology(source, result),
            LoopEvent::ForceRefresh => {
                debug!("forced topology refresh requested");
                self.start_discovery();
            }
            LoopEvent::Stop { ack } => self.on_stop(ack),
        }
    }

    fn on_conn_event(&mut self, ev: ConnectionEvent) {
        let Some(&shard_id) = self.conn_shards.get(&ev.id) else {
            return;
        };
        let Some(shard) = self.shard_set.get(shard_id).cloned() else {
            return;
        };

        match ev.kind {
            ConnectionEventKind::Ready => {
                if let Some(role) = shard.mark_ready(ev.id) {
                    info!("{}: {} ready as {role}", shard.name(), ev.id);
                    self.refresh_gate(shard_id);
                    if !self.topology_seen {
                        // first usable connection: learn topology now
                        // instead of waiting out the timer
                        self.start_discovery();
                    }
                    self.drain_pending();
                }
            }
            ConnectionEventKind::Disconnected => {
                warn!("{}: {} disconnected", shard.name(), ev.id);
                if let Some(crate::shard::InstanceState::Draining) = shard.mark_disconnected(ev.id)
                {
                    self.conn_shards.remove(&ev.id);
                }
                self.refresh_gate(shard_id);
            }
        }
    }

    fn on_topology(
        &mut self,
        source: SnapshotSource,
        result: Result<TopologySnapshot, TopologyError>,
    ) {
        self.poller.set_in_flight(source, false);
        match result {
            Ok(snapshot) => self.apply_snapshot(snapshot),
            // transient failure: keep the previous topology, the next
            // poll retries
            Err(e) => warn!("topology poll failed: {e}"),
        }
    }

    pub(crate) fn start_discovery(&mut self) {
        if self.stop.is_some() {
            return;
        }
        match &self.cfg.mode {
            DiscoveryMode::Sentinel { shards } => {
                if self.poller.in_flight(SnapshotSource::Sentinel) {
                    return;
                }
                let names = shards.clone();
                let Some(sentinel) = self.shard_set.sentinel() else {
                    return;
                };
                let conns = sentinel.live_connections();
                if conns.is_empty() {
                    self.on_topology(
                        SnapshotSource::Sentinel,
                        Err(TopologyError::SentinelUnreachable),
                    );
                    return;
                }
                self.poller.set_in_flight(SnapshotSource::Sentinel, true);
                let timeout = self.cfg.sentinel_timeout;
                let tx = self.shared.tx.clone();
                tokio::spawn(async move {
                    let result = fetch_sentinel_snapshot(conns, names, timeout).await;
                    let _ = tx.send(LoopEvent::Topology {
                        source: SnapshotSource::Sentinel,
                        result,
                    });
                });
            }
            DiscoveryMode::Cluster => {
                if self.poller.in_flight(SnapshotSource::Cluster) {
                    return;
                }
                // rotate through shards so one unresponsive primary
                // cannot monopolize discovery
                let count = self.shard_set.count();
                if count == 0 {
                    return;
                }
                let mut conn = None;
                for step in 0..count {
                    let idx = (self.poller.current_slots_shard + step) % count;
                    let shard = &self.shard_set.shards()[idx];
                    if let Some(picked) =
                        shard.pick_connection(RoleRequirement::MustPrimary, None)
                    {
                        self.poller.current_slots_shard = (idx + 1) % count;
                        conn = Some(picked.conn);
                        break;
                    }
                }
                let Some(conn) = conn else {
                    self.on_topology(SnapshotSource::Cluster, Err(TopologyError::NoSlotsSource));
                    return;
                };
                self.poller.set_in_flight(SnapshotSource::Cluster, true);
                let timeout = self.cfg.cluster_slots_timeout;
                let tx = self.shared.tx.clone();
                tokio::spawn(async move {
                    let result = fetch_cluster_snapshot(conn, timeout).await;
                    let _ = tx.send(LoopEvent::Topology {
                        source: SnapshotSource::Cluster,
                        result,
                    });
                });
            }
        }
    }

    pub(crate) fn bump_refresh_counter(&self) {
        EngineCounters::bump(&self.shared.counters.topology_refreshes);
    }

    fn on_sweep(&mut self) {
        let now = Instant::now();

        // a command that expires while still queued never found a ready
        // connection; that is what its caller gets told
        for task in self.pending.take_expired(now) {
            debug!(
                "queued command expired {:?} after submission",
                now.saturating_duration_since(task.submitted_at)
            );
            self.complete_task(task, Err(CommandError::NoReadyConnection));
        }

        let mut reaped = Vec::new();
        for shard in self.shard_set.all() {
            reaped.extend(shard.reap_drained());
        }
        for id in reaped {
            self.conn_shards.remove(&id);
        }

        if !self.pending.is_empty() {
            self.drain_pending();
        }

        self.maybe_finish_stop(now);
    }

    fn on_stop(&mut self, ack: oneshot::Sender<()>) {
        if self.stop.is_some() {
            // a second stop just gets acknowledged with the first
            let _ = ack.send(());
            return;
        }
        self.shared.set_state(EngineState::Stopping);
        info!(
            "stopping: failing {} queued commands, {} in flight",
            self.pending.len(),
            self.in_flight.len()
        );

        for task in self.pending.take_all() {
            self.complete_task(task, Err(CommandError::ShuttingDown));
        }

        self.stop = Some(StopState {
            ack,
            deadline: Instant::now() + self.cfg.stop_grace,
        });
        self.maybe_finish_stop(Instant::now());
    }

    pub(crate) fn maybe_finish_stop(&mut self, now: Instant) {
        let Some(stop) = &self.stop else {
            return;
        };
        if !self.in_flight.is_empty() && now < stop.deadline {
            return;
        }
        if !self.in_flight.is_empty() {
            warn!(
                "stop grace elapsed with {} replies outstanding",
                self.in_flight.len()
            );
            for (_, inflight) in self.in_flight.drain() {
                inflight.task.complete(Err(CommandError::ShuttingDown));
            }
        }

        self.shard_set.close_all();
        self.shared.set_state(EngineState::Stopped);
        if let Some(stop) = self.stop.take() {
            let _ = stop.ack.send(());
        }
        self.finished = true;
    }

    pub(crate) fn stopping(&self) -> bool {
        self.stop.is_some()
    }
}

struct Boot {
    cfg: EngineConfig,
    factory: Arc<dyn ConnectionFactory>,
    rx: mpsc::UnboundedReceiver<LoopEvent>,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    shard_set: ShardSet,
    gates: Vec<Arc<ReadinessGate>>,
    conn_shards: HashMap<ConnectionId, ShardId>,
    next_conn: u32,
}

impl Boot {
    fn open_seed(&mut self, shard: &Arc<Shard>, endpoint: Endpoint, role: Role) {
        let id = ConnectionId(self.next_conn);
        self.next_conn += 1;
        let events = crate::connection::ConnectionEvents::new(id, self.conn_tx.clone());
        let conn = self.factory.connect(&endpoint, events);
        shard.insert_pending(id, endpoint, role, conn);
        self.conn_shards.insert(id, shard.id());
    }
}

/// Public handle to one routing engine. Cheap to clone; all clones talk
/// to the same engine loop.
#[derive(Clone)]
pub struct RoutingEngine {
    shared: Arc<EngineShared>,
    boot: Arc<Mutex<Option<Boot>>>,
}

impl RoutingEngine {
    /// Creates an engine in the `Created` state. `init()` opens the seed
    /// connections, `start()` runs the loop.
    pub fn new(cfg: EngineConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(EngineShared {
            routing: RwLock::new(Arc::new(RoutingTable::initial())),
            shards: RwLock::new(Arc::new(Vec::new())),
            sentinel: RwLock::new(None),
            gates: RwLock::new(Arc::new(Vec::new())),
            keys: RwLock::new(Arc::new(KeysForShards::default())),
            counters: EngineCounters::default(),
            state: AtomicU8::new(EngineState::Created as u8),
            tx,
            key_shard: cfg.key_shard.clone(),
            stop_grace: cfg.stop_grace,
            default_control: cfg.default_control,
        });

        let boot = Boot {
            cfg,
            factory,
            rx,
            conn_tx,
            conn_rx,
            shard_set: ShardSet::default(),
            gates: Vec::new(),
            conn_shards: HashMap::new(),
            next_conn: 0,
        };

        Self {
            shared,
            boot: Arc::new(Mutex::new(Some(boot))),
        }
    }

    /// Builds the initial shards from the seed connection info.
    pub fn init(&self) -> Result<(), InitError> {
        let mut guard = self.boot.lock().unwrap_or_else(|e| e.into_inner());
        let state = self.shared.state();
        if state != EngineState::Created {
            return Err(InitError::AlreadyInitialized(state.as_str()));
        }
        let boot = guard
            .as_mut()
            .ok_or(InitError::AlreadyInitialized(state.as_str()))?;
        if boot.cfg.seeds.is_empty() {
            return Err(InitError::NoSeeds);
        }

        match boot.cfg.mode.clone() {
            DiscoveryMode::Sentinel { shards: names } => {
                if names.is_empty() {
                    return Err(InitError::NoTrackedShards);
                }

                let sentinel = Arc::new(Shard::new(SENTINEL_SHARD, "sentinel"));
                for seed in boot.cfg.seeds.clone() {
                    boot.open_seed(&sentinel, seed, Role::Primary);
                }
                boot.shard_set.set_sentinel(Arc::clone(&sentinel));
                self.shared.set_sentinel(sentinel);

                for (idx, name) in names.iter().enumerate() {
                    boot.shard_set
                        .push(Arc::new(Shard::new(ShardId(idx as u16), name.clone())));
                    boot.gates.push(Arc::new(ReadinessGate::new()));
                }
            }
            DiscoveryMode::Cluster => {
                // each seed forms a provisional shard; the first CLUSTER
                // SLOTS answer replaces this layout wholesale
                let mut entries = Vec::new();
                for (idx, seed) in boot.cfg.seeds.clone().into_iter().enumerate() {
                    let id = ShardId(idx as u16);
                    let shard = Arc::new(Shard::new(id, seed.to_string()));
                    boot.open_seed(&shard, seed.clone(), Role::Primary);
                    boot.shard_set.push(shard);
                    boot.gates.push(Arc::new(ReadinessGate::new()));
                    entries.push((seed.host, seed.port, id));
                }
                self.shared.publish_routing(RoutingTable {
                    slot_map: SlotMap::unknown(),
                    host_index: HostIndex::from_entries(entries),
                });
            }
        }

        self.shared.publish_shards(boot.shard_set.published());
        self.shared
            .publish_gates(Arc::new(boot.gates.clone()));
        self.shared.set_state(EngineState::Initialized);
        info!(
            "engine initialized: {} shards, {} seed connections",
            boot.shard_set.count(),
            boot.next_conn
        );
        Ok(())
    }

    /// Spawns the engine loop. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<(), InitError> {
        let mut guard = self.boot.lock().unwrap_or_else(|e| e.into_inner());
        let state = self.shared.state();
        if state != EngineState::Initialized {
            return Err(InitError::NotInitialized(state.as_str()));
        }
        let boot = guard
            .take()
            .ok_or(InitError::NotInitialized(state.as_str()))?;

        let core = EngineCore {
            cfg: boot.cfg,
            factory: boot.factory,
            shared: Arc::clone(&self.shared),
            shard_set: boot.shard_set,
            gates: boot.gates,
            pending: PendingQueue::default(),
            in_flight: HashMap::new(),
            next_dispatch: 0,
            next_conn: boot.next_conn,
            conn_shards: boot.conn_shards,
            poller: PollerState::default(),
            topology_seen: false,
            rx: boot.rx,
            conn_tx: boot.conn_tx,
            conn_rx: boot.conn_rx,
            stop: None,
            finished: false,
        };

        self.shared.set_state(EngineState::Running);
        tokio::spawn(core.run());
        Ok(())
    }

    /// Stops the engine: queued commands fail with `ShuttingDown`,
    /// in-flight replies get the configured grace period, then every
    /// connection closes.
    pub async fn stop(&self) {
        match self.shared.state() {
            EngineState::Created | EngineState::Initialized => {
                // no loop to drain; drop the boot state and its pools
                if let Some(boot) = self.boot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    boot.shard_set.close_all();
                }
                self.shared.set_state(EngineState::Stopped);
            }
            EngineState::Running => {
                let (ack_tx, ack_rx) = oneshot::channel();
                if self.shared.tx.send(LoopEvent::Stop { ack: ack_tx }).is_ok() {
                    // margin past the grace period covers the loop's own
                    // sweep cadence
                    let limit = self.shared.stop_grace + Duration::from_secs(1);
                    let _ = tokio::time::timeout(limit, ack_rx).await;
                }
            }
            EngineState::Stopping | EngineState::Stopped => {}
        }
    }

    /// Submits a command. Never blocks; the outcome arrives on the
    /// returned receiver.
    pub fn submit(&self, command: Command, hint: Hint) -> oneshot::Receiver<CommandOutcome> {
        EngineCounters::bump(&self.shared.counters.submitted);
        let (reply_tx, reply_rx) = oneshot::channel();

        if self.shared.state() >= EngineState::Stopping {
            EngineCounters::bump(&self.shared.counters.completed_err);
            let _ = reply_tx.send(Err(CommandError::ShuttingDown));
            return reply_rx;
        }

        let task = CommandTask::new(
            command,
            hint,
            self.shared.default_control,
            reply_tx,
            Instant::now(),
        );
        if let Err(mpsc::error::SendError(LoopEvent::Submit(task))) =
            self.shared.tx.send(LoopEvent::Submit(task))
        {
            EngineCounters::bump(&self.shared.counters.completed_err);
            task.complete(Err(CommandError::ShuttingDown));
        }
        reply_rx
    }

    /// Resolves a key to its shard under the current routing state.
    pub fn shard_by_key(&self, key: &[u8]) -> Option<ShardId> {
        if let Some(policy) = &self.shared.key_shard {
            return Some(policy.shard_of(key));
        }
        self.shared
            .routing_snapshot()
            .slot_map
            .shard_of(key_slot(key))
    }

    /// Number of tracked data shards.
    pub fn shards_count(&self) -> usize {
        self.shared.shards_snapshot().len()
    }

    /// A short key proven to hash into the given shard, if known.
    pub fn any_key_for_shard(&self, shard: ShardId) -> Option<String> {
        self.shared
            .keys_snapshot()
            .key_for_shard(shard)
            .map(str::to_string)
    }

    /// Weights for client-side balancing across one shard's servers.
    /// An unknown shard yields an empty map.
    pub fn available_servers_weighted(
        &self,
        shard: ShardId,
        with_primary: bool,
        cc: &CommandControl,
    ) -> HashMap<ConnectionId, u32> {
        let shards = self.shared.shards_snapshot();
        let Some(shard) = shards.get(shard.index()) else {
            return HashMap::new();
        };
        let max_latency_us = cc
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()).as_micros() as u64);
        shard.weighted_servers(with_primary, max_latency_us)
    }

    /// Read-only snapshot of the tracked shards, for statistics.
    pub fn master_shards(&self) -> Arc<Vec<Arc<Shard>>> {
        self.shared.shards_snapshot()
    }

    /// Waits until every tracked shard satisfies `mode`, or the deadline
    /// passes. Returns whether the condition held in time.
    pub async fn wait_connected_once(&self, mode: WaitMode, deadline: Instant) -> bool {
        let gates = self.shared.gates_snapshot();
        for gate in gates.iter() {
            if !gate.wait_until(deadline, mode).await {
                return false;
            }
        }
        true
    }

    /// Debug helper: polls until every shard has a ready primary and
    /// either a ready replica or, with `allow_empty_replicas`, no
    /// replicas configured at all.
    pub async fn wait_connected_debug(&self, allow_empty_replicas: bool) {
        loop {
            let shards = self.shared.shards_snapshot();
            let gates = self.shared.gates_snapshot();
            let ready = !shards.is_empty()
                && shards.iter().zip(gates.iter()).all(|(shard, gate)| {
                    let bits = gate.bits();
                    bits.primary
                        && (bits.replica
                            || (allow_empty_replicas && shard.configured(Role::Replica) == 0))
                });
            if ready {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Asks the loop to poll topology now instead of on the next timer.
    pub fn force_update_hosts(&self) {
        let _ = self.shared.tx.send(LoopEvent::ForceRefresh);
    }

    /// Assembles the current statistics report.
    pub fn statistics(&self) -> SentinelStatistics {
        SentinelStatistics {
            engine: counters_snapshot(&self.shared.counters),
            shards: self
                .shared
                .shards_snapshot()
                .iter()
                .map(|s| s.statistics())
                .collect(),
            sentinel: self.shared.sentinel_snapshot().map(|s| s.statistics()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.shared.state()
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("state", &self.shared.state().as_str())
            .field("shards", &self.shards_count())
            .finish_non_exhaustive()
    }
}
