//! Per-shard readiness gates.
//!
//! A shard is usable for a role once at least one connection of that
//! role is live. The two bits live behind a `tokio::sync::watch`
//! channel: the engine loop flips them, any number of callers wait on
//! them with a deadline. `watch::Receiver::wait_for` rechecks the
//! predicate on every change notification, which absorbs spurious
//! wakeups by construction.

use tokio::sync::watch;
use tokio::time::Instant;

/// What a waiter requires of a shard before proceeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    PrimaryOnly,
    ReplicaOnly,
    PrimaryOrReplica,
    PrimaryAndReplica,
    /// Do not wait; report the current state.
    NoWait,
}

/// The two readiness bits of one shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateBits {
    pub primary: bool,
    pub replica: bool,
}

impl GateBits {
    /// Whether these bits satisfy a wait mode. `NoWait` is always
    /// satisfied: the caller asked not to be held up.
    pub fn satisfies(self, mode: WaitMode) -> bool {
        match mode {
            WaitMode::PrimaryOnly => self.primary,
            WaitMode::ReplicaOnly => self.replica,
            WaitMode::PrimaryOrReplica => self.primary || self.replica,
            WaitMode::PrimaryAndReplica => self.primary && self.replica,
            WaitMode::NoWait => true,
        }
    }
}

/// Readiness gate for one shard.
#[derive(Debug)]
pub struct ReadinessGate {
    bits: watch::Sender<GateBits>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (bits, _) = watch::channel(GateBits::default());
        Self { bits }
    }

    /// Current bits.
    pub fn bits(&self) -> GateBits {
        *self.bits.borrow()
    }

    /// Sets the primary bit; waiters are woken only on actual change.
    pub fn set_primary_ready(&self, ready: bool) {
        self.bits.send_if_modified(|b| {
            let changed = b.primary != ready;
            b.primary = ready;
            changed
        });
    }

    /// Sets the replica bit; waiters are woken only on actual change.
    pub fn set_replica_ready(&self, ready: bool) {
        self.bits.send_if_modified(|b| {
            let changed = b.replica != ready;
            b.replica = ready;
            changed
        });
    }

    /// Waits until the bits satisfy `mode` or the deadline passes.
    /// Returns whether the predicate held in time.
    pub async fn wait_until(&self, deadline: Instant, mode: WaitMode) -> bool {
        if self.bits().satisfies(mode) {
            return true;
        }
        if matches!(mode, WaitMode::NoWait) {
            return true;
        }

        let mut rx = self.bits.subscribe();
        tokio::time::timeout_at(deadline, rx.wait_for(|b| b.satisfies(mode)))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }
}
