//! Engine and per-instance statistics.
//!
//! Counters are plain atomics bumped on the hot path; `statistics()`
//! assembles a serializable snapshot out of them on demand. Latency is
//! tracked as an exponentially weighted moving average in microseconds
//! (alpha 1/8), cheap enough to update per reply and smooth enough to
//! drive the weighted server selection.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::types::{ConnectionId, Endpoint, Role};

/// Live counters for one instance connection.
#[derive(Debug, Default)]
pub struct InstanceStats {
    requests: AtomicU64,
    errors: AtomicU64,
    recent_errors: AtomicU32,
    latency_ewma_us: AtomicU64,
    in_flight: AtomicU32,
}

impl InstanceStats {
    pub fn on_dispatch(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_success(&self, latency_us: u64) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        // ewma <- 7/8 ewma + 1/8 sample; first sample seeds directly
        let prev = self.latency_ewma_us.load(Ordering::Relaxed);
        let next = if prev == 0 {
            latency_us
        } else {
            prev - prev / 8 + latency_us / 8
        };
        self.latency_ewma_us.store(next, Ordering::Relaxed);
        // each success halves the recent-error pressure so weights heal
        let recent = self.recent_errors.load(Ordering::Relaxed);
        if recent > 0 {
            self.recent_errors.store(recent / 2, Ordering::Relaxed);
        }
    }

    pub fn on_error(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.recent_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recent_errors(&self) -> u32 {
        self.recent_errors.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn latency_ewma_us(&self) -> u64 {
        self.latency_ewma_us.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Engine-wide counters.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub submitted: AtomicU64,
    pub completed_ok: AtomicU64,
    pub completed_err: AtomicU64,
    pub redirects_moved: AtomicU64,
    pub redirects_ask: AtomicU64,
    pub retries: AtomicU64,
    pub timeouts: AtomicU64,
    pub topology_refreshes: AtomicU64,
}

impl EngineCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineCounterSnapshot {
        EngineCounterSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed_ok: self.completed_ok.load(Ordering::Relaxed),
            completed_err: self.completed_err.load(Ordering::Relaxed),
            redirects_moved: self.redirects_moved.load(Ordering::Relaxed),
            redirects_ask: self.redirects_ask.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            topology_refreshes: self.topology_refreshes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the engine counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct EngineCounterSnapshot {
    pub submitted: u64,
    pub completed_ok: u64,
    pub completed_err: u64,
    pub redirects_moved: u64,
    pub redirects_ask: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub topology_refreshes: u64,
}

/// Point-in-time view of one instance.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstanceStatistics {
    pub id: ConnectionId,
    pub endpoint: Endpoint,
    pub role: Role,
    pub state: &'static str,
    pub requests: u64,
    pub errors: u64,
    pub latency_ewma_us: u64,
}

/// Point-in-time view of one shard pool.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ShardStatistics {
    pub name: String,
    pub instances: Vec<InstanceStatistics>,
}

/// Full statistics report returned by the public API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SentinelStatistics {
    pub engine: EngineCounterSnapshot,
    pub shards: Vec<ShardStatistics>,
    pub sentinel: Option<ShardStatistics>,
}

pub(crate) fn counters_snapshot(counters: &EngineCounters) -> EngineCounterSnapshot {
    counters.snapshot()
}
