//! Engine configuration.

use std::sync::Arc;
use std::time::Duration;

use rudder_routing::KeyShard;
use tokio::time::Instant;

use crate::types::Endpoint;

/// How the engine learns topology.
#[derive(Clone)]
pub enum DiscoveryMode {
    /// Ask sentinels which instance is primary for each named shard.
    /// Seeds are sentinel addresses; the shard list is fixed up front.
    Sentinel { shards: Vec<String> },

    /// Ask the cluster itself with `CLUSTER SLOTS`. Seeds are data
    /// nodes; the shard list follows the discovered slot ranges.
    Cluster,
}

impl std::fmt::Debug for DiscoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryMode::Sentinel { shards } => {
                f.debug_struct("Sentinel").field("shards", shards).finish()
            }
            DiscoveryMode::Cluster => write!(f, "Cluster"),
        }
    }
}

/// Per-command budgets and deadline.
#[derive(Debug, Clone, Copy)]
pub struct CommandControl {
    /// Hard completion deadline. Checked before dispatch and before
    /// every retry; an expired command completes with `Timeout`.
    pub deadline: Option<Instant>,

    /// How many times a connection-level failure may be retried on
    /// another instance before surfacing.
    pub retry_budget: u32,

    /// How many `MOVED`/`ASK` bounces to follow before giving up.
    pub redirect_limit: u32,
}

impl Default for CommandControl {
    fn default() -> Self {
        Self {
            deadline: None,
            retry_budget: 2,
            redirect_limit: 3,
        }
    }
}

impl CommandControl {
    /// Returns `true` once the deadline has passed.
    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// Engine-wide configuration.
#[derive(Clone)]
pub struct EngineConfig {
    pub mode: DiscoveryMode,

    /// Initial contact points: sentinels in sentinel mode, data nodes
    /// in cluster mode.
    pub seeds: Vec<Endpoint>,

    /// Period of the topology check timer.
    pub check_interval: Duration,

    /// Upper bound on one `CLUSTER SLOTS` issuance.
    pub cluster_slots_timeout: Duration,

    /// Upper bound on one sentinel discovery query.
    pub sentinel_timeout: Duration,

    /// Grace period `stop()` grants in-flight replies.
    pub stop_grace: Duration,

    /// Longest sample key the key generator will search for.
    pub key_gen_max_len: usize,

    /// Optional user key placement policy; overrides slot hashing.
    pub key_shard: Option<Arc<dyn KeyShard>>,

    /// Budgets applied to commands that do not carry their own.
    pub default_control: CommandControl,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Cluster,
            seeds: Vec::new(),
            check_interval: Duration::from_secs(3),
            cluster_slots_timeout: Duration::from_millis(4000),
            sentinel_timeout: Duration::from_secs(1),
            stop_grace: Duration::from_secs(1),
            key_gen_max_len: 4,
            key_shard: None,
            default_control: CommandControl::default(),
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("mode", &self.mode)
            .field("seeds", &self.seeds)
            .field("check_interval", &self.check_interval)
            .field("cluster_slots_timeout", &self.cluster_slots_timeout)
            .field("key_shard", &self.key_shard.as_ref().map(|_| "custom"))
            .finish_non_exhaustive()
    }
}
