//! rudder-engine: client-side routing and failover for sharded
//! Redis-family datastores.
//!
//! The engine keeps an up-to-date view of which backend instances serve
//! which shard in which role, and dispatches each submitted command to a
//! live connection — queueing ahead of readiness, following `MOVED`/`ASK`
//! redirects, and retrying connection failures on other instances.
//!
//! # Architecture
//!
//! A single tokio task (the engine loop) owns all mutable topology
//! state: the shard set, the slot map and host index producer sides, the
//! readiness gates and the pending queue. Callers interact through a
//! cloneable [`RoutingEngine`] handle:
//!
//! - [`RoutingEngine::submit`] hands a command over the loop's inbox,
//! - lookups ([`RoutingEngine::shard_by_key`], statistics) read
//!   immutable snapshots the loop publishes,
//! - [`RoutingEngine::wait_connected_once`] waits on per-shard gates.
//!
//! Wire I/O stays behind the [`Connection`] / [`ConnectionFactory`]
//! seam: the engine hands token vectors to connections and receives
//! typed [`Reply`] values back, so any socket implementation (or a test
//! double) plugs in.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rudder_engine::{
//!     Command, DiscoveryMode, Endpoint, EngineConfig, Hint, RoleRequirement, RoutingEngine,
//! };
//!
//! let config = EngineConfig {
//!     mode: DiscoveryMode::Cluster,
//!     seeds: vec![Endpoint::new("10.0.0.1", 6379)],
//!     ..EngineConfig::default()
//! };
//! let engine = RoutingEngine::new(config, Arc::new(MyFactory));
//! engine.init()?;
//! engine.start()?;
//!
//! let reply = engine
//!     .submit(Command::new(["GET", "user:42"]), Hint::by_key("user:42", RoleRequirement::Any))
//!     .await;
//! ```

mod command;
mod config;
mod connection;
mod controller;
mod error;
mod pending;
mod poller;
mod readiness;
mod router;
mod shard;
mod shard_set;
mod stats;
mod types;

pub use command::{Command, CommandOutcome, Hint, Target};
pub use config::{CommandControl, DiscoveryMode, EngineConfig};
pub use connection::{
    Connection, ConnectionError, ConnectionEvents, ConnectionFactory, ReplyResult,
};
pub use controller::{EngineState, RoutingEngine};
pub use error::{CommandError, InitError, TopologyError};
pub use readiness::{GateBits, ReadinessGate, WaitMode};
pub use shard::Shard;
pub use stats::{
    EngineCounterSnapshot, InstanceStatistics, InstanceStats, SentinelStatistics, ShardStatistics,
};
pub use types::{ConnectionId, Endpoint, Role, RoleRequirement, ShardId};

pub use rudder_protocol::Reply;
pub use rudder_routing::{key_slot, KeyShard, SLOT_COUNT};
