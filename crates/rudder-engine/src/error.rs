//! Error taxonomy.
//!
//! Three families with different recovery rules:
//!
//! - [`CommandError`] reaches the caller as the command's outcome.
//!   Redirections and connection-level failures are recovered internally
//!   first; what surfaces here is only what survived the budgets.
//! - [`TopologyError`] never fails a command. Discovery problems are
//!   logged, the previous topology is retained, the next poll retries.
//! - [`InitError`] aborts startup and can only come out of `init()`.

use thiserror::Error;

use crate::types::ShardId;

/// Terminal outcome of a command that did not produce a server reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The requested shard index does not exist.
    #[error("unknown shard {0}")]
    UnknownShard(ShardId),

    /// The target shard had no usable connection and the command could
    /// not wait any longer.
    #[error("no ready connection for the requested role")]
    NoReadyConnection,

    /// The engine is stopping or stopped.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// The command's deadline elapsed before a reply arrived.
    #[error("command deadline exceeded")]
    Timeout,

    /// The connection dropped and the retry budget is spent.
    #[error("connection dropped")]
    Disconnected,

    /// The connection reported a protocol-level failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Redirections kept bouncing past the redirect limit.
    #[error("redirect limit exceeded, last target {0}")]
    RedirectLimit(String),
}

/// Discovery failures, logged and tolerated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("no sentinel answered the discovery query")]
    SentinelUnreachable,

    #[error("no shard had a live primary to serve a slots query")]
    NoSlotsSource,

    #[error("discovery connection failed: {0}")]
    SourceFailed(String),

    #[error("discovery reply rejected: {0}")]
    ParseFailed(String),

    #[error("snapshot rejected: {0}")]
    InconsistentSnapshot(String),

    #[error("discovery query timed out")]
    QueryTimeout,
}

/// Startup failures out of `init()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("at least one seed endpoint is required")]
    NoSeeds,

    #[error("sentinel mode requires at least one tracked shard name")]
    NoTrackedShards,

    #[error("init() may only be called once, current state is {0}")]
    AlreadyInitialized(&'static str),

    #[error("start() requires init() first, current state is {0}")]
    NotInitialized(&'static str),
}
