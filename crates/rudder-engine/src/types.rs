//! Core identifiers and endpoint types.

use serde::{Deserialize, Serialize};

pub use rudder_routing::ShardId;

/// Reserved id for the sentinel pool, never a data shard.
pub(crate) const SENTINEL_SHARD: ShardId = ShardId(u16::MAX);

/// Dense id of a connection within the engine's arena. Ids are never
/// reused for the lifetime of an engine, so a late event from a closed
/// connection cannot be misattributed to its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A network address an instance is reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Role an instance plays within its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Replica,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

/// What a command requires of the instance that serves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleRequirement {
    /// Must run on the shard's primary (writes, read-your-writes).
    MustPrimary,
    /// Any usable instance of the shard will do.
    Any,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.1", 6379).to_string(), "10.0.0.1:6379");
        assert_eq!(
            Endpoint::new("2001:db8::1", 6380).to_string(),
            "[2001:db8::1]:6380"
        );
    }

    #[test]
    fn id_display() {
        assert_eq!(ConnectionId(3).to_string(), "conn-3");
        assert_eq!(ShardId(1).to_string(), "shard-1");
    }
}
