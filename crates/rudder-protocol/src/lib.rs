//! rudder-protocol: typed replies and topology reply interpretation.
//!
//! The wire-level RESP codec lives behind the Connection collaborator;
//! this crate works one level above it. It defines the [`Reply`] values a
//! connection delivers after parsing, and it knows how to *interpret* the
//! replies that carry topology information:
//!
//! - `MOVED` / `ASK` redirect error strings ([`Redirect`])
//! - `CLUSTER SLOTS` arrays ([`parse_cluster_slots`])
//! - `SENTINEL MASTERS` / `SENTINEL SLAVES` field maps
//!   ([`parse_sentinel_servers`])
//!
//! It also builds the token vectors for the discovery commands, so the
//! topology poller and its tests agree on the exact bytes sent.

mod discovery;
mod redirect;
mod types;

pub use discovery::{
    cluster_slots_command, parse_cluster_slots, parse_sentinel_servers, sentinel_masters_command,
    sentinel_replicas_command, DiscoveredEndpoint, DiscoveryParseError, SentinelServer,
    ServerFlags, SlotRangeNodes,
};
pub use redirect::{Redirect, RedirectKind};
pub use types::Reply;
