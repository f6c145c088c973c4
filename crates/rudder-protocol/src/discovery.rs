//! Discovery command builders and reply interpreters.
//!
//! Two discovery mechanisms feed the topology poller:
//!
//! - `CLUSTER SLOTS` — an array of `[start, end, primary, replica...]`
//!   entries where each node is `[ip, port, ...]`.
//! - `SENTINEL MASTERS` / `SENTINEL SLAVES <name>` — arrays of field/value
//!   string pairs, one map per reported instance.
//!
//! The interpreters here turn those shapes into plain records and reject
//! anything structurally off with a [`DiscoveryParseError`]. A reply that
//! fails to parse never clears topology; the poller logs and retries.

use bytes::Bytes;
use thiserror::Error;

use crate::types::Reply;

/// A host/port pair as reported by discovery, before it is resolved
/// against the engine's own endpoint bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for DiscoveredEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One `CLUSTER SLOTS` entry: a slot range and the nodes serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRangeNodes {
    pub start: u16,
    pub end: u16,
    pub primary: DiscoveredEndpoint,
    pub replicas: Vec<DiscoveredEndpoint>,
}

/// Health flags reported for a sentinel-discovered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerFlags {
    /// Instance is a master.
    pub master: bool,
    /// Subjectively down (this sentinel lost contact).
    pub s_down: bool,
    /// Objectively down (quorum agrees it is gone).
    pub o_down: bool,
    /// Replica link to its master is broken.
    pub master_link_down: bool,
}

impl ServerFlags {
    /// Returns `true` if the instance is usable for routing.
    pub fn is_usable(&self) -> bool {
        !self.s_down && !self.o_down && !self.master_link_down
    }
}

/// One instance row out of `SENTINEL MASTERS` or `SENTINEL SLAVES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelServer {
    /// Shard name for masters; `ip:port` for replicas.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub flags: ServerFlags,
}

/// Errors produced while interpreting a discovery reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryParseError {
    #[error("expected an array reply, got {0}")]
    NotAnArray(&'static str),

    #[error("malformed slot range entry: {0}")]
    BadSlotEntry(String),

    #[error("malformed node entry: {0}")]
    BadNode(String),

    #[error("malformed instance field map: {0}")]
    BadFieldMap(String),
}

fn tokens(parts: &[&str]) -> Vec<Bytes> {
    parts
        .iter()
        .map(|p| Bytes::copy_from_slice(p.as_bytes()))
        .collect()
}

/// Token vector for `CLUSTER SLOTS`.
pub fn cluster_slots_command() -> Vec<Bytes> {
    tokens(&["CLUSTER", "SLOTS"])
}

/// Token vector for `SENTINEL MASTERS`.
pub fn sentinel_masters_command() -> Vec<Bytes> {
    tokens(&["SENTINEL", "MASTERS"])
}

/// Token vector for `SENTINEL SLAVES <name>`.
pub fn sentinel_replicas_command(shard_name: &str) -> Vec<Bytes> {
    tokens(&["SENTINEL", "SLAVES", shard_name])
}

fn variant_name(reply: &Reply) -> &'static str {
    match reply {
        Reply::Status(_) => "status",
        Reply::Error(_) => "error",
        Reply::Integer(_) => "integer",
        Reply::Bulk(_) => "bulk",
        Reply::Array(_) => "array",
        Reply::Null => "null",
    }
}

fn parse_node(reply: &Reply) -> Result<DiscoveredEndpoint, DiscoveryParseError> {
    let items = reply
        .as_array()
        .ok_or_else(|| DiscoveryParseError::BadNode(format!("node is {}", variant_name(reply))))?;

    // [ip, port, id?, metadata?] — only the first two matter here
    let host = items
        .first()
        .and_then(Reply::as_text)
        .ok_or_else(|| DiscoveryParseError::BadNode("missing host".into()))?;
    let port = items
        .get(1)
        .and_then(Reply::as_integer)
        .ok_or_else(|| DiscoveryParseError::BadNode("missing port".into()))?;
    let port = u16::try_from(port)
        .map_err(|_| DiscoveryParseError::BadNode(format!("port {port} out of range")))?;

    Ok(DiscoveredEndpoint {
        host: host.to_string(),
        port,
    })
}

/// Interprets a `CLUSTER SLOTS` reply.
///
/// Entries are validated individually: slot bounds must fit in
/// `0..=16383` with `start <= end`, and every entry needs at least a
/// primary node. Range overlap across entries is the slot map's concern,
/// not this parser's.
pub fn parse_cluster_slots(reply: &Reply) -> Result<Vec<SlotRangeNodes>, DiscoveryParseError> {
    let entries = reply
        .as_array()
        .ok_or(DiscoveryParseError::NotAnArray(variant_name(reply)))?;

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let items = entry.as_array().ok_or_else(|| {
            DiscoveryParseError::BadSlotEntry(format!("entry is {}", variant_name(entry)))
        })?;
        if items.len() < 3 {
            return Err(DiscoveryParseError::BadSlotEntry(format!(
                "entry has {} elements, need at least 3",
                items.len()
            )));
        }

        let start = items[0]
            .as_integer()
            .and_then(|n| u16::try_from(n).ok())
            .filter(|&n| n < 16384)
            .ok_or_else(|| DiscoveryParseError::BadSlotEntry("bad start slot".into()))?;
        let end = items[1]
            .as_integer()
            .and_then(|n| u16::try_from(n).ok())
            .filter(|&n| n < 16384)
            .ok_or_else(|| DiscoveryParseError::BadSlotEntry("bad end slot".into()))?;
        if start > end {
            return Err(DiscoveryParseError::BadSlotEntry(format!(
                "start {start} > end {end}"
            )));
        }

        let primary = parse_node(&items[2])?;
        let replicas = items[3..]
            .iter()
            .map(parse_node)
            .collect::<Result<Vec<_>, _>>()?;

        ranges.push(SlotRangeNodes {
            start,
            end,
            primary,
            replicas,
        });
    }

    Ok(ranges)
}

fn parse_flags(raw: &str) -> ServerFlags {
    let mut flags = ServerFlags::default();
    for flag in raw.split(',') {
        match flag {
            "master" => flags.master = true,
            "s_down" => flags.s_down = true,
            "o_down" => flags.o_down = true,
            _ => {}
        }
    }
    flags
}

/// Interprets a `SENTINEL MASTERS` or `SENTINEL SLAVES <name>` reply.
///
/// Each instance arrives as a flat field/value array. Unknown fields are
/// skipped; `name`, `ip` and `port` are required. `master-link-status`
/// other than `ok` marks the replica unusable.
pub fn parse_sentinel_servers(reply: &Reply) -> Result<Vec<SentinelServer>, DiscoveryParseError> {
    let rows = reply
        .as_array()
        .ok_or(DiscoveryParseError::NotAnArray(variant_name(reply)))?;

    let mut servers = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = row.as_array().ok_or_else(|| {
            DiscoveryParseError::BadFieldMap(format!("row is {}", variant_name(row)))
        })?;

        let mut name = None;
        let mut host = None;
        let mut port = None;
        let mut flags = ServerFlags::default();

        for pair in fields.chunks_exact(2) {
            let Some(field) = pair[0].as_text() else {
                continue;
            };
            let Some(value) = pair[1].as_text() else {
                continue;
            };
            match field {
                "name" => name = Some(value.to_string()),
                "ip" => host = Some(value.to_string()),
                "port" => {
                    port = Some(value.parse::<u16>().map_err(|_| {
                        DiscoveryParseError::BadFieldMap(format!("bad port {value:?}"))
                    })?);
                }
                "flags" => flags = parse_flags(value),
                "master-link-status" => flags.master_link_down = value != "ok",
                _ => {}
            }
        }

        let name =
            name.ok_or_else(|| DiscoveryParseError::BadFieldMap("missing name".into()))?;
        let host = host.ok_or_else(|| DiscoveryParseError::BadFieldMap("missing ip".into()))?;
        let port = port.ok_or_else(|| DiscoveryParseError::BadFieldMap("missing port".into()))?;

        servers.push(SentinelServer {
            name,
            host,
            port,
            flags,
        });
    }

    Ok(servers)
}
