//! Topology discovery.
//!
//! The engine loop owns a [`PollerState`] and decides *when* to poll;
//! the actual querying happens in spawned tasks built from the async
//! fetch functions here, so a slow or dead discovery source never stalls
//! dispatch. At most one fetch per source is in flight at a time.
//!
//! Two sources:
//!
//! - **Sentinel**: every live sentinel connection is asked for the
//!   masters and for the replicas of each tracked shard. Conflicting
//!   answers are merged by majority, ties broken by the most recent
//!   response.
//! - **Cluster**: one `CLUSTER SLOTS` query against a live primary,
//!   rotating through shards so a single unresponsive shard cannot
//!   starve discovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rudder_protocol::{
    cluster_slots_command, parse_cluster_slots, parse_sentinel_servers, sentinel_masters_command,
    sentinel_replicas_command, Reply, SentinelServer,
};
use rudder_routing::{ShardId, SlotInterval};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionError};
use crate::error::TopologyError;
use crate::types::Endpoint;

/// Which discovery source produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SnapshotSource {
    Sentinel,
    Cluster,
}

/// Desired endpoint set for one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShardTopology {
    pub name: String,
    pub primaries: Vec<Endpoint>,
    pub replicas: Vec<Endpoint>,
}

/// One coherent discovery result, consumed once by the engine loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TopologySnapshot {
    pub source: SnapshotSource,
    pub shards: Vec<ShardTopology>,
    /// Slot ranges, cluster mode only. Indices refer into `shards`.
    pub slots: Option<Vec<SlotInterval>>,
}

/// Loop-owned poller bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct PollerState {
    pub sentinel_in_flight: bool,
    pub cluster_in_flight: bool,
    /// Round-robin position for picking the `CLUSTER SLOTS` target.
    pub current_slots_shard: usize,
}

impl PollerState {
    pub fn in_flight(&self, source: SnapshotSource) -> bool {
        match source {
            SnapshotSource::Sentinel => self.sentinel_in_flight,
            SnapshotSource::Cluster => self.cluster_in_flight,
        }
    }

    pub fn set_in_flight(&mut self, source: SnapshotSource, value: bool) {
        match source {
            SnapshotSource::Sentinel => self.sentinel_in_flight = value,
            SnapshotSource::Cluster => self.cluster_in_flight = value,
        }
    }
}

/// Sends one command and waits for its reply under a timeout.
async fn query(
    conn: &Arc<dyn Connection>,
    tokens: Vec<Bytes>,
    timeout: Duration,
) -> Result<Reply, TopologyError> {
    let (tx, rx) = oneshot::channel();
    conn.send(tokens, tx);
    match tokio::time::timeout(timeout, rx).await {
        Err(_) => Err(TopologyError::QueryTimeout),
        Ok(Err(_)) => Err(TopologyError::SourceFailed("reply channel dropped".into())),
        Ok(Ok(Err(e))) => Err(match e {
            ConnectionError::Timeout => TopologyError::QueryTimeout,
            other => TopologyError::SourceFailed(other.to_string()),
        }),
        Ok(Ok(Ok(Reply::Error(e)))) => Err(TopologyError::ParseFailed(e)),
        Ok(Ok(Ok(reply))) => Ok(reply),
    }
}

/// Fetches a cluster snapshot through one live primary connection.
///
/// Slot ranges sharing a primary endpoint collapse into one shard; shard
/// order follows the first appearance in slot order, which keeps shard
/// ids stable as long as the layout is stable.
pub(crate) async fn fetch_cluster_snapshot(
    conn: Arc<dyn Connection>,
    timeout: Duration,
) -> Result<TopologySnapshot, TopologyError> {
    let reply = query(&conn, cluster_slots_command(), timeout).await?;
    let mut ranges =
        parse_cluster_slots(&reply).map_err(|e| TopologyError::ParseFailed(e.to_string()))?;
    if ranges.is_empty() {
        return Err(TopologyError::InconsistentSnapshot(
            "cluster reported zero slot ranges".into(),
        ));
    }
    ranges.sort_by_key(|r| r.start);

    let mut shards: Vec<ShardTopology> = Vec::new();
    let mut by_primary: HashMap<Endpoint, usize> = HashMap::new();
    let mut slots = Vec::with_capacity(ranges.len());

    for range in &ranges {
        let primary = Endpoint::new(range.primary.host.clone(), range.primary.port);
        let idx = *by_primary.entry(primary.clone()).or_insert_with(|| {
            shards.push(ShardTopology {
                name: primary.to_string(),
                primaries: vec![primary.clone()],
                replicas: Vec::new(),
            });
            shards.len() - 1
        });

        for replica in &range.replicas {
            let ep = Endpoint::new(replica.host.clone(), replica.port);
            if !shards[idx].replicas.contains(&ep) {
                shards[idx].replicas.push(ep);
            }
        }

        slots.push(SlotInterval::new(
            range.start,
            range.end,
            ShardId(idx as u16),
        ));
    }

    debug!(
        "cluster discovery: {} shards over {} ranges",
        shards.len(),
        slots.len()
    );

    Ok(TopologySnapshot {
        source: SnapshotSource::Cluster,
        shards,
        slots: Some(slots),
    })
}

/// What one sentinel said about one tracked shard.
struct SentinelReport {
    primary: Endpoint,
    replicas: Vec<Endpoint>,
    at: Instant,
}

/// Fetches a sentinel snapshot by querying every live sentinel.
///
/// Shards in the result align by index with `shard_names`. A shard no
/// usable sentinel answered for comes back with empty `primaries`; the
/// engine loop rejects such snapshots instead of tearing topology down.
pub(crate) async fn fetch_sentinel_snapshot(
    sentinels: Vec<Arc<dyn Connection>>,
    shard_names: Vec<String>,
    timeout: Duration,
) -> Result<TopologySnapshot, TopologyError> {
    if sentinels.is_empty() {
        return Err(TopologyError::SentinelUnreachable);
    }

    // per tracked shard, every sentinel's answer
    let mut reports: Vec<Vec<SentinelReport>> = (0..shard_names.len()).map(|_| Vec::new()).collect();
    let mut answered = 0usize;

    for sentinel in &sentinels {
        let masters = match query(sentinel, sentinel_masters_command(), timeout).await {
            Ok(reply) => match parse_sentinel_servers(&reply) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("sentinel masters reply rejected: {e}");
                    continue;
                }
            },
            Err(e) => {
                debug!("sentinel masters query failed: {e}");
                continue;
            }
        };
        answered += 1;
        let at = Instant::now();

        for (idx, name) in shard_names.iter().enumerate() {
            let Some(master) = masters
                .iter()
                .find(|m| m.name == *name && m.flags.is_usable())
            else {
                continue;
            };

            let replicas = match query(sentinel, sentinel_replicas_command(name), timeout).await {
                Ok(reply) => match parse_sentinel_servers(&reply) {
                    Ok(rows) => usable_endpoints(&rows),
                    Err(e) => {
                        warn!("sentinel replicas reply for {name} rejected: {e}");
                        Vec::new()
                    }
                },
                Err(e) => {
                    debug!("sentinel replicas query for {name} failed: {e}");
                    Vec::new()
                }
            };

            reports[idx].push(SentinelReport {
                primary: Endpoint::new(master.host.clone(), master.port),
                replicas,
                at,
            });
        }
    }

    if answered == 0 {
        return Err(TopologyError::SentinelUnreachable);
    }

    let shards = shard_names
        .iter()
        .zip(reports)
        .map(|(name, reports)| merge_reports(name, reports))
        .collect();

    Ok(TopologySnapshot {
        source: SnapshotSource::Sentinel,
        shards,
        slots: None,
    })
}

fn usable_endpoints(rows: &[SentinelServer]) -> Vec<Endpoint> {
    let mut endpoints: Vec<Endpoint> = Vec::with_capacity(rows.len());
    for row in rows.iter().filter(|r| r.flags.is_usable()) {
        let ep = Endpoint::new(row.host.clone(), row.port);
        if !endpoints.contains(&ep) {
            endpoints.push(ep);
        }
    }
    endpoints
}

/// Majority-merges the answers for one shard. The primary with the most
/// votes wins, ties go to the most recently seen answer; the replica
/// list comes from the freshest report that agrees on that primary.
fn merge_reports(name: &str, reports: Vec<SentinelReport>) -> ShardTopology {
    let mut votes: HashMap<&Endpoint, (usize, Instant)> = HashMap::new();
    for report in &reports {
        let entry = votes.entry(&report.primary).or_insert((0, report.at));
        entry.0 += 1;
        entry.1 = entry.1.max(report.at);
    }

    let Some((winner, _)) = votes
        .iter()
        .max_by_key(|(_, (count, at))| (*count, *at))
        .map(|(ep, v)| ((*ep).clone(), *v))
    else {
        return ShardTopology {
            name: name.to_string(),
            primaries: Vec::new(),
            replicas: Vec::new(),
        };
    };

    let replicas = reports
        .iter()
        .filter(|r| r.primary == winner)
        .max_by_key(|r| r.at)
        .map(|r| r.replicas.clone())
        .unwrap_or_default();

    ShardTopology {
        name: name.to_string(),
        primaries: vec![winner],
        replicas,
    }
}
