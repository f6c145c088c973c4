//! Scripted connection doubles for engine tests.
//!
//! A [`MockFactory`] answers every `connect` with a [`MockConnection`]
//! whose replies come from one shared script closure. Connections report
//! readiness either immediately (`auto_ready`) or when the test calls
//! [`MockConnection::go_ready`], and can park replies to simulate
//! in-flight commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rudder_engine::{
    Connection, ConnectionError, ConnectionEvents, ConnectionFactory, Endpoint, Reply,
    ReplyResult,
};
use tokio::sync::oneshot;

/// What the script wants done with one request.
pub enum MockReply {
    /// Complete immediately with this result.
    Now(ReplyResult),
    /// Hold the reply until the test releases it.
    Park,
}

pub type Script = Arc<dyn Fn(&Endpoint, &[String]) -> MockReply + Send + Sync>;

pub struct MockConnection {
    pub endpoint: Endpoint,
    events: ConnectionEvents,
    script: Script,
    ready: AtomicBool,
    closed: AtomicBool,
    /// Every command this connection received, as joined token strings.
    pub sent: Mutex<Vec<String>>,
    parked: Mutex<Vec<oneshot::Sender<ReplyResult>>>,
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl MockConnection {
    /// Reports the handshake as complete.
    pub fn go_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.events.ready();
    }

    /// Simulates a peer loss.
    pub fn drop_link(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.events.disconnected();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Commands received so far, e.g. `["GET foo", "CLUSTER SLOTS"]`.
    pub fn sent_commands(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Completes every parked reply with the given result.
    pub fn release_parked(&self, result: ReplyResult) {
        for tx in self.parked.lock().unwrap().drain(..) {
            let _ = tx.send(result.clone());
        }
    }

    pub fn parked_count(&self) -> usize {
        self.parked.lock().unwrap().len()
    }
}

impl Connection for MockConnection {
    fn send(&self, tokens: Vec<Bytes>, reply_tx: oneshot::Sender<ReplyResult>) {
        let words: Vec<String> = tokens
            .iter()
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .collect();
        self.sent.lock().unwrap().push(words.join(" "));

        match (self.script)(&self.endpoint, &words) {
            MockReply::Now(result) => {
                let _ = reply_tx.send(result);
            }
            MockReply::Park => self.parked.lock().unwrap().push(reply_tx),
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }
}

pub struct MockFactory {
    script: Script,
    auto_ready: bool,
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockFactory {
    pub fn new(auto_ready: bool, script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            auto_ready,
            connections: Mutex::new(Vec::new()),
        })
    }

    /// The most recent connection opened towards `host:port`.
    pub fn conn_for(&self, host: &str, port: u16) -> Option<Arc<MockConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.endpoint.host == host && c.endpoint.port == port)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

impl ConnectionFactory for MockFactory {
    fn connect(&self, endpoint: &Endpoint, events: ConnectionEvents) -> Arc<dyn Connection> {
        let conn = Arc::new(MockConnection {
            endpoint: endpoint.clone(),
            events,
            script: Arc::clone(&self.script),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            parked: Mutex::new(Vec::new()),
        });
        if self.auto_ready {
            conn.go_ready();
        }
        self.connections.lock().unwrap().push(conn.clone());
        conn
    }
}

// -- reply builders --

pub fn bulk(s: &str) -> Reply {
    Reply::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

pub fn ok_bulk(s: &str) -> MockReply {
    MockReply::Now(Ok(bulk(s)))
}

pub fn server_error(msg: &str) -> MockReply {
    MockReply::Now(Ok(Reply::Error(msg.to_string())))
}

pub fn dropped() -> MockReply {
    MockReply::Now(Err(ConnectionError::Dropped))
}

fn node(host: &str, port: u16) -> Reply {
    Reply::Array(vec![bulk(host), Reply::Integer(port as i64)])
}

/// Builds a `CLUSTER SLOTS` reply out of
/// `(start, end, primary_host, replica_hosts)` entries, all on port 6379.
pub fn cluster_slots(entries: &[(u16, u16, &str, &[&str])]) -> Reply {
    Reply::Array(
        entries
            .iter()
            .map(|(start, end, primary, replicas)| {
                let mut items = vec![
                    Reply::Integer(*start as i64),
                    Reply::Integer(*end as i64),
                    node(primary, 6379),
                ];
                items.extend(replicas.iter().map(|r| node(r, 6379)));
                Reply::Array(items)
            })
            .collect(),
    )
}

/// Builds a `SENTINEL MASTERS` reply for `(name, host, port)` rows.
pub fn sentinel_masters(rows: &[(&str, &str, u16)]) -> Reply {
    Reply::Array(
        rows.iter()
            .map(|(name, host, port)| {
                Reply::Array(vec![
                    bulk("name"),
                    bulk(name),
                    bulk("ip"),
                    bulk(host),
                    bulk("port"),
                    bulk(&port.to_string()),
                    bulk("flags"),
                    bulk("master"),
                ])
            })
            .collect(),
    )
}

/// Builds a `SENTINEL SLAVES` reply for `(host, port)` rows.
pub fn sentinel_replicas(rows: &[(&str, u16)]) -> Reply {
    Reply::Array(
        rows.iter()
            .map(|(host, port)| {
                Reply::Array(vec![
                    bulk("name"),
                    bulk(&format!("{host}:{port}")),
                    bulk("ip"),
                    bulk(host),
                    bulk("port"),
                    bulk(&port.to_string()),
                    bulk("flags"),
                    bulk("slave"),
                    bulk("master-link-status"),
                    bulk("ok"),
                ])
            })
            .collect(),
    )
}

/// Polls `condition` until it holds or ~2 seconds elapse.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}
