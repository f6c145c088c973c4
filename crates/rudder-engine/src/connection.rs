//! The Connection collaborator seam.
//!
//! The engine does not speak RESP itself. It hands token vectors to a
//! [`Connection`] and gets typed [`Reply`] values back on a oneshot
//! channel. Connections are produced by a [`ConnectionFactory`] the
//! caller supplies; real deployments wire a socket state machine behind
//! it, tests wire scripted doubles.

use std::sync::Arc;

use bytes::Bytes;
use rudder_protocol::Reply;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::types::{ConnectionId, Endpoint};

/// Connection-level failure delivered instead of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection dropped")]
    Dropped,

    #[error("request timed out on the connection")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Outcome of a single send: a decoded reply or a connection failure.
pub type ReplyResult = Result<Reply, ConnectionError>;

/// One live wire to a server instance.
///
/// `send` must not block: implementations queue the request and complete
/// `reply_tx` when the response (or the failure) materializes. Dropping
/// `reply_tx` without completing it is read as [`ConnectionError::Dropped`].
pub trait Connection: Send + Sync + std::fmt::Debug {
    fn send(&self, tokens: Vec<Bytes>, reply_tx: oneshot::Sender<ReplyResult>);

    /// Whether the connection is established and authenticated.
    fn is_ready(&self) -> bool;

    /// Begins teardown. Idempotent.
    fn close(&self);
}

/// State change notifications a connection feeds back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConnectionEvent {
    pub id: ConnectionId,
    pub kind: ConnectionEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionEventKind {
    /// The connection finished its handshake and can take commands.
    Ready,
    /// The connection lost its peer.
    Disconnected,
}

/// Notifier handed to each new connection. The connection (or its
/// factory) calls these from any thread; delivery is an async wakeup of
/// the engine's event loop.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionEvents {
    pub(crate) fn new(id: ConnectionId, tx: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self { id, tx }
    }

    /// Signals that the connection is established and usable.
    pub fn ready(&self) {
        let _ = self.tx.send(ConnectionEvent {
            id: self.id,
            kind: ConnectionEventKind::Ready,
        });
    }

    /// Signals that the connection dropped.
    pub fn disconnected(&self) {
        let _ = self.tx.send(ConnectionEvent {
            id: self.id,
            kind: ConnectionEventKind::Disconnected,
        });
    }

    /// The id of the connection this notifier belongs to.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Produces connections for discovered endpoints.
pub trait ConnectionFactory: Send + Sync {
    /// Opens a connection towards `endpoint`. The implementation keeps
    /// `events` and fires `ready` once the handshake completes and
    /// `disconnected` on every loss, including losses after reconnect
    /// attempts it chooses to make internally.
    fn connect(&self, endpoint: &Endpoint, events: ConnectionEvents) -> Arc<dyn Connection>;
}
