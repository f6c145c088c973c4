//! Command submission types.

use bytes::Bytes;
use rudder_protocol::Reply;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::CommandControl;
use crate::error::CommandError;
use crate::types::{Endpoint, RoleRequirement, ShardId};

/// Final outcome delivered for a submitted command. Server error replies
/// that are not redirects arrive as `Ok(Reply::Error(..))`; the `Err`
/// side is reserved for failures the engine itself produced.
pub type CommandOutcome = Result<Reply, CommandError>;

/// A command ready for submission: its wire tokens plus budgets.
///
/// A command without explicit budgets inherits the engine's
/// `default_control` at submission time.
#[derive(Debug, Clone)]
pub struct Command {
    pub tokens: Vec<Bytes>,
    pub control: Option<CommandControl>,
}

impl Command {
    /// Builds a command from token-like values, inheriting the engine's
    /// default budgets.
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            control: None,
        }
    }

    /// Sets explicit budgets, overriding the engine's defaults.
    pub fn with_control(mut self, control: CommandControl) -> Self {
        self.control = Some(control);
        self
    }
}

/// Where a command wants to go.
#[derive(Debug, Clone)]
pub enum Target {
    /// Route by key: user policy if installed, slot hashing otherwise.
    ByKey(Bytes),
    /// Route to an explicit shard index.
    ByShard(ShardId),
    /// Route to the sentinel pool.
    Sentinel,
}

/// Routing hint: a target plus the role the command requires.
#[derive(Debug, Clone)]
pub struct Hint {
    pub target: Target,
    pub role: RoleRequirement,
}

impl Hint {
    pub fn by_key(key: impl Into<Bytes>, role: RoleRequirement) -> Self {
        Self {
            target: Target::ByKey(key.into()),
            role,
        }
    }

    pub fn by_shard(shard: ShardId, role: RoleRequirement) -> Self {
        Self {
            target: Target::ByShard(shard),
            role,
        }
    }

    /// Sentinel commands run on whichever sentinel connection is up.
    pub fn sentinel() -> Self {
        Self {
            target: Target::Sentinel,
            role: RoleRequirement::Any,
        }
    }
}

/// A command in flight through the engine, with its retry bookkeeping.
pub(crate) struct CommandTask {
    pub tokens: Vec<Bytes>,
    pub control: CommandControl,
    pub role: RoleRequirement,
    pub target: Target,
    pub reply_tx: oneshot::Sender<CommandOutcome>,
    pub submitted_at: Instant,
    /// Connection-error retries consumed.
    pub attempts: u32,
    /// MOVED/ASK bounces followed.
    pub redirects: u32,
    /// Pool index of the instance that just failed, skipped on retry.
    pub prev_instance: Option<usize>,
    /// One-shot ASK override; cleared at the next dispatch.
    pub ask_target: Option<Endpoint>,
}

impl CommandTask {
    pub fn new(
        command: Command,
        hint: Hint,
        default_control: CommandControl,
        reply_tx: oneshot::Sender<CommandOutcome>,
        now: Instant,
    ) -> Self {
        Self {
            tokens: command.tokens,
            control: command.control.unwrap_or(default_control),
            role: hint.role,
            target: hint.target,
            reply_tx,
            submitted_at: now,
            attempts: 0,
            redirects: 0,
            prev_instance: None,
            ask_target: None,
        }
    }

    /// Delivers the outcome. A caller that dropped its receiver simply
    /// stops caring; that is not an engine error.
    pub fn complete(self, outcome: CommandOutcome) {
        let _ = self.reply_tx.send(outcome);
    }
}
