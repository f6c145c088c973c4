//! Dispatch decisions and reply policy.
//!
//! Every command flows through [`EngineCore::dispatch`]:
//!
//! 1. deadline and shutdown checks,
//! 2. target resolution (explicit shard, key policy or slot hash,
//!    sentinel pool, or a pending one-shot ASK override),
//! 3. readiness check — a not-ready target queues the command instead of
//!    failing it,
//! 4. connection pick, skipping the instance that just failed,
//! 5. send, with the reply forwarded back into the loop.
//!
//! Replies then branch on [`EngineCore::on_reply`]: plain replies go to
//! the caller, `MOVED` re-learns slot ownership and resubmits, `ASK`
//! resubmits once without touching the slot map, connection errors retry
//! on another instance within the command's budget.

use rudder_protocol::{Redirect, RedirectKind};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::command::{CommandOutcome, CommandTask, Target};
use crate::connection::{ConnectionError, ReplyResult};
use crate::controller::{EngineCore, InFlight, LoopEvent};
use crate::error::CommandError;
use crate::readiness::WaitMode;
use crate::shard::PickedConnection;
use crate::stats::EngineCounters;
use crate::types::{Endpoint, Role, RoleRequirement, ShardId, SENTINEL_SHARD};

impl EngineCore {
    /// Completes a command and keeps the outcome counters honest.
    pub(crate) fn complete_task(&self, task: CommandTask, outcome: CommandOutcome) {
        let counters = &self.shared.counters;
        match &outcome {
            Ok(_) => EngineCounters::bump(&counters.completed_ok),
            Err(CommandError::Timeout) => {
                EngineCounters::bump(&counters.timeouts);
                EngineCounters::bump(&counters.completed_err);
            }
            Err(_) => EngineCounters::bump(&counters.completed_err),
        }
        task.complete(outcome);
    }

    /// Queues a command that cannot dispatch yet, unless its deadline
    /// already passed.
    fn enqueue_pending(&mut self, task: CommandTask, now: Instant) {
        if task.control.expired(now) {
            self.complete_task(task, Err(CommandError::Timeout));
            return;
        }
        debug!("command queued awaiting readiness ({} queued)", self.pending.len() + 1);
        self.pending.push(task);
    }

    /// Re-dispatches everything queued, preserving FIFO order. Commands
    /// whose target is still not ready simply queue again.
    pub(crate) fn drain_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        for task in self.pending.take_all() {
            self.dispatch(task);
        }
    }

    fn resolve_key(&self, key: &[u8]) -> Option<ShardId> {
        if let Some(policy) = &self.cfg.key_shard {
            return Some(policy.shard_of(key));
        }
        self.shared
            .routing_snapshot()
            .slot_map
            .shard_of(rudder_routing::key_slot(key))
    }

    /// Routes one command. Consumes the task: it either reaches a
    /// connection, lands in the pending queue, or completes with an
    /// error.
    pub(crate) fn dispatch(&mut self, mut task: CommandTask) {
        let now = Instant::now();
        if self.stopping() {
            self.complete_task(task, Err(CommandError::ShuttingDown));
            return;
        }
        if task.control.expired(now) {
            self.complete_task(task, Err(CommandError::Timeout));
            return;
        }

        // one-shot ASK override: target the named endpoint directly,
        // falling back to normal routing when it is unknown
        if let Some(endpoint) = task.ask_target.take() {
            if let Some(picked) = self.pick_ask_target(&endpoint) {
                self.send_on(picked, task);
                return;
            }
            debug!("ASK target {endpoint} unknown, re-routing normally");
        }

        let shard_id = match &task.target {
            Target::Sentinel => SENTINEL_SHARD,
            Target::ByShard(id) => *id,
            Target::ByKey(key) => match self.resolve_key(key) {
                Some(id) => id,
                None => {
                    // slot ownership unknown: wait for topology
                    self.enqueue_pending(task, now);
                    return;
                }
            },
        };

        let Some(shard) = self.shard_set.get(shard_id).cloned() else {
            self.complete_task(task, Err(CommandError::UnknownShard(shard_id)));
            return;
        };

        let ready = if shard_id == SENTINEL_SHARD {
            shard.has_live(Role::Primary) || shard.has_live(Role::Replica)
        } else {
            let mode = match task.role {
                RoleRequirement::MustPrimary => WaitMode::PrimaryOnly,
                RoleRequirement::Any => WaitMode::PrimaryOrReplica,
            };
            self.gates
                .get(shard_id.index())
                .is_some_and(|gate| gate.bits().satisfies(mode))
        };
        if !ready {
            self.enqueue_pending(task, now);
            return;
        }

        let Some(picked) = shard.pick_connection(task.role, task.prev_instance) else {
            self.enqueue_pending(task, now);
            return;
        };
        task.prev_instance = None;
        self.send_on(picked, task);
    }

    fn pick_ask_target(&self, endpoint: &Endpoint) -> Option<PickedConnection> {
        let routing = self.shared.routing_snapshot();
        let shard_id = routing.host_index.shard_of(&endpoint.host, endpoint.port)?;
        self.shard_set
            .get(shard_id)?
            .connection_for_endpoint(endpoint)
    }

    /// Hands a command to a picked connection and wires the reply back
    /// into the loop.
    fn send_on(&mut self, picked: PickedConnection, task: CommandTask) {
        let dispatch = self.next_dispatch;
        self.next_dispatch += 1;

        trace!("dispatch #{dispatch} via {}", picked.id);
        picked.stats.on_dispatch();
        let (reply_tx, reply_rx) = oneshot::channel();
        picked.conn.send(task.tokens.clone(), reply_tx);

        self.in_flight.insert(
            dispatch,
            InFlight {
                task,
                instance_idx: picked.instance_idx,
                stats: picked.stats,
                sent_at: Instant::now(),
            },
        );

        let tx = self.shared.tx.clone();
        tokio::spawn(async move {
            let result: ReplyResult = match reply_rx.await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Dropped),
            };
            let _ = tx.send(LoopEvent::Reply { dispatch, result });
        });
    }

    /// Applies the reply policy for one dispatched command.
    pub(crate) fn on_reply(&mut self, dispatch: u64, result: ReplyResult) {
        let Some(inflight) = self.in_flight.remove(&dispatch) else {
            return;
        };
        let latency_us = inflight.sent_at.elapsed().as_micros() as u64;

        match result {
            Ok(reply) => {
                // the server answered, so the connection is healthy
                // regardless of what the reply says
                inflight.stats.on_success(latency_us);

                let redirect = reply
                    .as_error()
                    .and_then(Redirect::parse);
                match redirect {
                    Some(redirect) => self.on_redirect(inflight.task, redirect),
                    None => self.complete_task(inflight.task, Ok(reply)),
                }
            }
            Err(err) => {
                inflight.stats.on_error();
                let mut task = inflight.task;
                task.attempts += 1;
                if task.attempts > task.control.retry_budget {
                    let outcome = match err {
                        ConnectionError::Dropped => CommandError::Disconnected,
                        ConnectionError::Timeout => CommandError::Timeout,
                        ConnectionError::Protocol(e) => CommandError::Protocol(e),
                    };
                    self.complete_task(task, Err(outcome));
                } else {
                    EngineCounters::bump(&self.shared.counters.retries);
                    task.prev_instance = Some(inflight.instance_idx);
                    self.dispatch(task);
                }
            }
        }
    }

    fn on_redirect(&mut self, mut task: CommandTask, redirect: Redirect) {
        task.redirects += 1;
        if task.redirects > task.control.redirect_limit {
            let target = format!("{}:{}", redirect.host, redirect.port);
            warn!("redirect limit exhausted at {target}");
            self.complete_task(task, Err(CommandError::RedirectLimit(target)));
            return;
        }

        match redirect.kind {
            RedirectKind::Moved => {
                EngineCounters::bump(&self.shared.counters.redirects_moved);
                let routing = self.shared.routing_snapshot();
                let new_shard = routing
                    .host_index
                    .shard_of(&redirect.host, redirect.port);

                if let Some(shard) = new_shard {
                    // keep the hot path right while the full refresh runs
                    self.shared
                        .apply_point_update(routing.slot_map.epoch(), redirect.slot, shard);
                }
                // a MOVED means the layout changed; re-learn all of it
                self.start_discovery();

                match new_shard {
                    Some(shard) => {
                        debug!(
                            "MOVED slot {} to {} ({}:{})",
                            redirect.slot, shard, redirect.host, redirect.port
                        );
                        task.target = Target::ByShard(shard);
                        task.prev_instance = None;
                        self.dispatch(task);
                    }
                    None => {
                        // redirect into an endpoint we have never seen:
                        // queue until discovery brings it in
                        debug!(
                            "MOVED slot {} to unknown host {}:{}",
                            redirect.slot, redirect.host, redirect.port
                        );
                        self.enqueue_pending(task, Instant::now());
                    }
                }
            }
            RedirectKind::Ask => {
                EngineCounters::bump(&self.shared.counters.redirects_ask);
                debug!(
                    "ASK slot {} to {}:{}",
                    redirect.slot, redirect.host, redirect.port
                );
                task.ask_target = Some(Endpoint::new(redirect.host, redirect.port));
                self.dispatch(task);
            }
        }
    }
}
