//! Queue for commands that cannot dispatch yet.
//!
//! Commands land here when their target shard has no usable connection:
//! before the first topology is learned, during a reconfiguration, or
//! while a redirect target is still unknown. The engine loop owns the
//! queue outright, so FIFO drain order and single-dispatch are structural
//! rather than locked-in.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::command::CommandTask;

#[derive(Default)]
pub(crate) struct PendingQueue {
    items: VecDeque<CommandTask>,
}

impl PendingQueue {
    pub fn push(&mut self, task: CommandTask) {
        self.items.push_back(task);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Takes the whole queue in FIFO order. The caller re-queues what
    /// still cannot dispatch, preserving relative order.
    pub fn take_all(&mut self) -> VecDeque<CommandTask> {
        std::mem::take(&mut self.items)
    }

    /// Removes and returns every queued command whose deadline passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<CommandTask> {
        let mut expired = Vec::new();
        let mut idx = 0;
        while idx < self.items.len() {
            if self.items[idx].control.expired(now) {
                if let Some(task) = self.items.remove(idx) {
                    expired.push(task);
                }
            } else {
                idx += 1;
            }
        }
        expired
    }
}
