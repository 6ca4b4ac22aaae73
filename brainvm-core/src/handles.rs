use crate::types::{ErrorValue, FiberId, HandleId};
use crate::value::Value;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Lifecycle of an async operation handle. Pending is the only state a
/// handle may leave; the rest are terminal and immutable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleState {
    Pending,
    Resolved,
    Rejected,
    Cancelled,
}

impl HandleState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HandleState::Pending)
    }
}

/// One async operation: its settlement state, outcome, and the fibers
/// suspended on it in registration order.
#[derive(Clone, Debug)]
pub struct Handle {
    pub id: HandleId,
    pub state: HandleState,
    pub result: Option<Value>,
    pub error: Option<ErrorValue>,
    pub waiters: Vec<FiberId>,
}

/// Capacity-bounded table of async handles. Settling a pending handle
/// queues a completion; the scheduler drains the queue and fans out to
/// waiters. Settlement never executes fiber code itself.
pub struct HandleTable {
    handles: BTreeMap<HandleId, Handle>,
    next_id: HandleId,
    capacity: usize,
    completed: VecDeque<HandleId>,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            handles: BTreeMap::new(),
            next_id: 1,
            capacity,
            completed: VecDeque::new(),
        }
    }

    pub fn create_pending(&mut self) -> Result<HandleId> {
        if self.handles.len() >= self.capacity {
            bail!("handle table full ({} live handles)", self.handles.len());
        }
        let id = self.next_id;
        self.next_id += 1;
        self.handles.insert(
            id,
            Handle {
                id,
                state: HandleState::Pending,
                result: None,
                error: None,
                waiters: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Settle a pending handle with a result. No-op on terminal or missing
    /// handles.
    pub fn resolve(&mut self, id: HandleId, value: Value) {
        self.settle(id, HandleState::Resolved, Some(value), None);
    }

    /// Settle a pending handle with an error. No-op on terminal or missing
    /// handles.
    pub fn reject(&mut self, id: HandleId, error: ErrorValue) {
        self.settle(id, HandleState::Rejected, None, Some(error));
    }

    /// Cancel a pending handle. No-op on terminal or missing handles.
    pub fn cancel(&mut self, id: HandleId) {
        self.settle(id, HandleState::Cancelled, None, Some(ErrorValue::cancelled()));
    }

    fn settle(
        &mut self,
        id: HandleId,
        state: HandleState,
        result: Option<Value>,
        error: Option<ErrorValue>,
    ) {
        let Some(handle) = self.handles.get_mut(&id) else {
            debug!(handle = id, "ignoring settlement of unknown handle");
            return;
        };
        if handle.state.is_terminal() {
            debug!(handle = id, ?state, "ignoring settlement of settled handle");
            return;
        }
        handle.state = state;
        handle.result = result;
        handle.error = error;
        self.completed.push_back(id);
    }

    pub fn get(&self, id: HandleId) -> Option<&Handle> {
        self.handles.get(&id)
    }

    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut Handle> {
        self.handles.get_mut(&id)
    }

    pub fn delete(&mut self, id: HandleId) {
        self.handles.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn add_waiter(&mut self, id: HandleId, fiber: FiberId) {
        if let Some(handle) = self.handles.get_mut(&id) {
            if !handle.waiters.contains(&fiber) {
                handle.waiters.push(fiber);
            }
        }
    }

    pub fn remove_waiter(&mut self, id: HandleId, fiber: FiberId) {
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.waiters.retain(|w| *w != fiber);
        }
    }

    /// Drain the queued completions since the last call.
    pub fn take_completed(&mut self) -> Vec<HandleId> {
        self.completed.drain(..).collect()
    }

    /// Remove settled handles that no fiber waits on. Returns the count.
    pub fn gc(&mut self) -> usize {
        let before = self.handles.len();
        self.handles
            .retain(|_, h| !h.state.is_terminal() || !h.waiters.is_empty());
        before - self.handles.len()
    }
}
