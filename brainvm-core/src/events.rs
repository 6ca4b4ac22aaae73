use crate::handles::HandleState;
use crate::types::{ErrorValue, FiberId, FuncId, HandleId};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Scheduler-observable runtime events, recorded in order of occurrence.
/// Hosts drain these to mirror fiber lifecycles into their own systems.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    FiberSpawned {
        fiber_id: FiberId,
        func: FuncId,
    },
    FiberWaiting {
        fiber_id: FiberId,
        handle_id: HandleId,
    },
    FiberResumed {
        fiber_id: FiberId,
        handle_id: HandleId,
        outcome: HandleState,
    },
    FiberYielded {
        fiber_id: FiberId,
    },
    FiberDone {
        fiber_id: FiberId,
        result: Value,
    },
    FiberFault {
        fiber_id: FiberId,
        error: ErrorValue,
    },
    FiberCancelled {
        fiber_id: FiberId,
    },
    HandleCompleted {
        handle_id: HandleId,
        state: HandleState,
    },
    FibersReaped {
        count: usize,
    },
    HandlesReaped {
        count: usize,
    },
}
