//! Core execution engine for brain behavior scripts.
//!
//! A stack-based bytecode VM with cooperative fibers, handle-based async
//! host calls, structured exception unwinding, and budgeted scheduling.
//! The surface-language compiler, the host function catalog, and the
//! simulation layer live elsewhere: this crate consumes a verified
//! [`Program`], a [`HostRegistry`] of callable functions, and per-fiber
//! [`ExecutionContext`] objects, and runs them.

pub mod context;
pub mod events;
pub mod handles;
pub mod host;
pub mod scheduler;
pub mod types;
pub mod value;
pub mod verifier;
pub mod vm;

pub use context::{ExecutionContext, MemoryContext};
pub use events::RuntimeEvent;
pub use handles::{Handle, HandleState, HandleTable};
pub use host::{HostRegistry, StructTypeDef, TypeRegistry};
pub use scheduler::{FiberInspection, Scheduler, VmStats};
pub use types::{
    AwaitRecord, ErrorSite, ErrorTag, ErrorValue, Fiber, FiberId, FiberState, Frame, FuncId,
    FunctionBytecode, HandleId, Handler, Instr, Program, VmConfig, BYTECODE_VERSION,
};
pub use value::{ListValue, MapKey, MapValue, NativeHandle, StructValue, Value};
pub use verifier::{verify, verify_or_err, VerifyError};
pub use vm::{RunStatus, Vm};
