use crate::context::ExecutionContext;
use crate::value::Value;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ─── Scalar aliases ───────────────────────────────────────────

/// Index of a function within a program.
pub type FuncId = u32;

/// Identifier of a fiber within a scheduler.
pub type FiberId = u32;

/// Identifier of an async operation handle.
pub type HandleId = u32;

/// Opaque call-site id baked into host-call instructions.
pub type CallSiteId = u32;

/// Opaque per-function rule association provided by the host.
pub type RuleId = u32;

/// Bytecode format version understood by this engine.
pub const BYTECODE_VERSION: u32 = 1;

// ─── Bytecode instructions ────────────────────────────────────

/// The instruction set of the brain VM.
///
/// Jump operands are signed offsets relative to the instruction's own
/// address; everything else indexes into the program's constant, variable,
/// or function tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    // Stack
    PushConst {
        idx: u32,
    },
    Pop,
    Dup,
    Swap,

    // Variables (resolved through the execution context)
    LoadVar {
        name: u32,
    },
    StoreVar {
        name: u32,
    },

    // Control flow
    Jmp {
        off: i32,
    },
    JmpIfFalse {
        off: i32,
    },
    JmpIfTrue {
        off: i32,
    },
    Call {
        func: FuncId,
        argc: u16,
    },
    Ret,

    // Host calls. The `Args` forms pop raw values and package them into a
    // slot-indexed map; the plain forms pop a pre-assembled argument map.
    HostCall {
        func: u32,
        call_site: CallSiteId,
    },
    HostCallArgs {
        func: u32,
        argc: u16,
        call_site: CallSiteId,
    },
    HostCallAsync {
        func: u32,
        call_site: CallSiteId,
    },
    HostCallArgsAsync {
        func: u32,
        argc: u16,
        call_site: CallSiteId,
    },

    // Async suspension
    Await,
    Yield,

    // Exceptions
    Try {
        off: i32,
    },
    EndTry,
    Throw,

    // Rule-section boundaries emitted by the compiler. WHEN_START/DO_START/
    // DO_END exist for tooling only; WHEN_END gates the DO section.
    WhenStart,
    WhenEnd {
        off: i32,
    },
    DoStart,
    DoEnd,

    // Lists
    ListNew,
    ListPush,
    ListGet,
    ListSet,
    ListLen,

    // Maps
    MapNew,
    MapSet,
    MapGet,
    MapHas,
    MapDelete,

    // Structs
    StructNew {
        fields: u16,
        /// Constant index of the type id string; `None` for anonymous.
        type_const: Option<u32>,
    },
    StructGet,
    StructSet,
    GetField,
    SetField,
}

// ─── Program ──────────────────────────────────────────────────

/// One compiled function: a parameter count and a straight-line
/// instruction sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionBytecode {
    pub name: Option<String>,
    pub num_params: u16,
    pub code: Vec<Instr>,
}

/// A verified, immutable unit of executable bytecode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub version: u32,
    pub constants: Vec<Value>,
    pub variable_names: Vec<String>,
    pub functions: Vec<FunctionBytecode>,
    pub entry_point: FuncId,
}

// ─── Errors ───────────────────────────────────────────────────

/// Closed taxonomy of script-visible error kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorTag {
    /// A VM- or instruction-level violation (bad index, type mismatch).
    ScriptError,
    /// A host function failed a handle or produced an inconsistency.
    HostError,
    /// A fiber or handle was cancelled.
    Cancelled,
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorTag::ScriptError => "ScriptError",
            ErrorTag::HostError => "HostError",
            ErrorTag::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Where an error was raised, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSite {
    pub func: FuncId,
    pub pc: usize,
}

/// The error payload that travels through TRY handlers and fiber faults.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[error("{tag}: {message}")]
pub struct ErrorValue {
    pub tag: ErrorTag,
    pub message: String,
    pub detail: Option<Value>,
    pub site: Option<ErrorSite>,
}

impl ErrorValue {
    pub fn script(message: impl Into<String>) -> Self {
        Self {
            tag: ErrorTag::ScriptError,
            message: message.into(),
            detail: None,
            site: None,
        }
    }

    pub fn host(message: impl Into<String>) -> Self {
        Self {
            tag: ErrorTag::HostError,
            message: message.into(),
            detail: None,
            site: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            tag: ErrorTag::Cancelled,
            message: "cancelled".to_string(),
            detail: None,
            site: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

// ─── Fiber ────────────────────────────────────────────────────

/// Lifecycle state of a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FiberState {
    Runnable,
    Waiting,
    Done,
    Fault,
    Cancelled,
}

impl FiberState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FiberState::Done | FiberState::Fault | FiberState::Cancelled
        )
    }

    /// The legal transition set. Everything not listed here is an
    /// engine-corruption bug.
    pub fn can_transition(self, to: FiberState) -> bool {
        use FiberState::*;
        matches!(
            (self, to),
            (Runnable, Waiting)
                | (Runnable, Done)
                | (Runnable, Fault)
                | (Runnable, Cancelled)
                | (Waiting, Runnable)
                | (Waiting, Cancelled)
                | (Waiting, Fault)
        )
    }
}

/// One call activation: the function being executed, its program counter,
/// and the operand-stack height at the moment the frame was pushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub func_id: FuncId,
    pub pc: usize,
    pub base: usize,
}

/// An installed TRY handler: where to resume and how far to unwind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    pub catch_pc: usize,
    pub stack_height: usize,
    pub frame_depth: usize,
}

/// Suspension record for a fiber parked on a pending handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitRecord {
    pub resume_pc: usize,
    pub stack_height: usize,
    pub frame_depth: usize,
    pub handle_id: HandleId,
}

/// A lightweight cooperative task: operand stack, call frames, handler
/// stack, and an optional await record while suspended.
pub struct Fiber {
    pub id: FiberId,
    pub state: FiberState,
    pub vstack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub handlers: Vec<Handler>,
    pub awaiting: Option<AwaitRecord>,
    pub instr_budget: u32,
    pub last_error: Option<ErrorValue>,
    /// Set when a rejected/cancelled handle outcome must be thrown on the
    /// next interpreter entry.
    pub pending_injected_throw: bool,
    pub created_at: u64,
    pub last_run_at: u64,
    pub context: Box<dyn ExecutionContext>,
}

impl Fiber {
    pub fn new(id: FiberId, func: FuncId, context: Box<dyn ExecutionContext>) -> Self {
        Self {
            id,
            state: FiberState::Runnable,
            vstack: Vec::new(),
            frames: vec![Frame {
                func_id: func,
                pc: 0,
                base: 0,
            }],
            handlers: Vec::new(),
            awaiting: None,
            instr_budget: 0,
            last_error: None,
            pending_injected_throw: false,
            created_at: 0,
            last_run_at: 0,
            context,
        }
    }

    /// Move to a new lifecycle state, enforcing the transition table.
    pub fn transition(&mut self, to: FiberState) -> Result<()> {
        if !self.state.can_transition(to) {
            bail!(
                "invalid fiber state transition {:?} -> {:?} (fiber {})",
                self.state,
                to,
                self.id
            );
        }
        self.state = to;
        Ok(())
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("frames", &self.frames)
            .field("stack_depth", &self.vstack.len())
            .field("handlers", &self.handlers.len())
            .field("awaiting", &self.awaiting)
            .field("last_error", &self.last_error)
            .finish()
    }
}

// ─── Configuration ────────────────────────────────────────────

/// Resource limits and scheduling knobs for one VM instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Maximum call-frame depth per fiber.
    pub max_frame_depth: usize,
    /// Maximum operand-stack height per fiber.
    pub max_stack_size: usize,
    /// Maximum installed TRY handlers per fiber.
    pub max_handlers: usize,
    /// Maximum live fibers per scheduler.
    pub max_fibers: usize,
    /// Maximum live handles in the handle table.
    pub max_handles: usize,
    /// Instructions granted to a fiber per tick slot.
    pub default_budget: u32,
    /// Runnable fibers popped per tick.
    pub max_fibers_per_tick: usize,
    /// Delete settled handles that no fiber waits on.
    pub auto_gc_handles: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_frame_depth: 64,
            max_stack_size: 1024,
            max_handlers: 32,
            max_fibers: 512,
            max_handles: 1024,
            default_budget: 500,
            max_fibers_per_tick: 16,
            auto_gc_handles: true,
        }
    }
}
