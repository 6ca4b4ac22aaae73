use crate::handles::{Handle, HandleState, HandleTable};
use crate::host::{HostRegistry, TypeRegistry};
use crate::types::{
    AwaitRecord, CallSiteId, ErrorSite, ErrorValue, Fiber, FiberState, Frame, FuncId, Handler,
    Instr, Program, VmConfig,
};
use crate::value::{ListValue, MapKey, MapValue, StructValue, Value};
use crate::verifier;
use anyhow::{anyhow, bail, Result};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::warn;

/// Result of a single `run_fiber` slice.
#[derive(Clone, Debug, PartialEq)]
pub enum RunStatus {
    /// Budget exhausted or an explicit YIELD; fiber is still runnable.
    Yielded,
    /// Fiber parked on a pending handle.
    Waiting,
    /// Fiber returned from its topmost frame with the given value.
    Done(Option<Value>),
    /// Fiber hit an unhandled exception; see `fiber.last_error`.
    Fault,
}

/// The brain-script interpreter. Executes bytecode fibers against the
/// handle table; one `Vm` serves every fiber of a scheduler.
pub struct Vm {
    program: Arc<Program>,
    host: HostRegistry,
    types: TypeRegistry,
    config: VmConfig,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm").finish_non_exhaustive()
    }
}

impl Vm {
    /// Build a VM over a verified program. Any verification diagnostic
    /// refuses construction; programs are never partially accepted.
    pub fn new(
        program: Program,
        host: HostRegistry,
        types: TypeRegistry,
        config: VmConfig,
    ) -> Result<Self> {
        verifier::verify_or_err(&program)?;
        Ok(Self {
            program: Arc::new(program),
            host,
            types,
            config,
        })
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Execute a fiber until it yields, suspends, returns, or faults.
    ///
    /// The fiber must be runnable with a positive instruction budget; the
    /// scheduler assigns the budget per tick slot. At most `instr_budget`
    /// opcodes are dispatched per call.
    pub fn run_fiber(&self, fiber: &mut Fiber, handles: &mut HandleTable) -> Result<RunStatus> {
        if fiber.state != FiberState::Runnable {
            bail!(
                "run_fiber: fiber {} is {:?}, not runnable",
                fiber.id,
                fiber.state
            );
        }
        if fiber.instr_budget == 0 {
            bail!("run_fiber: fiber {} has no instruction budget", fiber.id);
        }
        fiber.last_run_at = fiber.context.current_tick();

        loop {
            // A host call may have moved the fiber out of Runnable.
            if fiber.state != FiberState::Runnable {
                return Ok(RunStatus::Done(None));
            }
            if fiber.instr_budget == 0 {
                return Ok(RunStatus::Yielded);
            }
            fiber.instr_budget -= 1;

            // A rejected or cancelled handle outcome is delivered as a
            // throw before the next instruction.
            if fiber.pending_injected_throw {
                fiber.pending_injected_throw = false;
                let err = fiber
                    .last_error
                    .clone()
                    .unwrap_or_else(|| ErrorValue::script("injected throw without an error"));
                if let Some(status) = self.throw(fiber, err)? {
                    return Ok(status);
                }
                continue;
            }

            let frame = fiber
                .frames
                .last()
                .ok_or_else(|| anyhow!("fiber {}: no active frame", fiber.id))?;
            let func_id = frame.func_id;
            let pc = frame.pc;
            let function = self
                .program
                .functions
                .get(func_id as usize)
                .ok_or_else(|| anyhow!("fiber {}: unknown function {}", fiber.id, func_id))?;
            let instr = function
                .code
                .get(pc)
                .ok_or_else(|| {
                    anyhow!(
                        "fiber {}: pc {} out of bounds in function {}",
                        fiber.id,
                        pc,
                        func_id
                    )
                })?
                .clone();

            match self.step(fiber, handles, instr, func_id, pc) {
                Ok(None) => continue,
                Ok(Some(status)) => return Ok(status),
                Err(mut err) => {
                    if err.site.is_none() {
                        err.site = Some(ErrorSite { func: func_id, pc });
                    }
                    if let Some(status) = self.throw(fiber, err)? {
                        return Ok(status);
                    }
                }
            }
        }
    }

    /// Dispatch one instruction. `Err` enters the exception path; `Ok(Some)`
    /// ends the slice.
    fn step(
        &self,
        fiber: &mut Fiber,
        handles: &mut HandleTable,
        instr: Instr,
        func_id: FuncId,
        pc: usize,
    ) -> std::result::Result<Option<RunStatus>, ErrorValue> {
        match instr {
            // ── Stack ──
            Instr::PushConst { idx } => {
                let v = self
                    .program
                    .constants
                    .get(idx as usize)
                    .ok_or_else(|| ErrorValue::script(format!("PUSH_CONST: bad constant {idx}")))?
                    .clone();
                self.push(fiber, v)?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::Pop => {
                pop(fiber, "POP")?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::Dup => {
                let top = fiber
                    .vstack
                    .last()
                    .cloned()
                    .ok_or_else(|| ErrorValue::script("DUP: stack underflow"))?;
                self.push(fiber, top)?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::Swap => {
                let len = fiber.vstack.len();
                if len < 2 {
                    return Err(ErrorValue::script("SWAP: stack underflow"));
                }
                fiber.vstack.swap(len - 1, len - 2);
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            // ── Variables ──
            Instr::LoadVar { name } => {
                let name = self.variable_name(name)?;
                let v = fiber.context.resolve_variable(name).unwrap_or(Value::Nil);
                self.push(fiber, v)?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::StoreVar { name } => {
                let name = self.variable_name(name)?.to_string();
                let v = pop(fiber, "STORE_VAR")?;
                let copied = v.deep_copy(&self.types, fiber.context.as_mut())?;
                fiber.context.set_resolved_variable(&name, copied);
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            // ── Control flow ──
            Instr::Jmp { off } => {
                set_pc(fiber, jump_target(pc, off));
                Ok(None)
            }

            Instr::JmpIfFalse { off } => {
                let v = pop(fiber, "JMP_IF_FALSE")?;
                set_pc(fiber, if v.is_truthy() { pc + 1 } else { jump_target(pc, off) });
                Ok(None)
            }

            Instr::JmpIfTrue { off } => {
                let v = pop(fiber, "JMP_IF_TRUE")?;
                set_pc(fiber, if v.is_truthy() { jump_target(pc, off) } else { pc + 1 });
                Ok(None)
            }

            Instr::Call { func, argc } => {
                if fiber.frames.len() >= self.config.max_frame_depth {
                    return Err(ErrorValue::script("call stack overflow"));
                }
                let callee = self
                    .program
                    .functions
                    .get(func as usize)
                    .ok_or_else(|| ErrorValue::script(format!("CALL: unknown function {func}")))?;
                if callee.num_params != argc {
                    return Err(ErrorValue::script(format!(
                        "CALL: function {} takes {} arguments, got {}",
                        func, callee.num_params, argc
                    )));
                }
                let argc = argc as usize;
                if fiber.vstack.len() < argc {
                    return Err(ErrorValue::script("CALL: stack underflow"));
                }
                // Arguments stay in place in push order; the new frame's
                // base sits below them so RET reclaims whatever is left.
                set_pc(fiber, pc + 1);
                fiber.frames.push(Frame {
                    func_id: func,
                    pc: 0,
                    base: fiber.vstack.len() - argc,
                });
                Ok(None)
            }

            Instr::Ret => {
                let ret = pop(fiber, "RET")?;
                let frame = fiber
                    .frames
                    .pop()
                    .ok_or_else(|| ErrorValue::script("RET: no active frame"))?;
                if fiber.vstack.len() > frame.base {
                    warn!(
                        fiber = fiber.id,
                        func = frame.func_id,
                        leaked = fiber.vstack.len() - frame.base,
                        "operand stack not empty at return"
                    );
                }
                fiber.vstack.truncate(frame.base);
                if fiber.frames.is_empty() {
                    fiber
                        .transition(FiberState::Done)
                        .map_err(|e| ErrorValue::script(e.to_string()))?;
                    return Ok(Some(RunStatus::Done(Some(ret))));
                }
                self.push(fiber, ret)?;
                Ok(None)
            }

            // ── Host calls ──
            Instr::HostCall { func, call_site } => {
                let args = pop_map_value(fiber, "HOST_CALL")?;
                let result = self.invoke_sync(fiber, func, call_site, func_id, &args)?;
                self.push(fiber, result)?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::HostCallArgs {
                func,
                argc,
                call_site,
            } => {
                let args = pop_args_map(fiber, argc, "HOST_CALL_ARGS")?;
                let result = self.invoke_sync(fiber, func, call_site, func_id, &args)?;
                self.push(fiber, result)?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::HostCallAsync { func, call_site } => {
                let args = pop_map_value(fiber, "HOST_CALL_ASYNC")?;
                let hid = handles
                    .create_pending()
                    .map_err(|e| ErrorValue::script(e.to_string()))?;
                self.push(fiber, Value::Handle(hid))?;
                self.invoke_async(fiber, handles, func, call_site, func_id, &args, hid);
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::HostCallArgsAsync {
                func,
                argc,
                call_site,
            } => {
                let args = pop_args_map(fiber, argc, "HOST_CALL_ARGS_ASYNC")?;
                let hid = handles
                    .create_pending()
                    .map_err(|e| ErrorValue::script(e.to_string()))?;
                self.push(fiber, Value::Handle(hid))?;
                self.invoke_async(fiber, handles, func, call_site, func_id, &args, hid);
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            // ── Async suspension ──
            Instr::Await => {
                let v = pop(fiber, "AWAIT")?;
                let Value::Handle(hid) = v else {
                    return Err(ErrorValue::script(format!(
                        "AWAIT: expected handle, got {}",
                        v.type_name()
                    )));
                };
                let (state, result, error) = {
                    let handle = handles.get(hid).ok_or_else(|| {
                        ErrorValue::script(format!("AWAIT: unknown handle {hid}"))
                    })?;
                    (handle.state, handle.result.clone(), handle.error.clone())
                };
                match state {
                    HandleState::Resolved => {
                        self.push(fiber, result.unwrap_or(Value::Nil))?;
                        set_pc(fiber, pc + 1);
                        Ok(None)
                    }
                    HandleState::Rejected => {
                        Err(error.unwrap_or_else(|| ErrorValue::host("handle rejected")))
                    }
                    HandleState::Cancelled => Err(error.unwrap_or_else(ErrorValue::cancelled)),
                    HandleState::Pending => {
                        fiber.awaiting = Some(AwaitRecord {
                            resume_pc: pc + 1,
                            stack_height: fiber.vstack.len(),
                            frame_depth: fiber.frames.len(),
                            handle_id: hid,
                        });
                        fiber
                            .transition(FiberState::Waiting)
                            .map_err(|e| ErrorValue::script(e.to_string()))?;
                        handles.add_waiter(hid, fiber.id);
                        Ok(Some(RunStatus::Waiting))
                    }
                }
            }

            Instr::Yield => {
                set_pc(fiber, pc + 1);
                Ok(Some(RunStatus::Yielded))
            }

            // ── Exceptions ──
            Instr::Try { off } => {
                if fiber.handlers.len() >= self.config.max_handlers {
                    return Err(ErrorValue::script("handler stack overflow"));
                }
                fiber.handlers.push(Handler {
                    catch_pc: jump_target(pc, off),
                    stack_height: fiber.vstack.len(),
                    frame_depth: fiber.frames.len(),
                });
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::EndTry => {
                fiber
                    .handlers
                    .pop()
                    .ok_or_else(|| ErrorValue::script("END_TRY: no active handler"))?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::Throw => {
                let v = pop(fiber, "THROW")?;
                match v {
                    Value::Err(e) => Err(*e),
                    other => {
                        Err(ErrorValue::script("script threw a non-error value")
                            .with_detail(other))
                    }
                }
            }

            // ── Rule-section markers ──
            Instr::WhenStart | Instr::DoStart | Instr::DoEnd => {
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::WhenEnd { off } => {
                let v = pop(fiber, "WHEN_END")?;
                set_pc(fiber, if v.is_truthy() { pc + 1 } else { jump_target(pc, off) });
                Ok(None)
            }

            // ── Lists ──
            Instr::ListNew => {
                self.push(fiber, Value::new_list())?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::ListPush => {
                let item = pop(fiber, "LIST_PUSH")?;
                let list = pop_list(fiber, "LIST_PUSH")?;
                list.borrow_mut().items.push(item);
                self.push(fiber, Value::List(list))?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::ListGet => {
                let idx = pop_index(fiber, "LIST_GET")?;
                let list = pop_list(fiber, "LIST_GET")?;
                let v = match idx {
                    Some(i) => list.borrow().items.get(i).cloned().unwrap_or(Value::Nil),
                    None => Value::Nil,
                };
                self.push(fiber, v)?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::ListSet => {
                let value = pop(fiber, "LIST_SET")?;
                let idx = pop_index(fiber, "LIST_SET")?;
                let list = pop_list(fiber, "LIST_SET")?;
                {
                    let mut payload = list.borrow_mut();
                    let slot = idx
                        .filter(|i| *i < payload.items.len())
                        .ok_or_else(|| ErrorValue::script("LIST_SET: index out of range"))?;
                    payload.items[slot] = value;
                }
                self.push(fiber, Value::List(list))?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::ListLen => {
                let list = pop_list(fiber, "LIST_LEN")?;
                let len = list.borrow().items.len();
                self.push(fiber, Value::Num(len as f64))?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            // ── Maps ──
            Instr::MapNew => {
                self.push(fiber, Value::new_map())?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::MapSet => {
                let value = pop(fiber, "MAP_SET")?;
                let key = pop_key(fiber, "MAP_SET")?;
                let map = pop_map(fiber, "MAP_SET")?;
                map.borrow_mut().entries.insert(key, value);
                self.push(fiber, Value::Map(map))?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::MapGet => {
                let key = pop_key(fiber, "MAP_GET")?;
                let map = pop_map(fiber, "MAP_GET")?;
                let v = map.borrow().entries.get(&key).cloned().unwrap_or(Value::Nil);
                self.push(fiber, v)?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::MapHas => {
                let key = pop_key(fiber, "MAP_HAS")?;
                let map = pop_map(fiber, "MAP_HAS")?;
                let has = map.borrow().entries.contains_key(&key);
                self.push(fiber, Value::Bool(has))?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::MapDelete => {
                let key = pop_key(fiber, "MAP_DELETE")?;
                let map = pop_map(fiber, "MAP_DELETE")?;
                map.borrow_mut().entries.shift_remove(&key);
                self.push(fiber, Value::Map(map))?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            // ── Structs ──
            Instr::StructNew { fields, type_const } => {
                let type_id = match type_const {
                    Some(idx) => {
                        let c = self.program.constants.get(idx as usize).ok_or_else(|| {
                            ErrorValue::script(format!("STRUCT_NEW: bad constant {idx}"))
                        })?;
                        let Value::Str(s) = c else {
                            return Err(ErrorValue::script(
                                "STRUCT_NEW: type id constant must be a string",
                            ));
                        };
                        Some(s.clone())
                    }
                    None => None,
                };
                let slots = fields as usize * 2;
                if fiber.vstack.len() < slots {
                    return Err(ErrorValue::script("STRUCT_NEW: stack underflow"));
                }
                let start = fiber.vstack.len() - slots;
                let pairs = fiber.vstack.split_off(start);
                let mut field_map = IndexMap::new();
                for pair in pairs.chunks(2) {
                    let Value::Str(name) = &pair[0] else {
                        return Err(ErrorValue::script(
                            "STRUCT_NEW: field name must be a string",
                        ));
                    };
                    field_map.insert(name.clone(), pair[1].clone());
                }
                self.push(
                    fiber,
                    Value::Struct(Rc::new(RefCell::new(StructValue {
                        type_id,
                        fields: field_map,
                        native: None,
                    }))),
                )?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::StructGet => {
                let name = pop_str(fiber, "STRUCT_GET")?;
                let st = pop_struct(fiber, "STRUCT_GET")?;
                let v = st.borrow().fields.get(&name).cloned().unwrap_or(Value::Nil);
                self.push(fiber, v)?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::StructSet => {
                let value = pop(fiber, "STRUCT_SET")?;
                let name = pop_str(fiber, "STRUCT_SET")?;
                let st = pop_struct(fiber, "STRUCT_SET")?;
                st.borrow_mut().fields.insert(name, value);
                self.push(fiber, Value::Struct(st))?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::GetField => {
                let name = pop_str(fiber, "GET_FIELD")?;
                let st = pop_struct(fiber, "GET_FIELD")?;
                let type_id = st.borrow().type_id.clone();
                let getter = type_id
                    .as_deref()
                    .and_then(|t| self.types.get(t))
                    .and_then(|def| def.field_getter.as_ref());
                let v = match getter {
                    Some(hook) => hook(&st.borrow(), &name, fiber.context.as_mut()),
                    None => st.borrow().fields.get(&name).cloned().unwrap_or(Value::Nil),
                };
                self.push(fiber, v)?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }

            Instr::SetField => {
                let value = pop(fiber, "SET_FIELD")?;
                let name = pop_str(fiber, "SET_FIELD")?;
                let st = pop_struct(fiber, "SET_FIELD")?;
                // Assignment semantics: the stored value is copied the same
                // way STORE_VAR copies it.
                let copied = value.deep_copy(&self.types, fiber.context.as_mut())?;
                let type_id = st.borrow().type_id.clone();
                let setter = type_id
                    .as_deref()
                    .and_then(|t| self.types.get(t))
                    .and_then(|def| def.field_setter.as_ref());
                let handled = match setter {
                    Some(hook) => hook(&mut st.borrow_mut(), &name, &copied, fiber.context.as_mut()),
                    None => false,
                };
                if !handled {
                    st.borrow_mut().fields.insert(name, copied);
                }
                self.push(fiber, Value::Struct(st))?;
                set_pc(fiber, pc + 1);
                Ok(None)
            }
        }
    }

    /// Throw an error value through the fiber's handler stack.
    ///
    /// Unwinding truncates the frame and operand stacks to the innermost
    /// handler's recorded depths and pushes the error; the handler itself
    /// stays installed until the catch block pops it with END_TRY. Without
    /// a handler the fiber faults.
    fn throw(&self, fiber: &mut Fiber, err: ErrorValue) -> Result<Option<RunStatus>> {
        // A fiber never propagates an exception while still registered as
        // waiting on a handle.
        fiber.awaiting = None;

        if let Some(handler) = fiber.handlers.last().copied() {
            fiber.frames.truncate(handler.frame_depth);
            fiber.vstack.truncate(handler.stack_height);
            fiber.vstack.push(Value::error(err));
            let Some(frame) = fiber.frames.last_mut() else {
                bail!("fiber {}: handler with empty frame stack", fiber.id);
            };
            frame.pc = handler.catch_pc;
            Ok(None)
        } else {
            fiber.last_error = Some(err);
            fiber.transition(FiberState::Fault)?;
            Ok(Some(RunStatus::Fault))
        }
    }

    /// Resume a fiber whose awaited handle settled. Returns true when the
    /// fiber was actually resumed; a fiber that is not waiting, or waits on
    /// a different handle, is left untouched.
    pub fn resume_from_handle(&self, fiber: &mut Fiber, handle: &Handle) -> Result<bool> {
        if fiber.state != FiberState::Waiting {
            return Ok(false);
        }
        let Some(record) = fiber.awaiting else {
            return Ok(false);
        };
        if record.handle_id != handle.id {
            return Ok(false);
        }

        fiber.frames.truncate(record.frame_depth);
        fiber.vstack.truncate(record.stack_height);
        let Some(frame) = fiber.frames.last_mut() else {
            bail!("fiber {}: resume with empty frame stack", fiber.id);
        };
        frame.pc = record.resume_pc;
        fiber.awaiting = None;
        fiber.transition(FiberState::Runnable)?;

        match handle.state {
            HandleState::Resolved => {
                fiber
                    .vstack
                    .push(handle.result.clone().unwrap_or(Value::Nil));
            }
            HandleState::Rejected => {
                fiber.last_error = Some(
                    handle
                        .error
                        .clone()
                        .unwrap_or_else(|| ErrorValue::host("handle rejected")),
                );
                fiber.pending_injected_throw = true;
            }
            HandleState::Cancelled => {
                fiber.last_error = Some(
                    handle
                        .error
                        .clone()
                        .unwrap_or_else(ErrorValue::cancelled),
                );
                fiber.pending_injected_throw = true;
            }
            HandleState::Pending => bail!(
                "fiber {}: resume from still-pending handle {}",
                fiber.id,
                handle.id
            ),
        }
        Ok(true)
    }

    fn push(&self, fiber: &mut Fiber, v: Value) -> std::result::Result<(), ErrorValue> {
        if fiber.vstack.len() >= self.config.max_stack_size {
            return Err(ErrorValue::script("operand stack overflow"));
        }
        fiber.vstack.push(v);
        Ok(())
    }

    fn variable_name(&self, idx: u32) -> std::result::Result<&str, ErrorValue> {
        self.program
            .variable_names
            .get(idx as usize)
            .map(|s| s.as_str())
            .ok_or_else(|| ErrorValue::script(format!("bad variable index {idx}")))
    }

    fn invoke_sync(
        &self,
        fiber: &mut Fiber,
        host_id: u32,
        call_site: CallSiteId,
        func_id: FuncId,
        args: &Value,
    ) -> std::result::Result<Value, ErrorValue> {
        let rule = self.host.rule_for(func_id);
        let f = self
            .host
            .sync_fn(host_id)
            .ok_or_else(|| ErrorValue::script(format!("unknown sync host function {host_id}")))?;
        let ctx = fiber.context.as_mut();
        ctx.set_current_rule(rule);
        ctx.set_call_site(call_site);
        f(ctx, args)
    }

    /// Invoke an async host function against its freshly allocated handle.
    /// A host error rejects the handle rather than throwing: the handle
    /// value is already on the stack and AWAIT surfaces the failure.
    fn invoke_async(
        &self,
        fiber: &mut Fiber,
        handles: &mut HandleTable,
        host_id: u32,
        call_site: CallSiteId,
        func_id: FuncId,
        args: &Value,
        hid: u32,
    ) {
        let rule = self.host.rule_for(func_id);
        let ctx = fiber.context.as_mut();
        ctx.set_current_rule(rule);
        ctx.set_call_site(call_site);
        match self.host.async_fn(host_id) {
            None => handles.reject(
                hid,
                ErrorValue::script(format!("unknown async host function {host_id}")),
            ),
            Some(f) => {
                if let Err(err) = f(ctx, args, hid, handles) {
                    handles.reject(hid, err);
                }
            }
        }
    }
}

// ─── Stack helpers ────────────────────────────────────────────

fn set_pc(fiber: &mut Fiber, pc: usize) {
    if let Some(frame) = fiber.frames.last_mut() {
        frame.pc = pc;
    }
}

fn jump_target(pc: usize, off: i32) -> usize {
    (pc as i64).wrapping_add(off as i64) as usize
}

fn pop(fiber: &mut Fiber, op: &str) -> std::result::Result<Value, ErrorValue> {
    fiber
        .vstack
        .pop()
        .ok_or_else(|| ErrorValue::script(format!("{op}: stack underflow")))
}

fn pop_list(fiber: &mut Fiber, op: &str) -> std::result::Result<Rc<RefCell<ListValue>>, ErrorValue> {
    match pop(fiber, op)? {
        Value::List(l) => Ok(l),
        other => Err(ErrorValue::script(format!(
            "{op}: expected list, got {}",
            other.type_name()
        ))),
    }
}

fn pop_map(fiber: &mut Fiber, op: &str) -> std::result::Result<Rc<RefCell<MapValue>>, ErrorValue> {
    match pop(fiber, op)? {
        Value::Map(m) => Ok(m),
        other => Err(ErrorValue::script(format!(
            "{op}: expected map, got {}",
            other.type_name()
        ))),
    }
}

fn pop_struct(
    fiber: &mut Fiber,
    op: &str,
) -> std::result::Result<Rc<RefCell<StructValue>>, ErrorValue> {
    match pop(fiber, op)? {
        Value::Struct(s) => Ok(s),
        other => Err(ErrorValue::script(format!(
            "{op}: expected struct, got {}",
            other.type_name()
        ))),
    }
}

fn pop_str(fiber: &mut Fiber, op: &str) -> std::result::Result<String, ErrorValue> {
    match pop(fiber, op)? {
        Value::Str(s) => Ok(s),
        other => Err(ErrorValue::script(format!(
            "{op}: expected string, got {}",
            other.type_name()
        ))),
    }
}

/// Pop a numeric index, floored. Negative or non-finite indexes read as
/// absent.
fn pop_index(fiber: &mut Fiber, op: &str) -> std::result::Result<Option<usize>, ErrorValue> {
    match pop(fiber, op)? {
        Value::Num(n) => {
            let floored = n.floor();
            if floored.is_finite() && floored >= 0.0 {
                Ok(Some(floored as usize))
            } else {
                Ok(None)
            }
        }
        other => Err(ErrorValue::script(format!(
            "{op}: expected numeric index, got {}",
            other.type_name()
        ))),
    }
}

fn pop_key(fiber: &mut Fiber, op: &str) -> std::result::Result<MapKey, ErrorValue> {
    let v = pop(fiber, op)?;
    MapKey::from_value(&v).ok_or_else(|| {
        ErrorValue::script(format!(
            "{op}: key must be a string or number, got {}",
            v.type_name()
        ))
    })
}

/// Pop the pre-assembled argument map pushed by the compiler.
fn pop_map_value(fiber: &mut Fiber, op: &str) -> std::result::Result<Value, ErrorValue> {
    let v = pop(fiber, op)?;
    match v {
        Value::Map(_) => Ok(v),
        other => Err(ErrorValue::script(format!(
            "{op}: expected argument map, got {}",
            other.type_name()
        ))),
    }
}

/// Pop `argc` raw values and package them into a map keyed by slot index,
/// slot 0 being the first value pushed.
fn pop_args_map(
    fiber: &mut Fiber,
    argc: u16,
    op: &str,
) -> std::result::Result<Value, ErrorValue> {
    let argc = argc as usize;
    if fiber.vstack.len() < argc {
        return Err(ErrorValue::script(format!("{op}: stack underflow")));
    }
    let start = fiber.vstack.len() - argc;
    let raw = fiber.vstack.split_off(start);
    let mut entries = IndexMap::new();
    for (slot, v) in raw.into_iter().enumerate() {
        entries.insert(MapKey::num(slot as f64), v);
    }
    Ok(Value::Map(Rc::new(RefCell::new(MapValue {
        type_id: None,
        entries,
    }))))
}
