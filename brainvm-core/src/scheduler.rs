use crate::context::ExecutionContext;
use crate::events::RuntimeEvent;
use crate::handles::HandleTable;
use crate::types::{ErrorValue, Fiber, FiberId, FiberState, FuncId, HandleId};
use crate::value::Value;
use crate::vm::{RunStatus, Vm};
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Per-state fiber counts plus the number of live handles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStats {
    pub total: usize,
    pub runnable: usize,
    pub waiting: usize,
    pub done: usize,
    pub fault: usize,
    pub cancelled: usize,
    pub live_handles: usize,
}

/// Snapshot of one fiber for host-side inspection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FiberInspection {
    pub fiber_id: FiberId,
    pub state: FiberState,
    pub func: Option<FuncId>,
    pub pc: Option<usize>,
    pub stack_depth: usize,
    pub frame_depth: usize,
    pub handler_depth: usize,
    pub awaiting: Option<HandleId>,
    pub last_error: Option<ErrorValue>,
}

/// Multiplexes fibers over ticks: owns the fiber table, the FIFO runnable
/// queue, and the handle table, and fans handle completions out to waiters.
///
/// Everything runs on the caller's thread; handle settlement from outside a
/// tick only queues work for the next tick, it never drives execution.
pub struct Scheduler {
    vm: Vm,
    fibers: BTreeMap<FiberId, Fiber>,
    run_queue: VecDeque<FiberId>,
    next_fiber_id: FiberId,
    handles: HandleTable,
    events: Vec<RuntimeEvent>,
    current_tick: u64,
}

impl Scheduler {
    pub fn new(vm: Vm) -> Self {
        let handles = HandleTable::new(vm.config().max_handles);
        Self {
            vm,
            fibers: BTreeMap::new(),
            run_queue: VecDeque::new(),
            next_fiber_id: 1,
            handles,
            events: Vec::new(),
            current_tick: 0,
        }
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Hosts settle async handles through this.
    pub fn handles_mut(&mut self) -> &mut HandleTable {
        &mut self.handles
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub fn fiber(&self, id: FiberId) -> Option<&Fiber> {
        self.fibers.get(&id)
    }

    pub fn fiber_state(&self, id: FiberId) -> Option<FiberState> {
        self.fibers.get(&id).map(|f| f.state)
    }

    /// Create a runnable fiber for `func` and enqueue it.
    ///
    /// Arguments are validated against the function's parameter count but
    /// never pushed onto the operand stack: the host exposes them to the
    /// script through the execution context.
    pub fn spawn(
        &mut self,
        func: FuncId,
        args: &[Value],
        mut context: Box<dyn ExecutionContext>,
    ) -> Result<FiberId> {
        let function = self
            .vm
            .program()
            .functions
            .get(func as usize)
            .ok_or_else(|| anyhow!("spawn: unknown function {func}"))?;
        if args.len() != function.num_params as usize {
            bail!(
                "spawn: function {} takes {} arguments, got {}",
                func,
                function.num_params,
                args.len()
            );
        }
        if self.fibers.len() >= self.vm.config().max_fibers {
            bail!("fiber table full ({} live fibers)", self.fibers.len());
        }

        let id = self.next_fiber_id;
        self.next_fiber_id += 1;
        context.set_fiber_id(id);
        let mut fiber = Fiber::new(id, func, context);
        fiber.created_at = self.current_tick;
        self.fibers.insert(id, fiber);
        self.run_queue.push_back(id);
        self.events.push(RuntimeEvent::FiberSpawned { fiber_id: id, func });
        debug!(fiber = id, func, "fiber spawned");
        Ok(id)
    }

    /// Run one scheduling pass: fan out settled handles, then give up to
    /// `max_fibers_per_tick` runnable fibers a budget slice each. Returns
    /// the number of fibers actually executed.
    pub fn tick(&mut self) -> Result<usize> {
        self.current_tick += 1;
        self.pump_completions()?;

        let max_pops = self.vm.config().max_fibers_per_tick;
        let budget = self.vm.config().default_budget;
        let mut executed = 0;

        for _ in 0..max_pops {
            let Some(id) = self.run_queue.pop_front() else {
                break;
            };
            let Some(fiber) = self.fibers.get_mut(&id) else {
                continue;
            };
            if fiber.state != FiberState::Runnable {
                continue;
            }

            fiber.instr_budget = budget;
            let status = self.vm.run_fiber(fiber, &mut self.handles)?;
            executed += 1;

            match status {
                RunStatus::Yielded => {
                    self.run_queue.push_back(id);
                    self.events.push(RuntimeEvent::FiberYielded { fiber_id: id });
                }
                RunStatus::Waiting => {
                    if let Some(record) = fiber.awaiting {
                        self.events.push(RuntimeEvent::FiberWaiting {
                            fiber_id: id,
                            handle_id: record.handle_id,
                        });
                        debug!(fiber = id, handle = record.handle_id, "fiber waiting");
                    }
                }
                RunStatus::Done(result) => {
                    self.events.push(RuntimeEvent::FiberDone {
                        fiber_id: id,
                        result: result.unwrap_or(Value::Void),
                    });
                    debug!(fiber = id, "fiber done");
                }
                RunStatus::Fault => {
                    let error = fiber
                        .last_error
                        .clone()
                        .unwrap_or_else(|| ErrorValue::script("fault without error"));
                    warn!(fiber = id, %error, "fiber faulted");
                    self.events.push(RuntimeEvent::FiberFault {
                        fiber_id: id,
                        error,
                    });
                }
            }

            // A host call inside the slice may have settled handles other
            // fibers wait on.
            self.pump_completions()?;
        }

        Ok(executed)
    }

    fn pump_completions(&mut self) -> Result<()> {
        loop {
            let completed = self.handles.take_completed();
            if completed.is_empty() {
                return Ok(());
            }
            for hid in completed {
                self.fan_out(hid)?;
            }
        }
    }

    /// Resume every fiber registered on a settled handle, in registration
    /// order, then reclaim the handle if nothing else can reach it.
    fn fan_out(&mut self, hid: HandleId) -> Result<()> {
        let auto_gc = self.vm.config().auto_gc_handles;
        let (snapshot, waiters) = {
            let Some(handle) = self.handles.get_mut(hid) else {
                debug!(handle = hid, "completion for deleted handle ignored");
                return Ok(());
            };
            let waiters = std::mem::take(&mut handle.waiters);
            (handle.clone(), waiters)
        };
        self.events.push(RuntimeEvent::HandleCompleted {
            handle_id: hid,
            state: snapshot.state,
        });

        for fid in waiters {
            let Some(fiber) = self.fibers.get_mut(&fid) else {
                continue;
            };
            if self.vm.resume_from_handle(fiber, &snapshot)? {
                self.run_queue.push_back(fid);
                self.events.push(RuntimeEvent::FiberResumed {
                    fiber_id: fid,
                    handle_id: hid,
                    outcome: snapshot.state,
                });
            }
        }

        if auto_gc {
            self.handles.delete(hid);
        }
        Ok(())
    }

    /// Cancel a fiber. Waiting fibers are detached from their handle;
    /// terminal and unknown fibers are ignored. Returns whether the fiber
    /// was cancelled.
    pub fn cancel(&mut self, id: FiberId) -> Result<bool> {
        let Some(fiber) = self.fibers.get_mut(&id) else {
            debug!(fiber = id, "cancel of unknown fiber ignored");
            return Ok(false);
        };
        if fiber.state.is_terminal() {
            debug!(fiber = id, state = ?fiber.state, "cancel of terminal fiber ignored");
            return Ok(false);
        }
        if let Some(record) = fiber.awaiting.take() {
            self.handles.remove_waiter(record.handle_id, id);
        }
        fiber.transition(FiberState::Cancelled)?;
        fiber.last_error = Some(ErrorValue::cancelled());
        self.events.push(RuntimeEvent::FiberCancelled { fiber_id: id });
        debug!(fiber = id, "fiber cancelled");
        Ok(true)
    }

    /// Remove all terminal fibers. Returns the count reaped.
    pub fn gc(&mut self) -> usize {
        let before = self.fibers.len();
        self.fibers.retain(|_, f| !f.state.is_terminal());
        let count = before - self.fibers.len();
        if count > 0 {
            self.events.push(RuntimeEvent::FibersReaped { count });
        }
        count
    }

    /// Remove settled handles nothing waits on. Returns the count reaped.
    pub fn gc_handles(&mut self) -> usize {
        let count = self.handles.gc();
        if count > 0 {
            self.events.push(RuntimeEvent::HandlesReaped { count });
        }
        count
    }

    pub fn stats(&self) -> VmStats {
        let mut stats = VmStats {
            total: self.fibers.len(),
            live_handles: self.handles.len(),
            ..Default::default()
        };
        for fiber in self.fibers.values() {
            match fiber.state {
                FiberState::Runnable => stats.runnable += 1,
                FiberState::Waiting => stats.waiting += 1,
                FiberState::Done => stats.done += 1,
                FiberState::Fault => stats.fault += 1,
                FiberState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn inspect_fiber(&self, id: FiberId) -> Option<FiberInspection> {
        let fiber = self.fibers.get(&id)?;
        let frame = fiber.frames.last();
        Some(FiberInspection {
            fiber_id: fiber.id,
            state: fiber.state,
            func: frame.map(|f| f.func_id),
            pc: frame.map(|f| f.pc),
            stack_depth: fiber.vstack.len(),
            frame_depth: fiber.frames.len(),
            handler_depth: fiber.handlers.len(),
            awaiting: fiber.awaiting.map(|r| r.handle_id),
            last_error: fiber.last_error.clone(),
        })
    }

    pub fn events(&self) -> &[RuntimeEvent] {
        &self.events
    }

    pub fn drain_events(&mut self) -> Vec<RuntimeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Tick until the fiber reaches a terminal state or `max_ticks` passes.
    pub fn run_to_completion(&mut self, id: FiberId, max_ticks: usize) -> Result<FiberState> {
        for _ in 0..max_ticks {
            match self.fiber_state(id) {
                None => bail!("run_to_completion: unknown fiber {id}"),
                Some(state) if state.is_terminal() => return Ok(state),
                Some(_) => {
                    self.tick()?;
                }
            }
        }
        self.fiber_state(id)
            .ok_or_else(|| anyhow!("run_to_completion: unknown fiber {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MemoryContext;
    use crate::host::{HostRegistry, TypeRegistry};
    use crate::types::{FunctionBytecode, Instr, Program, VmConfig, BYTECODE_VERSION};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn program(constants: Vec<Value>, code: Vec<Instr>) -> Program {
        Program {
            version: BYTECODE_VERSION,
            constants,
            variable_names: vec!["h".to_string()],
            functions: vec![FunctionBytecode {
                name: None,
                num_params: 0,
                code,
            }],
            entry_point: 0,
        }
    }

    fn scheduler(p: Program, host: HostRegistry, config: VmConfig) -> Scheduler {
        Scheduler::new(Vm::new(p, host, TypeRegistry::new(), config).unwrap())
    }

    fn ctx() -> Box<MemoryContext> {
        Box::new(MemoryContext::new())
    }

    #[test]
    fn spawn_validates_argc_and_writes_fiber_id() {
        let p = program(vec![Value::Num(1.0)], vec![Instr::PushConst { idx: 0 }, Instr::Ret]);
        let mut sched = scheduler(p, HostRegistry::new(), VmConfig::default());

        let err = sched.spawn(0, &[Value::Num(1.0)], ctx()).unwrap_err();
        assert!(err.to_string().contains("takes 0 arguments"));

        let fid = sched.spawn(0, &[], ctx()).unwrap();
        assert_eq!(sched.fiber(fid).unwrap().context.fiber_id(), Some(fid));
        assert_eq!(sched.fiber_state(fid), Some(FiberState::Runnable));
    }

    #[test]
    fn spawn_respects_fiber_limit() {
        let p = program(vec![], vec![Instr::Yield, Instr::Jmp { off: -1 }]);
        let config = VmConfig {
            max_fibers: 1,
            ..Default::default()
        };
        let mut sched = scheduler(p, HostRegistry::new(), config);
        sched.spawn(0, &[], ctx()).unwrap();
        assert!(sched.spawn(0, &[], ctx()).is_err());
    }

    /// S4: await, external resolution, fan-out, completion on the next tick.
    #[test]
    fn async_await_round_trip() {
        let seen: Rc<RefCell<Option<HandleId>>> = Rc::new(RefCell::new(None));
        let seen_in_host = seen.clone();
        let mut host = HostRegistry::new();
        host.register_async(2, move |_, _, hid, _| {
            *seen_in_host.borrow_mut() = Some(hid);
            Ok(())
        });
        let p = program(
            vec![],
            vec![
                Instr::MapNew,
                Instr::HostCallAsync {
                    func: 2,
                    call_site: 1,
                },
                Instr::Await,
                Instr::Ret,
            ],
        );
        let mut sched = scheduler(p, host, VmConfig::default());
        let fid = sched.spawn(0, &[], ctx()).unwrap();

        assert_eq!(sched.tick().unwrap(), 1);
        assert_eq!(sched.fiber_state(fid), Some(FiberState::Waiting));

        let hid = seen.borrow().unwrap();
        sched.handles_mut().resolve(hid, Value::Num(77.0));

        assert_eq!(sched.tick().unwrap(), 1);
        assert_eq!(sched.fiber_state(fid), Some(FiberState::Done));
        assert!(sched.events().iter().any(|e| matches!(
            e,
            RuntimeEvent::FiberDone {
                result: Value::Num(n),
                ..
            } if *n == 77.0
        )));
        // The settled handle had no waiters left and was auto-reclaimed.
        assert_eq!(sched.stats().live_handles, 0);
    }

    /// S6: cancelling a waiting fiber detaches it from its handle.
    #[test]
    fn cancel_while_waiting_detaches_from_handle() {
        let seen: Rc<RefCell<Option<HandleId>>> = Rc::new(RefCell::new(None));
        let seen_in_host = seen.clone();
        let mut host = HostRegistry::new();
        host.register_async(2, move |_, _, hid, _| {
            *seen_in_host.borrow_mut() = Some(hid);
            Ok(())
        });
        let p = program(
            vec![],
            vec![
                Instr::MapNew,
                Instr::HostCallAsync {
                    func: 2,
                    call_site: 0,
                },
                Instr::Await,
                Instr::Ret,
            ],
        );
        let mut sched = scheduler(p, host, VmConfig::default());
        let fid = sched.spawn(0, &[], ctx()).unwrap();
        sched.tick().unwrap();
        assert_eq!(sched.fiber_state(fid), Some(FiberState::Waiting));

        assert!(sched.cancel(fid).unwrap());
        assert_eq!(sched.fiber_state(fid), Some(FiberState::Cancelled));
        let hid = seen.borrow().unwrap();
        assert!(sched.handles().get(hid).unwrap().waiters.is_empty());

        // The cancelled fiber never runs again.
        assert_eq!(sched.tick().unwrap(), 0);
        let err = sched.fiber(fid).unwrap().last_error.clone().unwrap();
        assert_eq!(err.tag, crate::types::ErrorTag::Cancelled);

        // A late resolution completes into the void and is reclaimed.
        sched.handles_mut().resolve(hid, Value::Num(1.0));
        sched.tick().unwrap();
        assert_eq!(sched.fiber_state(fid), Some(FiberState::Cancelled));
        assert_eq!(sched.stats().live_handles, 0);
    }

    #[test]
    fn cancelled_runnable_fiber_is_skipped_by_tick() {
        let p = program(
            vec![Value::Num(0.0)],
            vec![Instr::PushConst { idx: 0 }, Instr::Pop, Instr::Jmp { off: -2 }],
        );
        let mut sched = scheduler(p, HostRegistry::new(), VmConfig::default());
        let fid = sched.spawn(0, &[], ctx()).unwrap();
        sched.cancel(fid).unwrap();
        assert_eq!(sched.tick().unwrap(), 0);
        assert_eq!(sched.fiber_state(fid), Some(FiberState::Cancelled));
    }

    #[test]
    fn cancel_is_idempotent_and_ignores_terminal_fibers() {
        let p = program(vec![Value::Num(1.0)], vec![Instr::PushConst { idx: 0 }, Instr::Ret]);
        let mut sched = scheduler(p, HostRegistry::new(), VmConfig::default());
        let fid = sched.spawn(0, &[], ctx()).unwrap();
        sched.tick().unwrap();
        assert_eq!(sched.fiber_state(fid), Some(FiberState::Done));
        assert!(!sched.cancel(fid).unwrap());
        assert!(!sched.cancel(999).unwrap());
    }

    #[test]
    fn yielding_fibers_requeue_at_the_tail() {
        let log: Rc<RefCell<Vec<FiberId>>> = Rc::new(RefCell::new(Vec::new()));
        let log_in_host = log.clone();
        let mut host = HostRegistry::new();
        host.register_sync(1, move |ctx, _| {
            log_in_host.borrow_mut().push(ctx.fiber_id().unwrap_or(0));
            Ok(Value::Nil)
        });
        let p = program(
            vec![],
            vec![
                Instr::MapNew,
                Instr::HostCall {
                    func: 1,
                    call_site: 0,
                },
                Instr::Pop,
                Instr::Yield,
                Instr::Jmp { off: -4 },
            ],
        );
        let mut sched = scheduler(p, host, VmConfig::default());
        let a = sched.spawn(0, &[], ctx()).unwrap();
        let b = sched.spawn(0, &[], ctx()).unwrap();

        assert_eq!(sched.tick().unwrap(), 2);
        assert_eq!(*log.borrow(), vec![a, b]);
        assert_eq!(sched.tick().unwrap(), 2);
        assert_eq!(*log.borrow(), vec![a, b, a, b]);
    }

    #[test]
    fn tick_caps_fibers_per_pass() {
        let p = program(vec![], vec![Instr::Yield, Instr::Jmp { off: -1 }]);
        let config = VmConfig {
            max_fibers_per_tick: 2,
            ..Default::default()
        };
        let mut sched = scheduler(p, HostRegistry::new(), config);
        for _ in 0..3 {
            sched.spawn(0, &[], ctx()).unwrap();
        }
        assert_eq!(sched.tick().unwrap(), 2);
        assert_eq!(sched.tick().unwrap(), 2);
    }

    #[test]
    fn shared_handle_fans_out_to_waiters_in_registration_order() {
        let p = program(
            vec![],
            vec![Instr::LoadVar { name: 0 }, Instr::Await, Instr::Ret],
        );
        let config = VmConfig {
            auto_gc_handles: false,
            ..Default::default()
        };
        let mut sched = scheduler(p, HostRegistry::new(), config);
        let hid = sched.handles_mut().create_pending().unwrap();

        let a = sched
            .spawn(0, &[], Box::new(MemoryContext::new().with_variable("h", Value::Handle(hid))))
            .unwrap();
        let b = sched
            .spawn(0, &[], Box::new(MemoryContext::new().with_variable("h", Value::Handle(hid))))
            .unwrap();

        sched.tick().unwrap();
        assert_eq!(sched.handles().get(hid).unwrap().waiters, vec![a, b]);

        sched.handles_mut().resolve(hid, Value::Num(5.0));
        sched.tick().unwrap();
        assert_eq!(sched.fiber_state(a), Some(FiberState::Done));
        assert_eq!(sched.fiber_state(b), Some(FiberState::Done));

        let resumed: Vec<FiberId> = sched
            .events()
            .iter()
            .filter_map(|e| match e {
                RuntimeEvent::FiberResumed { fiber_id, .. } => Some(*fiber_id),
                _ => None,
            })
            .collect();
        assert_eq!(resumed, vec![a, b]);

        // With auto-gc off the settled handle stays until an explicit pass.
        assert_eq!(sched.stats().live_handles, 1);
        assert_eq!(sched.gc_handles(), 1);
    }

    #[test]
    fn rejected_handle_faults_the_waiter() {
        let p = program(
            vec![],
            vec![Instr::LoadVar { name: 0 }, Instr::Await, Instr::Ret],
        );
        let mut sched = scheduler(p, HostRegistry::new(), VmConfig::default());
        let hid = sched.handles_mut().create_pending().unwrap();
        let fid = sched
            .spawn(0, &[], Box::new(MemoryContext::new().with_variable("h", Value::Handle(hid))))
            .unwrap();
        sched.tick().unwrap();

        sched.handles_mut().reject(hid, ErrorValue::host("sensor offline"));
        sched.tick().unwrap();
        assert_eq!(sched.fiber_state(fid), Some(FiberState::Fault));
        let err = sched.fiber(fid).unwrap().last_error.clone().unwrap();
        assert_eq!(err.message, "sensor offline");
    }

    #[test]
    fn gc_reaps_terminal_fibers_only() {
        let p = program(vec![Value::Num(1.0)], vec![Instr::PushConst { idx: 0 }, Instr::Ret]);
        let mut sched = scheduler(p, HostRegistry::new(), VmConfig::default());
        let done = sched.spawn(0, &[], ctx()).unwrap();
        sched.tick().unwrap();
        let live = sched.spawn(0, &[], ctx()).unwrap();

        assert_eq!(sched.gc(), 1);
        assert!(sched.fiber(done).is_none());
        assert!(sched.fiber(live).is_some());
    }

    #[test]
    fn stats_count_states_and_handles() {
        let p = program(
            vec![],
            vec![Instr::LoadVar { name: 0 }, Instr::Await, Instr::Ret],
        );
        let config = VmConfig {
            auto_gc_handles: false,
            ..Default::default()
        };
        let mut sched = scheduler(p, HostRegistry::new(), config);
        let hid = sched.handles_mut().create_pending().unwrap();
        sched
            .spawn(0, &[], Box::new(MemoryContext::new().with_variable("h", Value::Handle(hid))))
            .unwrap();
        let waiting_stats_before = sched.stats();
        assert_eq!(waiting_stats_before.total, 1);
        assert_eq!(waiting_stats_before.runnable, 1);

        sched.tick().unwrap();
        let stats = sched.stats();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.live_handles, 1);
    }

    #[test]
    fn inspect_fiber_reports_position_and_wait() {
        let p = program(
            vec![],
            vec![Instr::LoadVar { name: 0 }, Instr::Await, Instr::Ret],
        );
        let mut sched = scheduler(p, HostRegistry::new(), VmConfig::default());
        let hid = sched.handles_mut().create_pending().unwrap();
        let fid = sched
            .spawn(0, &[], Box::new(MemoryContext::new().with_variable("h", Value::Handle(hid))))
            .unwrap();
        sched.tick().unwrap();

        let snap = sched.inspect_fiber(fid).unwrap();
        assert_eq!(snap.state, FiberState::Waiting);
        assert_eq!(snap.awaiting, Some(hid));
        assert_eq!(snap.frame_depth, 1);
        assert_eq!(snap.func, Some(0));
        assert!(sched.inspect_fiber(999).is_none());
    }

    #[test]
    fn run_to_completion_drives_a_fiber_to_its_end() {
        let p = program(
            vec![Value::Num(3.0)],
            vec![
                Instr::Yield,
                Instr::Yield,
                Instr::PushConst { idx: 0 },
                Instr::Ret,
            ],
        );
        let mut sched = scheduler(p, HostRegistry::new(), VmConfig::default());
        let fid = sched.spawn(0, &[], ctx()).unwrap();
        let state = sched.run_to_completion(fid, 10).unwrap();
        assert_eq!(state, FiberState::Done);
    }

    #[test]
    fn resolution_within_a_tick_reaches_other_fibers_in_the_same_pass() {
        // The resolver fiber settles the shared handle from inside its host
        // call; the already-waiting fiber resumes within the same tick.
        let mut host = HostRegistry::new();
        host.register_async(3, |ctx, _, hid, handles| {
            let Some(Value::Handle(shared)) = ctx.get_variable("h") else {
                return Err(ErrorValue::script("no shared handle"));
            };
            handles.resolve(shared, Value::Num(9.0));
            handles.resolve(hid, Value::Nil);
            Ok(())
        });
        let p = Program {
            version: BYTECODE_VERSION,
            constants: vec![],
            variable_names: vec!["h".to_string()],
            functions: vec![
                FunctionBytecode {
                    name: Some("waiter".to_string()),
                    num_params: 0,
                    code: vec![Instr::LoadVar { name: 0 }, Instr::Await, Instr::Ret],
                },
                FunctionBytecode {
                    name: Some("resolver".to_string()),
                    num_params: 0,
                    code: vec![
                        Instr::MapNew,
                        Instr::HostCallAsync {
                            func: 3,
                            call_site: 0,
                        },
                        Instr::Await,
                        Instr::Ret,
                    ],
                },
            ],
            entry_point: 0,
        };
        let mut sched = scheduler(p, host, VmConfig::default());
        let hid = sched.handles_mut().create_pending().unwrap();
        let waiter = sched
            .spawn(0, &[], Box::new(MemoryContext::new().with_variable("h", Value::Handle(hid))))
            .unwrap();
        sched.tick().unwrap();
        assert_eq!(sched.fiber_state(waiter), Some(FiberState::Waiting));

        let resolver = sched
            .spawn(1, &[], Box::new(MemoryContext::new().with_variable("h", Value::Handle(hid))))
            .unwrap();
        assert_eq!(sched.tick().unwrap(), 2);
        assert_eq!(sched.fiber_state(resolver), Some(FiberState::Done));
        assert_eq!(sched.fiber_state(waiter), Some(FiberState::Done));
    }
}
