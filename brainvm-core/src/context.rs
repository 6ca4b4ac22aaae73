use crate::types::{CallSiteId, FiberId, RuleId};
use crate::value::Value;
use std::collections::BTreeMap;

/// Per-fiber environment owned by the host and consumed by the VM.
///
/// The VM reads and writes variables exclusively through this trait and
/// makes no assumption about the scoping strategy behind it: a host with a
/// scope chain overrides `resolve_variable`/`set_resolved_variable`, a flat
/// host keeps the defaults. The VM writes the fiber id on spawn and the
/// call-site id and rule before every host call; the two clocks are purely
/// informational and are read by host functions, never by the VM itself.
pub trait ExecutionContext {
    fn get_variable(&self, name: &str) -> Option<Value>;
    fn set_variable(&mut self, name: &str, value: Value);
    fn clear_variable(&mut self, name: &str);

    /// Custom scoping hook; defaults to the flat lookup.
    fn resolve_variable(&self, name: &str) -> Option<Value> {
        self.get_variable(name)
    }

    /// Custom scoping hook; defaults to the flat write.
    fn set_resolved_variable(&mut self, name: &str, value: Value) {
        self.set_variable(name, value)
    }

    fn set_fiber_id(&mut self, fiber: FiberId);
    fn fiber_id(&self) -> Option<FiberId>;

    fn set_call_site(&mut self, site: CallSiteId);
    fn current_call_site(&self) -> Option<CallSiteId>;

    fn set_current_rule(&mut self, rule: Option<RuleId>);
    fn current_rule(&self) -> Option<RuleId>;

    fn time(&self) -> f64 {
        0.0
    }

    fn current_tick(&self) -> u64 {
        0
    }
}

/// Flat in-memory context, the reference implementation used by tests and
/// simple embedders.
#[derive(Debug, Default)]
pub struct MemoryContext {
    variables: BTreeMap<String, Value>,
    fiber_id: Option<FiberId>,
    call_site: Option<CallSiteId>,
    rule: Option<RuleId>,
    pub time: f64,
    pub tick: u64,
}

impl MemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a variable, e.g. to expose spawn arguments to the fiber.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }
}

impl ExecutionContext for MemoryContext {
    fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).cloned()
    }

    fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    fn clear_variable(&mut self, name: &str) {
        self.variables.remove(name);
    }

    fn set_fiber_id(&mut self, fiber: FiberId) {
        self.fiber_id = Some(fiber);
    }

    fn fiber_id(&self) -> Option<FiberId> {
        self.fiber_id
    }

    fn set_call_site(&mut self, site: CallSiteId) {
        self.call_site = Some(site);
    }

    fn current_call_site(&self) -> Option<CallSiteId> {
        self.call_site
    }

    fn set_current_rule(&mut self, rule: Option<RuleId>) {
        self.rule = rule;
    }

    fn current_rule(&self) -> Option<RuleId> {
        self.rule
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn current_tick(&self) -> u64 {
        self.tick
    }
}
