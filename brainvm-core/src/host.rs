use crate::context::ExecutionContext;
use crate::handles::HandleTable;
use crate::types::{ErrorValue, FuncId, HandleId, RuleId};
use crate::value::{NativeHandle, StructValue, Value};
use std::collections::BTreeMap;

// ─── Host functions ───────────────────────────────────────────

/// A synchronous host function: takes the argument map, returns a value or
/// an error that enters the script's exception path.
pub type SyncHostFn =
    Box<dyn Fn(&mut dyn ExecutionContext, &Value) -> Result<Value, ErrorValue>>;

/// An asynchronous host function: receives a freshly allocated pending
/// handle and settles it, now or at some future time, through the handle
/// table. A returned error rejects the handle.
pub type AsyncHostFn = Box<
    dyn Fn(&mut dyn ExecutionContext, &Value, HandleId, &mut HandleTable) -> Result<(), ErrorValue>,
>;

/// Host functions callable from bytecode, keyed by numeric id. The sync
/// and async registries are disjoint; the VM never invokes one as the
/// other. The rule map associates script functions with the opaque
/// surface-language rule the host wants refreshed before each call.
#[derive(Default)]
pub struct HostRegistry {
    sync_fns: BTreeMap<u32, SyncHostFn>,
    async_fns: BTreeMap<u32, AsyncHostFn>,
    rules: BTreeMap<FuncId, RuleId>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sync(
        &mut self,
        id: u32,
        f: impl Fn(&mut dyn ExecutionContext, &Value) -> Result<Value, ErrorValue> + 'static,
    ) {
        self.sync_fns.insert(id, Box::new(f));
    }

    pub fn register_async(
        &mut self,
        id: u32,
        f: impl Fn(&mut dyn ExecutionContext, &Value, HandleId, &mut HandleTable) -> Result<(), ErrorValue>
            + 'static,
    ) {
        self.async_fns.insert(id, Box::new(f));
    }

    pub fn bind_rule(&mut self, func: FuncId, rule: RuleId) {
        self.rules.insert(func, rule);
    }

    pub fn sync_fn(&self, id: u32) -> Option<&SyncHostFn> {
        self.sync_fns.get(&id)
    }

    pub fn async_fn(&self, id: u32) -> Option<&AsyncHostFn> {
        self.async_fns.get(&id)
    }

    pub fn rule_for(&self, func: FuncId) -> Option<RuleId> {
        self.rules.get(&func).copied()
    }
}

// ─── Struct types ─────────────────────────────────────────────

/// Virtualized field read. When present it answers every GET_FIELD on the
/// type; hosts that only virtualize some fields read the field map
/// themselves for the rest.
pub type FieldGetter = Box<dyn Fn(&StructValue, &str, &mut dyn ExecutionContext) -> Value>;

/// Virtualized field write. Returns true when the hook handled the write;
/// false falls back to the plain field map.
pub type FieldSetter =
    Box<dyn Fn(&mut StructValue, &str, &Value, &mut dyn ExecutionContext) -> bool>;

/// Materializes a lazily-resolved native payload during assignment copies.
pub type NativeSnapshot =
    Box<dyn Fn(&StructValue, &mut dyn ExecutionContext) -> Result<NativeHandle, ErrorValue>>;

/// Optional behavior for a host-defined struct type.
#[derive(Default)]
pub struct StructTypeDef {
    pub field_getter: Option<FieldGetter>,
    pub field_setter: Option<FieldSetter>,
    pub snapshot_native: Option<NativeSnapshot>,
}

/// Struct type definitions keyed by type id string.
#[derive(Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, StructTypeDef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_id: impl Into<String>, def: StructTypeDef) {
        self.types.insert(type_id.into(), def);
    }

    pub fn get(&self, type_id: &str) -> Option<&StructTypeDef> {
        self.types.get(type_id)
    }
}
