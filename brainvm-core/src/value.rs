use crate::context::ExecutionContext;
use crate::host::TypeRegistry;
use crate::types::{ErrorValue, HandleId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

// ─── Aggregate payloads ───────────────────────────────────────

/// Opaque native payload carried by host-defined structs. Compared by
/// identity, never serialized.
#[derive(Clone)]
pub struct NativeHandle(pub Rc<dyn Any>);

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NativeHandle")
    }
}

impl PartialEq for NativeHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Key of a map entry. Numbers are stored by IEEE-754 bit pattern so keys
/// hash and compare exactly; negative zero is folded into zero.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapKey {
    Str(String),
    Num(u64),
}

impl MapKey {
    pub fn num(n: f64) -> Self {
        let n = if n == 0.0 { 0.0 } else { n };
        MapKey::Num(n.to_bits())
    }

    pub fn str(s: impl Into<String>) -> Self {
        MapKey::Str(s.into())
    }

    /// Only strings and numbers may key a map.
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Str(s) => Some(MapKey::Str(s.clone())),
            Value::Num(n) => Some(MapKey::num(*n)),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            MapKey::Num(bits) => Some(f64::from_bits(*bits)),
            MapKey::Str(_) => None,
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Str(s) => f.write_str(s),
            MapKey::Num(bits) => write!(f, "{}", f64::from_bits(*bits)),
        }
    }
}

/// Insertion-ordered, mutable list payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListValue {
    pub type_id: Option<String>,
    pub items: Vec<Value>,
}

/// Insertion-ordered, mutable map payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    pub type_id: Option<String>,
    pub entries: IndexMap<MapKey, Value>,
}

/// Named record payload with an optional native-backed part.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StructValue {
    pub type_id: Option<String>,
    pub fields: IndexMap<String, Value>,
    #[serde(skip)]
    pub native: Option<NativeHandle>,
}

// ─── Value ────────────────────────────────────────────────────

/// A runtime value. Lists, maps, and structs are shared by reference: the
/// same underlying container is observed by every holder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Unknown,
    Void,
    Nil,
    Bool(bool),
    Num(f64),
    Str(String),
    Enum { type_id: String, key: String },
    List(Rc<RefCell<ListValue>>),
    Map(Rc<RefCell<MapValue>>),
    Struct(Rc<RefCell<StructValue>>),
    Handle(HandleId),
    Err(Box<ErrorValue>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn new_list() -> Self {
        Value::List(Rc::new(RefCell::new(ListValue::default())))
    }

    pub fn new_map() -> Self {
        Value::Map(Rc::new(RefCell::new(MapValue::default())))
    }

    pub fn new_struct(type_id: Option<String>) -> Self {
        Value::Struct(Rc::new(RefCell::new(StructValue {
            type_id,
            fields: IndexMap::new(),
            native: None,
        })))
    }

    pub fn error(err: ErrorValue) -> Self {
        Value::Err(Box::new(err))
    }

    /// Short name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unknown => "unknown",
            Value::Void => "void",
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Enum { .. } => "enum",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
            Value::Handle(_) => "handle",
            Value::Err(_) => "error",
        }
    }

    /// Sentinels, false, zero, the empty string, empty aggregates, and
    /// error values are falsy; everything else (structs and handles
    /// included) is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Unknown | Value::Void | Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Enum { .. } => true,
            Value::List(l) => !l.borrow().items.is_empty(),
            Value::Map(m) => !m.borrow().entries.is_empty(),
            Value::Struct(_) => true,
            Value::Handle(_) => true,
            Value::Err(_) => false,
        }
    }

    /// Copy for assignment semantics: structs are copied recursively so a
    /// binding observes its own fields, while lists and maps stay shared
    /// and primitives clone. Struct cycles are mapped through a visited
    /// table so the copy mirrors the original's shape.
    ///
    /// Struct types registered with a `snapshot_native` hook get it invoked
    /// here to materialize lazily-resolved native payloads; hook errors
    /// propagate to the caller.
    pub fn deep_copy(
        &self,
        types: &TypeRegistry,
        ctx: &mut dyn ExecutionContext,
    ) -> Result<Value, ErrorValue> {
        let mut seen = HashMap::new();
        copy_rec(self, types, ctx, &mut seen)
    }
}

fn copy_rec(
    v: &Value,
    types: &TypeRegistry,
    ctx: &mut dyn ExecutionContext,
    seen: &mut HashMap<*const RefCell<StructValue>, Value>,
) -> Result<Value, ErrorValue> {
    let Value::Struct(rc) = v else {
        return Ok(v.clone());
    };
    let key = Rc::as_ptr(rc);
    if let Some(done) = seen.get(&key) {
        return Ok(done.clone());
    }

    let src = rc.borrow();
    let native = match src
        .type_id
        .as_deref()
        .and_then(|t| types.get(t))
        .and_then(|def| def.snapshot_native.as_ref())
    {
        Some(hook) => Some(hook(&src, ctx)?),
        None => src.native.clone(),
    };

    let copy = Rc::new(RefCell::new(StructValue {
        type_id: src.type_id.clone(),
        fields: IndexMap::new(),
        native,
    }));
    seen.insert(key, Value::Struct(copy.clone()));

    for (name, field) in src.fields.iter() {
        let copied = copy_rec(field, types, ctx, seen)?;
        copy.borrow_mut().fields.insert(name.clone(), copied);
    }
    Ok(Value::Struct(copy))
}
