//! The value model
//!
//! Immutable values (`Nil`, booleans, numbers, strings) are plain data.
//! `Object` and `List` are reference-counted mutable containers with a
//! stable [`ValueId`], an embedded smart lock and mutation observers.
//! `Handle` wraps a host resource that never leaves its thread.

mod container;
mod handle;
mod list;
mod object;
pub mod repr;

pub use handle::HostHandle;
pub use list::List;
pub use object::Object;

use crate::context::Context;
use crate::error::{CloneError, ValueError};
use crate::sharing::{share_or_clone, CloneMap, NotSharable};
use crate::watch::Watchable;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use strand_types::ValueId;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Object(Object),
    List(List),
    Handle(HostHandle),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::List(_) => "list",
            Value::Handle(_) => "host-handle",
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self, Value::Object(_) | Value::List(_) | Value::Handle(_))
    }

    /// Identity of mutable values
    pub fn id(&self) -> Option<ValueId> {
        match self {
            Value::Object(o) => Some(o.id()),
            Value::List(l) => Some(l.id()),
            Value::Handle(h) => Some(h.id()),
            _ => None,
        }
    }

    /// Mutable values compare by identity, immutable ones by content
    pub fn same_identity(&self, other: &Value) -> bool {
        match (self.id(), other.id()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => match (self, other) {
                (Value::Nil, Value::Nil) => true,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (Value::Int(a), Value::Int(b)) => a == b,
                (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
                (Value::Str(a), Value::Str(b)) => a == b,
                _ => false,
            },
            _ => false,
        }
    }

    pub fn is_shared(&self) -> bool {
        match self {
            Value::Object(o) => o.is_shared(),
            Value::List(l) => l.is_shared(),
            _ => false,
        }
    }

    pub fn share(&self, origin: &Context) {
        match self {
            Value::Object(o) => o.share(origin),
            Value::List(l) => l.share(origin),
            _ => {}
        }
    }

    /// Cycle-safe sharability check; `visited` holds containers already seen
    pub fn check_sharable(&self, origin: &Context, visited: &mut HashSet<ValueId>) -> Result<(), NotSharable> {
        match self {
            Value::Object(o) => o.check_sharable(origin, visited),
            Value::List(l) => l.check_sharable(origin, visited),
            Value::Handle(h) => Err(NotSharable(format!("{} cannot be shared", h))),
            _ => Ok(()),
        }
    }

    pub fn deep_clone(&self) -> Result<Value, CloneError> {
        self.deep_clone_with(&mut CloneMap::new())
    }

    /// Clone mutable containers recursively. `clones` maps already cloned
    /// originals to their copies so cycles are reproduced on the copy.
    pub fn deep_clone_with(&self, clones: &mut CloneMap) -> Result<Value, CloneError> {
        match self {
            Value::Object(o) => o.deep_clone_with(clones),
            Value::List(l) => l.deep_clone_with(clones),
            Value::Handle(h) => Err(CloneError::NotClonable(h.to_string())),
            other => Ok(other.clone()),
        }
    }

    pub fn as_watchable(&self) -> Option<&dyn Watchable> {
        match self {
            Value::Object(o) => Some(o),
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }
}

/// Prepare `value` for storage in a container; a shared container only
/// holds immutable or shared values.
pub(crate) fn admit(ctx: &Context, shared: bool, value: Value) -> Result<Value, ValueError> {
    if shared {
        Ok(share_or_clone(&value, ctx)?)
    } else {
        Ok(value)
    }
}

// Containers print shallowly so cyclic values format fine
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Object(o) => fmt::Debug::fmt(o, f),
            Value::List(l) => fmt::Debug::fmt(l, f),
            Value::Handle(h) => fmt::Debug::fmt(h, f),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl From<List> for Value {
    fn from(l: List) -> Self {
        Value::List(l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutability_and_identity() {
        assert!(!Value::from(1i64).is_mutable());
        assert!(Value::Object(Object::new()).is_mutable());
        assert!(Value::Handle(HostHandle::new("h")).is_mutable());

        let o = Value::Object(Object::new());
        assert!(o.same_identity(&o.clone()));
        assert!(!o.same_identity(&Value::Object(Object::new())));
        assert!(Value::from("a").same_identity(&Value::from("a")));
        assert!(!Value::Int(1).same_identity(&Value::Float(1.0)));
    }

    #[test]
    fn test_handle_is_neither_sharable_nor_clonable() {
        let ctx = Context::root(vec![], vec![]).unwrap();
        let h = Value::Handle(HostHandle::new("socket"));
        assert!(h.check_sharable(&ctx, &mut HashSet::new()).is_err());
        assert!(matches!(h.deep_clone(), Err(CloneError::NotClonable(_))));
    }

    #[test]
    fn test_deep_clone_preserves_diamonds() {
        let shared = List::from_values(vec![Value::Int(1)]);
        let o = Object::from_entries(vec![
            ("a".to_string(), Value::List(shared.clone())),
            ("b".to_string(), Value::List(shared)),
        ]);
        let cloned = Value::Object(o).deep_clone().unwrap();
        let entries = cloned.as_object().unwrap().entries_snapshot();
        assert!(entries[0].1.same_identity(&entries[1].1));
    }

    #[test]
    fn test_debug_of_cycle_terminates() {
        let ctx = Context::root(vec![], vec![]).unwrap();
        let o = Object::new();
        o.set_prop(&ctx, "me", Value::Object(o.clone())).unwrap();
        let text = format!("{:?}", Value::Object(o));
        assert!(text.contains("me"));
    }
}
