//! JSON representation of values
//!
//! Used to snapshot mutation operands and history baselines. Host handles
//! and cyclic values have no representation. Decoding always produces
//! fresh, unshared containers.

use super::{List, Object, Value};
use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use strand_types::ValueId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum Repr {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Object(Vec<(String, Repr)>),
    List(Vec<Repr>),
}

pub fn to_repr(value: &Value) -> Result<Repr, CodecError> {
    to_repr_inner(value, &mut HashSet::new())
}

// `ancestors` holds the containers on the current path only, so shared
// (diamond) children are fine and only true cycles fail.
fn to_repr_inner(value: &Value, ancestors: &mut HashSet<ValueId>) -> Result<Repr, CodecError> {
    Ok(match value {
        Value::Nil => Repr::Nil,
        Value::Bool(b) => Repr::Bool(*b),
        Value::Int(i) => Repr::Int(*i),
        Value::Float(f) => Repr::Float(*f),
        Value::Str(s) => Repr::Str(s.to_string()),
        Value::Handle(handle) => {
            return Err(CodecError::NotSerializable(handle.to_string()));
        }
        Value::Object(object) => {
            if !ancestors.insert(object.id()) {
                return Err(CodecError::Cyclic);
            }
            let entries = object
                .entries_snapshot()
                .into_iter()
                .map(|(k, v)| Ok((k, to_repr_inner(&v, ancestors)?)))
                .collect::<Result<Vec<_>, CodecError>>();
            ancestors.remove(&object.id());
            Repr::Object(entries?)
        }
        Value::List(list) => {
            if !ancestors.insert(list.id()) {
                return Err(CodecError::Cyclic);
            }
            let elements = list
                .values_snapshot()
                .iter()
                .map(|v| to_repr_inner(v, ancestors))
                .collect::<Result<Vec<_>, CodecError>>();
            ancestors.remove(&list.id());
            Repr::List(elements?)
        }
    })
}

impl Repr {
    /// Build a fresh value from this representation
    pub fn instantiate(&self) -> Value {
        match self {
            Repr::Nil => Value::Nil,
            Repr::Bool(b) => Value::Bool(*b),
            Repr::Int(i) => Value::Int(*i),
            Repr::Float(f) => Value::Float(*f),
            Repr::Str(s) => Value::from(s.as_str()),
            Repr::Object(entries) => Value::Object(Object::from_entries(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.instantiate()))
                    .collect(),
            )),
            Repr::List(elements) => {
                Value::List(List::from_values(elements.iter().map(Repr::instantiate).collect()))
            }
        }
    }
}

pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(&to_repr(value)?)?)
}

pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let repr: Repr = serde_json::from_slice(bytes)?;
    Ok(repr.instantiate())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::value::HostHandle;

    #[test]
    fn test_nested_round_trip() {
        let value = Value::Object(Object::from_entries(vec![
            ("name".to_string(), Value::from("strand")),
            (
                "tags".to_string(),
                Value::List(List::from_values(vec![Value::Int(1), Value::Float(2.5), Value::Nil])),
            ),
            ("ok".to_string(), Value::Bool(true)),
        ]));
        let bytes = encode(&value).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(to_repr(&decoded).unwrap(), to_repr(&value).unwrap());
        assert!(!decoded.same_identity(&value));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let shared = Value::List(List::from_values(vec![Value::Int(7)]));
        let value = Value::Object(Object::from_entries(vec![
            ("a".to_string(), shared.clone()),
            ("b".to_string(), shared),
        ]));
        assert!(encode(&value).is_ok());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let ctx = Context::root(vec![], vec![]).unwrap();
        let object = Object::new();
        object.set_prop(&ctx, "me", Value::Object(object.clone())).unwrap();
        assert!(matches!(encode(&Value::Object(object)), Err(CodecError::Cyclic)));
    }

    #[test]
    fn test_handle_is_not_serializable() {
        let err = encode(&Value::Handle(HostHandle::new("db"))).unwrap_err();
        assert!(matches!(err, CodecError::NotSerializable(_)));
    }
}
