//! Mutations: immutable, replayable descriptions of container changes
//!
//! A [`Mutation`] is created at the moment a container changes and handed
//! to callbacks, watchers and histories. Its operands (key or index, new
//! value or sequence) are serialized with the value codec; if any operand
//! cannot be serialized the mutation is still reported but marked
//! incomplete and cannot be applied.

mod callbacks;

pub use callbacks::{MutationCallbackConfig, MutationCallbackFn, MutationCallbacks};

use crate::context::Context;
use crate::error::MutationError;
use crate::value::{repr, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Maximum number of operands carried by one mutation
pub const MAX_OPERANDS: usize = 6;

/// How far into nested values mutation observation recurses
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum WatchingDepth {
    #[default]
    Unspecified,
    Shallow,
    Intermediate,
    Deep,
}

impl WatchingDepth {
    pub fn is_specified(self) -> bool {
        self != WatchingDepth::Unspecified
    }

    /// Depth used to watch the children of a container watched at `self`
    pub fn minus_one(self) -> Option<WatchingDepth> {
        match self {
            WatchingDepth::Intermediate => Some(WatchingDepth::Shallow),
            WatchingDepth::Deep => Some(WatchingDepth::Deep),
            _ => None,
        }
    }

    /// Raise by `levels`, saturating at `Deep`
    pub fn plus(self, levels: usize) -> WatchingDepth {
        match (self as usize).saturating_add(levels) {
            0 => WatchingDepth::Unspecified,
            1 => WatchingDepth::Shallow,
            2 => WatchingDepth::Intermediate,
            _ => WatchingDepth::Deep,
        }
    }

    /// `Unspecified` is treated as `Shallow` when subscribing
    pub fn or_shallow(self) -> WatchingDepth {
        if self.is_specified() {
            self
        } else {
            WatchingDepth::Shallow
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Unspecified,
    AddProp,
    UpdateProp,
    SetElemAtIndex,
    InsertElemAtIndex,
    InsertSequenceAtIndex,
    RemovePosition,
    RemovePositionRange,
    SpecificMutation,
}

impl MutationKind {
    pub fn name(self) -> &'static str {
        match self {
            MutationKind::Unspecified => "unspecified",
            MutationKind::AddProp => "add-prop",
            MutationKind::UpdateProp => "update-prop",
            MutationKind::SetElemAtIndex => "set-elem-at-index",
            MutationKind::InsertElemAtIndex => "insert-elem-at-index",
            MutationKind::InsertSequenceAtIndex => "insert-seq-at-index",
            MutationKind::RemovePosition => "remove-pos",
            MutationKind::RemovePositionRange => "remove-pos-range",
            MutationKind::SpecificMutation => "specific",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies a container-specific mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificMutationMetadata {
    pub version: u8,
    pub kind: String,
}

#[derive(Clone, PartialEq)]
pub struct Mutation {
    kind: MutationKind,
    complete: bool,
    specific: Option<SpecificMutationMetadata>,
    data: Arc<[u8]>,
    operand_lengths: Vec<usize>,
    path: String,
    depth: WatchingDepth,
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("kind", &self.kind)
            .field("complete", &self.complete)
            .field("path", &self.path)
            .field("depth", &self.depth)
            .field("operands", &self.operand_lengths.len())
            .finish()
    }
}

impl Mutation {
    fn with_operands(
        kind: MutationKind,
        operands: &[Value],
        depth: WatchingDepth,
        path: impl Into<String>,
    ) -> Self {
        debug_assert!(operands.len() <= MAX_OPERANDS);
        let mut data = Vec::new();
        let mut operand_lengths = Vec::with_capacity(operands.len());
        let mut complete = true;

        for operand in operands.iter().take(MAX_OPERANDS) {
            match repr::encode(operand) {
                Ok(bytes) => {
                    operand_lengths.push(bytes.len());
                    data.extend_from_slice(&bytes);
                }
                Err(err) => {
                    tracing::debug!(kind = %kind, error = %err, "mutation operand not serializable");
                    complete = false;
                    break;
                }
            }
        }
        if !complete {
            data.clear();
            operand_lengths.clear();
        }

        Self {
            kind,
            complete,
            specific: None,
            data: data.into(),
            operand_lengths,
            path: path.into(),
            depth,
        }
    }

    /// A change with no replayable payload
    pub fn unspecified(depth: WatchingDepth, path: impl Into<String>) -> Self {
        Self {
            kind: MutationKind::Unspecified,
            complete: false,
            specific: None,
            data: Arc::from(Vec::new()),
            operand_lengths: Vec::new(),
            path: path.into(),
            depth,
        }
    }

    pub fn add_prop(name: &str, value: &Value, depth: WatchingDepth, path: impl Into<String>) -> Self {
        Self::with_operands(MutationKind::AddProp, &[Value::from(name), value.clone()], depth, path)
    }

    pub fn update_prop(name: &str, value: &Value, depth: WatchingDepth, path: impl Into<String>) -> Self {
        Self::with_operands(MutationKind::UpdateProp, &[Value::from(name), value.clone()], depth, path)
    }

    pub fn set_elem_at_index(index: usize, value: &Value, depth: WatchingDepth, path: impl Into<String>) -> Self {
        Self::with_operands(
            MutationKind::SetElemAtIndex,
            &[Value::Int(index as i64), value.clone()],
            depth,
            path,
        )
    }

    pub fn insert_elem_at_index(index: usize, value: &Value, depth: WatchingDepth, path: impl Into<String>) -> Self {
        Self::with_operands(
            MutationKind::InsertElemAtIndex,
            &[Value::Int(index as i64), value.clone()],
            depth,
            path,
        )
    }

    /// `sequence` is encoded as one list operand
    pub fn insert_sequence_at_index(
        index: usize,
        sequence: &[Value],
        depth: WatchingDepth,
        path: impl Into<String>,
    ) -> Self {
        let seq = Value::List(crate::value::List::from_values(sequence.to_vec()));
        Self::with_operands(
            MutationKind::InsertSequenceAtIndex,
            &[Value::Int(index as i64), seq],
            depth,
            path,
        )
    }

    pub fn remove_position(index: usize, depth: WatchingDepth, path: impl Into<String>) -> Self {
        Self::with_operands(MutationKind::RemovePosition, &[Value::Int(index as i64)], depth, path)
    }

    /// Removal of the half-open range `start..end`
    pub fn remove_position_range(start: usize, end: usize, depth: WatchingDepth, path: impl Into<String>) -> Self {
        Self::with_operands(
            MutationKind::RemovePositionRange,
            &[Value::Int(start as i64), Value::Int(end as i64)],
            depth,
            path,
        )
    }

    pub fn specific(
        metadata: SpecificMutationMetadata,
        operands: &[Value],
        depth: WatchingDepth,
        path: impl Into<String>,
    ) -> Self {
        let mut mutation = Self::with_operands(MutationKind::SpecificMutation, operands, depth, path);
        mutation.specific = Some(metadata);
        mutation
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn specific_metadata(&self) -> Option<&SpecificMutationMetadata> {
        self.specific.as_ref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn depth(&self) -> WatchingDepth {
        self.depth
    }

    pub fn operand_count(&self) -> usize {
        self.operand_lengths.len()
    }

    pub fn operand_bytes(&self, index: usize) -> Option<&[u8]> {
        let len = *self.operand_lengths.get(index)?;
        let start: usize = self.operand_lengths[..index].iter().sum();
        self.data.get(start..start + len)
    }

    /// Decode operand `index` into a fresh value
    pub fn operand(&self, index: usize) -> Result<Value, MutationError> {
        let bytes = self.operand_bytes(index).ok_or_else(|| MutationError::InvalidOperand {
            index,
            reason: "missing".to_string(),
        })?;
        Ok(repr::decode(bytes)?)
    }

    fn index_operand(&self, index: usize) -> Result<usize, MutationError> {
        match self.operand(index)? {
            Value::Int(i) if i >= 0 => Ok(i as usize),
            other => Err(MutationError::InvalidOperand {
                index,
                reason: format!("expected an index, got {}", other.type_name()),
            }),
        }
    }

    fn name_operand(&self, index: usize) -> Result<String, MutationError> {
        match self.operand(index)? {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(MutationError::InvalidOperand {
                index,
                reason: format!("expected a property name, got {}", other.type_name()),
            }),
        }
    }

    /// The same mutation seen from a container `parent_path` levels above
    pub fn relocalized(&self, parent_path: &str) -> Mutation {
        let levels = parent_path.matches('/').count();
        let mut relocalized = self.clone();
        relocalized.path = format!("{}{}", parent_path, self.path);
        relocalized.depth = self.depth.plus(levels);
        relocalized
    }

    /// Replay this mutation on `target`
    pub fn apply_to(&self, ctx: &Context, target: &Value) -> Result<(), MutationError> {
        if !self.complete {
            return Err(MutationError::Incomplete);
        }
        let mismatch = || MutationError::TargetMismatch {
            kind: self.kind.to_string(),
            target: target.type_name().to_string(),
        };

        match self.kind {
            MutationKind::AddProp | MutationKind::UpdateProp => {
                let object = target.as_object().ok_or_else(mismatch)?;
                object.set_prop(ctx, &self.name_operand(0)?, self.operand(1)?)?;
            }
            MutationKind::SetElemAtIndex => {
                let list = target.as_list().ok_or_else(mismatch)?;
                list.set(ctx, self.index_operand(0)?, self.operand(1)?)?;
            }
            MutationKind::InsertElemAtIndex => {
                let list = target.as_list().ok_or_else(mismatch)?;
                list.insert(ctx, self.index_operand(0)?, self.operand(1)?)?;
            }
            MutationKind::InsertSequenceAtIndex => {
                let list = target.as_list().ok_or_else(mismatch)?;
                let sequence = match self.operand(1)? {
                    Value::List(seq) => seq.values_snapshot(),
                    other => {
                        return Err(MutationError::InvalidOperand {
                            index: 1,
                            reason: format!("expected a sequence, got {}", other.type_name()),
                        })
                    }
                };
                list.insert_sequence(ctx, self.index_operand(0)?, sequence)?;
            }
            MutationKind::RemovePosition => {
                let list = target.as_list().ok_or_else(mismatch)?;
                list.remove(ctx, self.index_operand(0)?)?;
            }
            MutationKind::RemovePositionRange => {
                let list = target.as_list().ok_or_else(mismatch)?;
                list.remove_range(ctx, self.index_operand(0)?..self.index_operand(1)?)?;
            }
            MutationKind::SpecificMutation => {
                return Err(MutationError::UnsupportedSpecificMutation(
                    target.type_name().to_string(),
                ));
            }
            MutationKind::Unspecified => return Err(MutationError::Incomplete),
        }
        Ok(())
    }
}

/// A mutation and the moment it happened
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub mutation: Mutation,
    pub date: DateTime<Utc>,
}

impl Change {
    pub fn new(mutation: Mutation, date: DateTime<Utc>) -> Self {
        Self { mutation, date }
    }

    pub fn now(mutation: Mutation) -> Self {
        Self::new(mutation, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{HostHandle, List, Object};
    use proptest::prelude::*;

    fn ctx() -> Context {
        Context::root(vec![], vec![]).unwrap()
    }

    #[test]
    fn test_depth_order() {
        assert!(WatchingDepth::Unspecified < WatchingDepth::Shallow);
        assert!(WatchingDepth::Shallow < WatchingDepth::Intermediate);
        assert!(WatchingDepth::Intermediate < WatchingDepth::Deep);
    }

    #[test]
    fn test_depth_minus_one() {
        assert_eq!(WatchingDepth::Intermediate.minus_one(), Some(WatchingDepth::Shallow));
        assert_eq!(WatchingDepth::Deep.minus_one(), Some(WatchingDepth::Deep));
        assert_eq!(WatchingDepth::Shallow.minus_one(), None);
        assert_eq!(WatchingDepth::Unspecified.minus_one(), None);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(MutationKind::AddProp.to_string(), "add-prop");
        assert_eq!(MutationKind::InsertSequenceAtIndex.to_string(), "insert-seq-at-index");
    }

    #[test]
    fn test_operands_round_trip() {
        let m = Mutation::update_prop("count", &Value::Int(3), WatchingDepth::Shallow, "/count");
        assert!(m.is_complete());
        assert_eq!(m.operand_count(), 2);
        assert!(matches!(m.operand(0).unwrap(), Value::Str(s) if &*s == "count"));
        assert!(matches!(m.operand(1).unwrap(), Value::Int(3)));
    }

    #[test]
    fn test_unserializable_operand_is_incomplete() {
        let handle = Value::Handle(HostHandle::new("socket"));
        let m = Mutation::add_prop("h", &handle, WatchingDepth::Shallow, "/h");
        assert!(!m.is_complete());
        assert_eq!(m.kind(), MutationKind::AddProp);
        assert_eq!(m.path(), "/h");

        let target = Value::Object(Object::new());
        assert!(matches!(m.apply_to(&ctx(), &target), Err(MutationError::Incomplete)));
    }

    #[test]
    fn test_relocalized() {
        let m = Mutation::update_prop("x", &Value::Int(1), WatchingDepth::Shallow, "/x");
        let r = m.relocalized("/child");
        assert_eq!(r.path(), "/child/x");
        assert_eq!(r.depth(), WatchingDepth::Intermediate);

        let rr = r.relocalized("/a/b");
        assert_eq!(rr.path(), "/a/b/child/x");
        assert_eq!(rr.depth(), WatchingDepth::Deep);
    }

    #[test]
    fn test_apply_to_wrong_target() {
        let m = Mutation::remove_position(0, WatchingDepth::Shallow, "/0");
        let err = m.apply_to(&ctx(), &Value::Object(Object::new())).unwrap_err();
        assert!(matches!(err, MutationError::TargetMismatch { .. }));
    }

    #[test]
    fn test_apply_sequence_mutations() {
        let ctx = ctx();
        let list = List::from_values(vec![Value::Int(1), Value::Int(4)]);
        let target = Value::List(list.clone());

        Mutation::insert_sequence_at_index(1, &[Value::Int(2), Value::Int(3)], WatchingDepth::Shallow, "/1")
            .apply_to(&ctx, &target)
            .unwrap();
        Mutation::remove_position_range(0, 1, WatchingDepth::Shallow, "/0")
            .apply_to(&ctx, &target)
            .unwrap();
        Mutation::set_elem_at_index(2, &Value::Int(40), WatchingDepth::Shallow, "/2")
            .apply_to(&ctx, &target)
            .unwrap();

        let ints: Vec<i64> = list
            .values_snapshot()
            .into_iter()
            .filter_map(|v| v.as_int())
            .collect();
        assert_eq!(ints, vec![2, 3, 40]);
    }

    proptest! {
        #[test]
        fn prop_relocalized_depth_never_exceeds_deep(levels in 0usize..10, segments in 0usize..5) {
            let m = Mutation::unspecified(WatchingDepth::Shallow.plus(levels), "/x");
            let prefix: String = (0..segments).map(|i| format!("/k{}", i)).collect();
            let r = m.relocalized(&prefix);
            prop_assert!(r.depth() <= WatchingDepth::Deep);
            prop_assert!(r.depth() >= m.depth());
            prop_assert_eq!(r.path().len(), prefix.len() + 2);
        }
    }
}
