//! Bounded replay log of a watched value
//!
//! A [`ValueHistory`] keeps a serialized baseline and the shallow
//! mutations observed since. Past states are rebuilt by replaying changes
//! on a fresh copy of the baseline. Once the log holds `max_length`
//! changes, the oldest one is folded into the baseline.

use crate::config;
use crate::context::Context;
use crate::error::{CallbackError, HistoryError, ValueError};
use crate::mutation::{Change, MutationCallbackConfig, WatchingDepth};
use crate::value::{repr, Value};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use strand_types::CallbackHandle;

struct HistoryState {
    baseline: Vec<u8>,
    baseline_date: DateTime<Utc>,
    changes: Vec<Change>,
    selected: Option<DateTime<Utc>>,
}

struct HistoryInner {
    value: Value,
    max_length: usize,
    // Replays run on fresh, unshared copies; a private context keeps them
    // independent of the caller's transaction.
    replay_ctx: Context,
    handle: Mutex<Option<CallbackHandle>>,
    state: Mutex<HistoryState>,
}

impl HistoryInner {
    fn with_change_applied(&self, snapshot: &[u8], change: &Change) -> Result<Vec<u8>, HistoryError> {
        let value = repr::decode(snapshot)?;
        change.mutation.apply_to(&self.replay_ctx, &value)?;
        Ok(repr::encode(&value)?)
    }

    fn fold_oldest(&self, state: &mut HistoryState) -> Result<(), HistoryError> {
        if state.changes.is_empty() {
            return Ok(());
        }
        let oldest = state.changes.remove(0);
        state.baseline = self.with_change_applied(&state.baseline, &oldest)?;
        state.baseline_date = oldest.date;
        Ok(())
    }

    fn record(&self, change: Change) -> Result<(), HistoryError> {
        let mut state = self.state.lock();
        if !change.mutation.is_complete() {
            // Not replayable: restart from the current state, or stop
            // recording if that state cannot be serialized either
            let baseline = match repr::encode(&self.value) {
                Ok(baseline) => baseline,
                Err(err) => {
                    self.handle.lock().take();
                    tracing::warn!(error = %err, "history stopped, value is no longer serializable");
                    return Err(err.into());
                }
            };
            state.changes.clear();
            state.baseline_date = change.date;
            state.baseline = baseline;
            return Ok(());
        }
        while state.changes.len() >= self.max_length {
            self.fold_oldest(&mut state)?;
        }
        state.changes.push(change);
        Ok(())
    }
}

#[derive(Clone)]
pub struct ValueHistory {
    inner: Arc<HistoryInner>,
}

impl ValueHistory {
    pub fn new(ctx: &Context, value: &Value) -> Result<Self, HistoryError> {
        Self::with_max_length(ctx, value, config::current().history.default_max_length)
    }

    pub fn with_max_length(ctx: &Context, value: &Value, max_length: usize) -> Result<Self, HistoryError> {
        let watchable = value.as_watchable().ok_or(ValueError::NotWatchable)?;
        let baseline = repr::encode(value)?;

        let inner = Arc::new(HistoryInner {
            value: value.clone(),
            max_length: max_length.max(1),
            replay_ctx: Context::root(vec![], vec![])?,
            handle: Mutex::new(None),
            state: Mutex::new(HistoryState {
                baseline,
                baseline_date: Utc::now(),
                changes: Vec::new(),
                selected: None,
            }),
        });

        let history: Weak<HistoryInner> = Arc::downgrade(&inner);
        let handle = watchable.on_mutation(
            ctx,
            MutationCallbackConfig::new(WatchingDepth::Shallow, move |_, mutation| {
                let history = history.upgrade().ok_or(CallbackError::Unsubscribe)?;
                history
                    .record(Change::now(mutation.clone()))
                    .map_err(|err| CallbackError::Failed(err.to_string()))
            }),
        )?;
        *inner.handle.lock() = Some(handle);

        Ok(Self { inner })
    }

    pub fn value(&self) -> &Value {
        &self.inner.value
    }

    pub fn change_count(&self) -> usize {
        self.inner.state.lock().changes.len()
    }

    pub fn changes(&self) -> Vec<Change> {
        self.inner.state.lock().changes.clone()
    }

    /// State of the value at `date`. Dates before the baseline yield the
    /// baseline.
    pub fn value_at(&self, date: DateTime<Utc>) -> Result<Value, HistoryError> {
        let (baseline, changes) = {
            let state = self.inner.state.lock();
            let changes: Vec<Change> = state
                .changes
                .iter()
                .take_while(|c| c.date <= date)
                .cloned()
                .collect();
            (state.baseline.clone(), changes)
        };
        let value = repr::decode(&baseline)?;
        for change in &changes {
            change.mutation.apply_to(&self.inner.replay_ctx, &value)?;
        }
        Ok(value)
    }

    pub fn last_value(&self) -> Result<Value, HistoryError> {
        self.value_at(DateTime::<Utc>::MAX_UTC)
    }

    /// Fold every change older than `date` into the baseline
    pub fn forget_changes_before_date(&self, date: DateTime<Utc>) -> Result<(), HistoryError> {
        let mut state = self.inner.state.lock();
        while state.changes.first().is_some_and(|c| c.date < date) {
            self.inner.fold_oldest(&mut state)?;
        }
        Ok(())
    }

    pub fn forget_last(&self) {
        self.inner.state.lock().changes.pop();
    }

    pub fn select_date(&self, date: DateTime<Utc>) {
        self.inner.state.lock().selected = Some(date);
    }

    pub fn selected_date(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().selected
    }

    pub fn value_at_selection(&self) -> Result<Value, HistoryError> {
        let date = self.selected_date().ok_or(HistoryError::NoSelectedDate)?;
        self.value_at(date)
    }

    /// Stop recording; idempotent
    pub fn stop(&self, ctx: &Context) {
        if let Some(handle) = self.inner.handle.lock().take() {
            if let Some(watchable) = self.inner.value.as_watchable() {
                watchable.remove_mutation_callback(ctx, handle);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.handle.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Mutation;
    use crate::value::{repr::to_repr, HostHandle, List, Object};
    use std::thread;
    use std::time::Duration;

    fn ctx() -> Context {
        Context::root(vec![], vec![]).unwrap()
    }

    fn prop(value: &Value, name: &str) -> Option<i64> {
        value
            .as_object()
            .and_then(|o| o.entries_snapshot().into_iter().find(|(k, _)| k == name))
            .and_then(|(_, v)| v.as_int())
    }

    fn tick() -> DateTime<Utc> {
        thread::sleep(Duration::from_millis(2));
        let now = Utc::now();
        thread::sleep(Duration::from_millis(2));
        now
    }

    #[test]
    fn test_value_at_replays_changes() {
        let c = ctx();
        let o = Object::from_entries(vec![("n".to_string(), Value::Int(0))]);
        let history = ValueHistory::new(&c, &Value::Object(o.clone())).unwrap();

        let t0 = tick();
        o.set_prop(&c, "n", Value::Int(1)).unwrap();
        let t1 = tick();
        o.set_prop(&c, "n", Value::Int(2)).unwrap();

        assert_eq!(prop(&history.value_at(t0).unwrap(), "n"), Some(0));
        assert_eq!(prop(&history.value_at(t1).unwrap(), "n"), Some(1));
        assert_eq!(prop(&history.last_value().unwrap(), "n"), Some(2));
        assert_eq!(history.change_count(), 2);
    }

    #[test]
    fn test_oldest_change_is_folded_at_max_length() {
        let c = ctx();
        let list = List::new();
        let value = Value::List(list.clone());
        let history = ValueHistory::with_max_length(&c, &value, 3).unwrap();

        for i in 0..5 {
            list.push(&c, Value::Int(i)).unwrap();
        }
        assert_eq!(history.change_count(), 3);

        // The baseline now holds the two folded pushes
        let earliest = history.value_at(DateTime::<Utc>::MIN_UTC).unwrap();
        assert_eq!(earliest.as_list().unwrap().len(), 2);
        assert_eq!(to_repr(&history.last_value().unwrap()).unwrap(), to_repr(&value).unwrap());
    }

    #[test]
    fn test_forget_and_selection() {
        let c = ctx();
        let o = Object::new();
        let history = ValueHistory::new(&c, &Value::Object(o.clone())).unwrap();

        o.set_prop(&c, "a", Value::Int(1)).unwrap();
        let t1 = tick();
        o.set_prop(&c, "b", Value::Int(2)).unwrap();
        o.set_prop(&c, "c", Value::Int(3)).unwrap();

        history.forget_changes_before_date(t1).unwrap();
        assert_eq!(history.change_count(), 2);
        history.forget_last();
        assert_eq!(history.change_count(), 1);

        assert!(matches!(history.value_at_selection(), Err(HistoryError::NoSelectedDate)));
        history.select_date(t1);
        let selected = history.value_at_selection().unwrap();
        assert_eq!(selected.as_object().unwrap().keys(), vec!["a"]);
        assert_eq!(history.last_value().unwrap().as_object().unwrap().keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_stop_ends_recording() {
        let c = ctx();
        let o = Object::new();
        let history = ValueHistory::new(&c, &Value::Object(o.clone())).unwrap();
        history.stop(&c);
        history.stop(&c);
        o.set_prop(&c, "a", Value::Int(1)).unwrap();
        assert_eq!(history.change_count(), 0);
        assert!(history.is_stopped());
    }

    #[test]
    fn test_incomplete_mutation_resets_baseline() {
        let c = ctx();
        let o = Object::from_entries(vec![("n".to_string(), Value::Int(0))]);
        let history = ValueHistory::new(&c, &Value::Object(o.clone())).unwrap();
        o.set_prop(&c, "n", Value::Int(1)).unwrap();

        o.set_prop(&c, "n", Value::Int(2)).unwrap();
        history
            .inner
            .record(Change::now(Mutation::unspecified(WatchingDepth::Shallow, "")))
            .unwrap();
        assert_eq!(history.change_count(), 0);
        assert_eq!(prop(&history.last_value().unwrap(), "n"), Some(2));
        assert!(!history.is_stopped());
    }

    #[test]
    fn test_unserializable_value_stops_recording() {
        let c = ctx();
        let o = Object::from_entries(vec![("n".to_string(), Value::Int(0))]);
        let history = ValueHistory::new(&c, &Value::Object(o.clone())).unwrap();
        o.set_prop(&c, "n", Value::Int(1)).unwrap();

        o.set_prop(&c, "h", Value::Handle(HostHandle::new("file"))).unwrap();
        assert!(history.is_stopped());
        assert_eq!(history.change_count(), 1);
        assert_eq!(prop(&history.last_value().unwrap(), "n"), Some(1));

        o.set_prop(&c, "n", Value::Int(5)).unwrap();
        assert_eq!(history.change_count(), 1);
        history.stop(&c);
    }

    #[test]
    fn test_immutable_value_is_rejected() {
        assert!(matches!(
            ValueHistory::new(&ctx(), &Value::Int(1)),
            Err(HistoryError::Value(ValueError::NotWatchable))
        ));
    }
}
