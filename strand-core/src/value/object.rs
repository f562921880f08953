use super::container::{self, Container, ContainerCore};
use super::{admit, Value};
use crate::context::Context;
use crate::error::{CloneError, LockError, ValueError};
use crate::mutation::{Mutation, MutationCallbackConfig, WatchingDepth};
use crate::sharing::{share_or_clone, CloneMap, NotSharable, PotentiallySharable};
use crate::watch::{GenericWatcher, Watchable, WatcherConfig};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use strand_types::{CallbackHandle, ValueId};

pub(crate) struct ObjectInner {
    core: ContainerCore,
    props: Mutex<Vec<(String, Value)>>,
}

impl Container for ObjectInner {
    fn core(&self) -> &ContainerCore {
        &self.core
    }

    fn locate(&self, child: ValueId) -> Option<String> {
        self.props
            .lock()
            .iter()
            .find(|(_, v)| v.id() == Some(child))
            .map(|(k, _)| prop_path(k))
    }

    fn children(&self) -> Vec<Value> {
        self.props
            .lock()
            .iter()
            .filter(|(_, v)| v.as_watchable().is_some())
            .map(|(_, v)| v.clone())
            .collect()
    }
}

/// Path segment for a property, escaped like a JSON pointer (`~` as `~0`,
/// `/` as `~1`) so relocalized paths stay unambiguous
fn prop_path(name: &str) -> String {
    format!("/{}", name.replace('~', "~0").replace('/', "~1"))
}

/// Mutable record with insertion-ordered properties
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl Object {
    pub fn new() -> Self {
        Self::from_entries(Vec::new())
    }

    /// Later duplicates of a key replace earlier ones in place
    pub fn from_entries(entries: Vec<(String, Value)>) -> Self {
        let mut props: Vec<(String, Value)> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match props.iter_mut().find(|(k, _)| *k == key) {
                Some((_, slot)) => *slot = value,
                None => props.push((key, value)),
            }
        }
        Self {
            inner: Arc::new(ObjectInner {
                core: ContainerCore::new(),
                props: Mutex::new(props),
            }),
        }
    }

    pub fn id(&self) -> ValueId {
        self.inner.core.id()
    }

    pub fn len(&self) -> usize {
        self.inner.props.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Property names in insertion order
    pub fn keys(&self) -> Vec<String> {
        self.inner.props.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn entries_snapshot(&self) -> Vec<(String, Value)> {
        self.inner.props.lock().clone()
    }

    pub fn has_prop(&self, name: &str) -> bool {
        self.inner.props.lock().iter().any(|(k, _)| k == name)
    }

    pub fn prop(&self, ctx: &Context, name: &str) -> Result<Option<Value>, ValueError> {
        let _guard = self.inner.core.begin_read(ctx)?;
        Ok(self
            .inner
            .props
            .lock()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone()))
    }

    /// Add or update a property. Values stored into a shared object are
    /// shared or cloned first.
    pub fn set_prop(&self, ctx: &Context, name: &str, value: Value) -> Result<(), ValueError> {
        let core = &self.inner.core;
        let _guard = core.begin_write(ctx)?;
        let value = admit(ctx, core.is_shared(), value)?;

        let previous = {
            let mut props = self.inner.props.lock();
            match props.iter_mut().find(|(k, _)| k == name) {
                Some((_, slot)) => Some(std::mem::replace(slot, value.clone())),
                None => {
                    props.push((name.to_string(), value.clone()));
                    None
                }
            }
        };

        if let Some(old) = &previous {
            container::unwatch_child_if_absent(&self.inner, ctx, old);
        }
        container::watch_child(&self.inner, ctx, &value);

        if core.is_observed() {
            let path = prop_path(name);
            let mutation = match previous {
                Some(_) => Mutation::update_prop(name, &value, WatchingDepth::Shallow, path),
                None => Mutation::add_prop(name, &value, WatchingDepth::Shallow, path),
            };
            core.dispatch(ctx, &mutation);
        }
        Ok(())
    }

    pub fn is_shared(&self) -> bool {
        self.inner.core.is_shared()
    }

    pub fn share(&self, origin: &Context) {
        let inner = &self.inner;
        inner.core.share(origin, || {
            for (key, child) in inner.props.lock().clone() {
                if !child.is_mutable() || child.is_shared() {
                    continue;
                }
                match share_or_clone(&child, origin) {
                    Ok(shared) if !shared.same_identity(&child) => {
                        let mut props = inner.props.lock();
                        if let Some((_, slot)) = props
                            .iter_mut()
                            .find(|(k, v)| *k == key && v.same_identity(&child))
                        {
                            *slot = shared;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(object = %inner.core.id(), key = %key, error = %err, "property kept unshared");
                    }
                }
            }
        });
    }

    pub(crate) fn check_sharable(&self, origin: &Context, visited: &mut HashSet<ValueId>) -> Result<(), NotSharable> {
        if !visited.insert(self.id()) || self.is_shared() {
            return Ok(());
        }
        for (key, value) in self.entries_snapshot() {
            value
                .check_sharable(origin, visited)
                .map_err(|reason| NotSharable(format!("property '{}': {}", key, reason)))?;
        }
        Ok(())
    }

    pub(crate) fn deep_clone_with(&self, clones: &mut CloneMap) -> Result<Value, CloneError> {
        if let Some(existing) = clones.get(&self.id()) {
            return Ok(existing.clone());
        }
        let clone = Object::new();
        clones.insert(self.id(), Value::Object(clone.clone()));

        let entries = self
            .entries_snapshot()
            .into_iter()
            .map(|(k, v)| Ok((k, v.deep_clone_with(clones)?)))
            .collect::<Result<Vec<_>, CloneError>>()?;
        *clone.inner.props.lock() = entries;
        Ok(Value::Object(clone))
    }

    pub fn same_object(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Watchable for Object {
    fn on_mutation(&self, ctx: &Context, config: MutationCallbackConfig) -> Result<CallbackHandle, ValueError> {
        container::on_mutation(&self.inner, ctx, config)
    }

    fn remove_mutation_callback(&self, _ctx: &Context, handle: CallbackHandle) {
        self.inner.core.remove_callback(handle);
    }

    fn remove_mutation_callbacks(&self, _ctx: &Context) {
        self.inner.core.remove_callbacks();
    }

    fn watcher(&self, ctx: &Context, config: WatcherConfig) -> Arc<GenericWatcher> {
        container::watcher(&self.inner, ctx, config)
    }
}

impl PotentiallySharable for Object {
    fn is_sharable(&self, origin: &Context) -> Result<(), NotSharable> {
        self.check_sharable(origin, &mut HashSet::new())
    }

    fn share(&self, origin: &Context) {
        Object::share(self, origin)
    }

    fn is_shared(&self) -> bool {
        Object::is_shared(self)
    }

    fn smart_lock(&self, ctx: &Context) -> Result<(), LockError> {
        self.inner.core.smart_lock().lock(ctx)
    }

    fn smart_unlock(&self, ctx: &Context) {
        self.inner.core.smart_lock().unlock(ctx)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id())
            .field("keys", &self.keys())
            .field("shared", &self.is_shared())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;
    use crate::transaction::{start_new_readonly_transaction, start_new_transaction, TransactionOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn ctx() -> Context {
        Context::root(vec![], vec![]).unwrap()
    }

    fn recorder(depth: WatchingDepth) -> (MutationCallbackConfig, Arc<Mutex<Vec<Mutation>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config = MutationCallbackConfig::new(depth, move |_, m| {
            sink.lock().push(m.clone());
            Ok(())
        });
        (config, seen)
    }

    #[test]
    fn test_keys_keep_insertion_order_without_watchers() {
        let c = ctx();
        let o = Object::new();
        o.set_prop(&c, "a", Value::Int(1)).unwrap();
        o.set_prop(&c, "b", Value::Int(2)).unwrap();
        o.set_prop(&c, "a", Value::Int(3)).unwrap();
        assert_eq!(o.keys(), vec!["a", "b"]);
        assert_eq!(o.prop(&c, "a").unwrap().and_then(|v| v.as_int()), Some(3));
    }

    #[test]
    fn test_add_then_update_mutations() {
        let c = ctx();
        let o = Object::new();
        let (config, seen) = recorder(WatchingDepth::Shallow);
        o.on_mutation(&c, config).unwrap();

        o.set_prop(&c, "a", Value::Int(1)).unwrap();
        o.set_prop(&c, "a", Value::Int(2)).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].kind(), crate::mutation::MutationKind::AddProp);
        assert_eq!(seen[1].kind(), crate::mutation::MutationKind::UpdateProp);
        assert_eq!(seen[1].path(), "/a");
    }

    #[test]
    fn test_shallow_callbacks_do_not_see_nested_changes() {
        let c = ctx();
        let child = Object::new();
        let parent = Object::from_entries(vec![("child".to_string(), Value::Object(child.clone()))]);
        let (config, seen) = recorder(WatchingDepth::Shallow);
        parent.on_mutation(&c, config).unwrap();

        child.set_prop(&c, "x", Value::Int(1)).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_intermediate_depth_forwards_child_mutations() {
        let c = ctx();
        let child = Object::new();
        let grandchild = Object::new();
        child.set_prop(&c, "g", Value::Object(grandchild.clone())).unwrap();
        let parent = Object::from_entries(vec![("child".to_string(), Value::Object(child.clone()))]);

        let (config, seen) = recorder(WatchingDepth::Intermediate);
        parent.on_mutation(&c, config).unwrap();

        child.set_prop(&c, "x", Value::Int(1)).unwrap();
        grandchild.set_prop(&c, "y", Value::Int(2)).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path(), "/child/x");
        assert_eq!(seen[0].depth(), WatchingDepth::Intermediate);
    }

    #[test]
    fn test_keys_with_slashes_are_escaped_in_paths() {
        let c = ctx();
        let child = Object::new();
        let parent = Object::from_entries(vec![("a/b".to_string(), Value::Object(child.clone()))]);

        let (config, seen) = recorder(WatchingDepth::Intermediate);
        parent.on_mutation(&c, config).unwrap();

        child.set_prop(&c, "c", Value::Int(1)).unwrap();
        parent.set_prop(&c, "x~y", Value::Int(2)).unwrap();

        let seen = seen.lock();
        assert_eq!(seen[0].path(), "/a~1b/c");
        assert_eq!(seen[1].path(), "/x~0y");
    }

    #[test]
    fn test_deep_depth_reaches_grandchildren_and_new_children() {
        let c = ctx();
        let grandchild = Object::new();
        let child = Object::from_entries(vec![("g".to_string(), Value::Object(grandchild.clone()))]);
        let parent = Object::from_entries(vec![("child".to_string(), Value::Object(child))]);

        let (config, seen) = recorder(WatchingDepth::Deep);
        parent.on_mutation(&c, config).unwrap();

        grandchild.set_prop(&c, "y", Value::Int(2)).unwrap();
        let late = Object::new();
        parent.set_prop(&c, "late", Value::Object(late.clone())).unwrap();
        late.set_prop(&c, "z", Value::Int(3)).unwrap();

        let paths: Vec<String> = seen.lock().iter().map(|m| m.path().to_string()).collect();
        assert_eq!(paths, vec!["/child/g/y", "/late", "/late/z"]);
    }

    #[test]
    fn test_replaced_child_stops_forwarding() {
        let c = ctx();
        let old = Object::new();
        let parent = Object::from_entries(vec![("child".to_string(), Value::Object(old.clone()))]);
        let (config, seen) = recorder(WatchingDepth::Deep);
        parent.on_mutation(&c, config).unwrap();

        parent.set_prop(&c, "child", Value::Int(0)).unwrap();
        old.set_prop(&c, "x", Value::Int(1)).unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_cyclic_deep_watch_terminates() {
        let c = ctx();
        let a = Object::new();
        let b = Object::new();
        a.set_prop(&c, "b", Value::Object(b.clone())).unwrap();
        b.set_prop(&c, "a", Value::Object(a.clone())).unwrap();
        a.set_prop(&c, "me", Value::Object(a.clone())).unwrap();

        let (config, seen) = recorder(WatchingDepth::Deep);
        a.on_mutation(&c, config).unwrap();
        b.set_prop(&c, "x", Value::Int(1)).unwrap();
        a.set_prop(&c, "y", Value::Int(1)).unwrap();

        let paths: Vec<String> = seen.lock().iter().map(|m| m.path().to_string()).collect();
        assert_eq!(paths, vec!["/b/x", "/y"]);
    }

    #[test]
    fn test_removed_callback_is_not_called() {
        let c = ctx();
        let o = Object::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = o
            .on_mutation(
                &c,
                MutationCallbackConfig::new(WatchingDepth::Shallow, move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        o.set_prop(&c, "a", Value::Int(1)).unwrap();
        o.remove_mutation_callback(&c, handle);
        o.set_prop(&c, "a", Value::Int(2)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribing_callback() {
        let c = ctx();
        let o = Object::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        o.on_mutation(
            &c,
            MutationCallbackConfig::new(WatchingDepth::Shallow, move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CallbackError::Unsubscribe)
            }),
        )
        .unwrap();
        o.set_prop(&c, "a", Value::Int(1)).unwrap();
        o.set_prop(&c, "a", Value::Int(2)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watcher_sees_set_prop() {
        use crate::watch::Watcher;
        let c = ctx();
        let o = Object::new();
        let watcher = o.watcher(&c, WatcherConfig::default());
        o.set_prop(&c, "a", Value::Int(1)).unwrap();
        let m = watcher.wait_next(&c, None, Duration::from_millis(100)).unwrap();
        assert_eq!(m.path(), "/a");
    }

    #[test]
    fn test_write_in_readonly_transaction_fails() {
        let c = ctx();
        let o = Object::new();
        let tx = start_new_readonly_transaction(&c).unwrap();
        assert!(matches!(
            o.set_prop(&c, "a", Value::Int(1)),
            Err(ValueError::MutationInReadonlyTransaction)
        ));
        assert!(o.prop(&c, "a").unwrap().is_none());
        tx.commit().unwrap();
        o.set_prop(&c, "a", Value::Int(1)).unwrap();
    }

    #[test]
    fn test_shared_object_isolates_readers_from_writer() {
        let writer_ctx = ctx();
        let o = Object::new();
        o.share(&writer_ctx);

        let tx = start_new_transaction(&writer_ctx, TransactionOptions::default()).unwrap();
        o.set_prop(&writer_ctx, "a", Value::Int(1)).unwrap();

        let reader = o.clone();
        let handle = thread::spawn(move || {
            let reader_ctx = ctx();
            reader.prop(&reader_ctx, "a").map(|v| v.and_then(|v| v.as_int()))
        });
        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());
        tx.commit().unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), Some(1));
    }

    #[test]
    fn test_values_stored_in_shared_object_are_shared() {
        let c = ctx();
        let o = Object::new();
        o.share(&c);
        let child = Object::new();
        o.set_prop(&c, "child", Value::Object(child.clone())).unwrap();
        assert!(child.is_shared());
    }

    #[test]
    fn test_deep_clone_of_cycle_points_to_clone() {
        let c = ctx();
        let o = Object::new();
        o.set_prop(&c, "me", Value::Object(o.clone())).unwrap();
        o.set_prop(&c, "n", Value::Int(4)).unwrap();

        let cloned = Value::Object(o.clone()).deep_clone().unwrap();
        let cloned = cloned.as_object().unwrap();
        assert!(!cloned.same_object(&o));
        let me = cloned.prop(&c, "me").unwrap().unwrap();
        assert!(me.as_object().unwrap().same_object(cloned));
    }
}
