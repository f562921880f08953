//! Integration tests for lthreads and their groups

use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strand_core::limit::THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME;
use strand_core::{
    start_new_transaction, Context, Limit, LimitError, Object, Permission, PermissionKind,
    TransactionOptions, Value,
};
use strand_runtime::{
    spawn_lthread, EvalError, LThread, LThreadError, LThreadGroup, Manifest, Module,
    NativeEvaluator, SpawnArgs, SpawnError,
};

fn spawner(limits: Vec<Limit>) -> Context {
    Context::root(
        vec![
            Permission::create_lthread(),
            Permission::global_var(PermissionKind::Read, "*"),
        ],
        limits,
    )
    .unwrap()
}

fn args(ctx: &Context, module: Arc<Module>) -> SpawnArgs {
    SpawnArgs::new(ctx, module, Arc::new(NativeEvaluator))
}

fn wait_until(what: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !what() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_start_paused_until_resumed() {
    let ctx = spawner(vec![]);
    let module = Module::native("answer", Manifest::new(), |_, _| Ok(Value::Int(42)));
    let lthread = spawn_lthread(args(&ctx, module).start_paused(true)).unwrap();

    thread::sleep(Duration::from_millis(30));
    assert!(lthread.is_paused());
    assert!(!lthread.is_done());

    lthread.resume_async().unwrap();
    assert_eq!(lthread.wait_result().unwrap().as_int(), Some(42));
    assert!(lthread.is_done());

    // Cached, never blocks again
    assert_eq!(lthread.wait_result().unwrap().as_int(), Some(42));
    assert_eq!(lthread.wait_result().unwrap().as_int(), Some(42));
}

#[test]
fn test_resume_when_not_paused_is_dropped() {
    let ctx = spawner(vec![]);
    let module = Module::native("yield-once", Manifest::new(), |state, _| {
        state.ctx().sleep(Duration::from_millis(30)).map_err(|_| EvalError::Cancelled)?;
        state.yield_step(Value::Nil)?;
        Ok(Value::Int(1))
    });
    let lthread = spawn_lthread(args(&ctx, module)).unwrap();

    // Running, so this resume is lost
    lthread.resume_async().unwrap();
    wait_until(|| lthread.is_paused());
    thread::sleep(Duration::from_millis(20));
    assert!(lthread.is_paused());

    lthread.resume_async().unwrap();
    assert_eq!(lthread.wait_result().unwrap().as_int(), Some(1));
}

#[test]
fn test_cancel_while_paused() {
    let ctx = spawner(vec![]);
    let module = Module::native("forever", Manifest::new(), |state, _| loop {
        state.yield_step(Value::Nil)?;
    });
    let lthread = spawn_lthread(args(&ctx, module)).unwrap();
    wait_until(|| lthread.is_paused());

    lthread.cancel();
    assert!(matches!(lthread.wait_result(), Err(LThreadError::Cancelled)));
    assert!(lthread.is_done());
    assert!(!lthread.is_paused());
}

#[test]
fn test_cancelling_spawner_ends_lthread() {
    let root = spawner(vec![]);
    let ctx = root.bound_child().unwrap();
    let module = Module::native("forever", Manifest::new(), |state, _| loop {
        state.yield_step(Value::Nil)?;
    });
    let lthread = spawn_lthread(args(&ctx, module)).unwrap();
    wait_until(|| lthread.is_paused());

    root.cancel_gracefully();
    assert!(matches!(lthread.wait_result(), Err(LThreadError::Cancelled)));
}

#[test]
fn test_instance_limit_is_shared_and_given_back() {
    let ctx = spawner(vec![Limit::total(THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME, 1)]);
    let blocking = Module::native("blocking", Manifest::new(), |state, _| {
        state.yield_step(Value::Nil)?;
        Ok(Value::Nil)
    });

    let first = spawn_lthread(args(&ctx, blocking.clone())).unwrap();
    assert!(matches!(
        spawn_lthread(args(&ctx, blocking.clone())),
        Err(SpawnError::Limit(LimitError::Exhausted { .. }))
    ));

    wait_until(|| first.is_paused());
    first.resume_async().unwrap();
    first.wait_result().unwrap();

    let second = spawn_lthread(args(&ctx, blocking).pause_after_yield(false)).unwrap();
    second.wait_result().unwrap();
}

#[test]
fn test_globals_are_shared_with_the_lthread() {
    let ctx = spawner(vec![]);
    let counter = Object::from_entries(vec![("n".to_string(), Value::Int(0))]);
    let module = Module::native("inc", Manifest::new(), |state, _| {
        let counter = state
            .global("counter")?
            .ok_or_else(|| EvalError::Failed("missing global".into()))?;
        let counter = counter
            .as_object()
            .ok_or_else(|| EvalError::Failed("counter must be an object".into()))?;
        let n = counter.prop(state.ctx(), "n")?.and_then(|v| v.as_int()).unwrap_or(0);
        counter.set_prop(state.ctx(), "n", Value::Int(n + 1))?;
        Ok(Value::Int(n + 1))
    });

    let lthread = spawn_lthread(
        args(&ctx, module).with_global("counter", Value::Object(counter.clone())),
    )
    .unwrap();
    assert_eq!(lthread.wait_result().unwrap().as_int(), Some(1));
    assert!(counter.is_shared());
    assert_eq!(counter.prop(&ctx, "n").unwrap().and_then(|v| v.as_int()), Some(1));
}

#[test]
fn test_group_of_transactional_incrementers() {
    let ctx = spawner(vec![]);
    let counter = Object::from_entries(vec![("n".to_string(), Value::Int(0))]);
    let module = Module::native("tx-inc", Manifest::new(), |state, _| {
        let counter = state
            .global("counter")?
            .ok_or_else(|| EvalError::Failed("missing global".into()))?;
        let counter = counter
            .as_object()
            .ok_or_else(|| EvalError::Failed("counter must be an object".into()))?
            .clone();
        for _ in 0..10 {
            let tx = start_new_transaction(state.ctx(), TransactionOptions::default())
                .map_err(|err| EvalError::Failed(err.to_string()))?;
            let n = counter.prop(state.ctx(), "n")?.and_then(|v| v.as_int()).unwrap_or(0);
            counter.set_prop(state.ctx(), "n", Value::Int(n + 1))?;
            tx.commit().map_err(|err| EvalError::Failed(err.to_string()))?;
            state.yield_step(Value::Int(n + 1))?;
        }
        Ok(Value::Nil)
    });

    let group = LThreadGroup::new();
    for _ in 0..4 {
        let lthread = spawn_lthread(
            args(&ctx, module.clone())
                .with_global("counter", Value::Object(counter.clone()))
                .pause_after_yield(false),
        )
        .unwrap();
        group.add(lthread);
    }
    assert_eq!(group.len(), 4);

    let results = group.wait_all_results().unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(counter.prop(&ctx, "n").unwrap().and_then(|v| v.as_int()), Some(40));
}

#[test]
fn test_group_cancel_all() {
    let ctx = spawner(vec![]);
    let module = Module::native("forever", Manifest::new(), |state, _| loop {
        state.yield_step(Value::Nil)?;
    });
    let group = LThreadGroup::new();
    let threads: Vec<LThread> = (0..3)
        .map(|_| spawn_lthread(args(&ctx, module.clone())).unwrap())
        .collect();
    for lthread in &threads {
        group.add(lthread.clone());
    }

    group.cancel_all();
    assert!(matches!(group.wait_all_results(), Err(LThreadError::Cancelled)));
    assert!(threads.iter().all(LThread::is_done));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_group_results_follow_insertion_order(values in prop::collection::vec(any::<i64>(), 1..6)) {
        let ctx = spawner(vec![]);
        let group = LThreadGroup::new();
        for value in &values {
            let value = *value;
            let module = Module::native("const", Manifest::new(), move |_, _| Ok(Value::Int(value)));
            group.add(spawn_lthread(args(&ctx, module)).unwrap());
        }
        let results: Vec<i64> = group
            .wait_all_results()
            .unwrap()
            .iter()
            .filter_map(Value::as_int)
            .collect();
        prop_assert_eq!(results, values);
    }
}
