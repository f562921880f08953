//! Stress the runtime: lthreads incrementing one shared counter.

use anyhow::{anyhow, Context as _, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use strand_core::{
    start_new_transaction, Context, Object, Permission, PermissionKind, TransactionOptions, Value,
    ValueHistory,
};
use strand_runtime::{
    spawn_lthread, EvalError, LThreadGroup, Manifest, Module, NativeEvaluator, SpawnArgs,
};

pub struct StressOptions {
    pub threads: usize,
    pub increments: usize,
    pub history: usize,
    pub json: bool,
}

#[derive(Serialize)]
struct StressSummary {
    threads: usize,
    increments: usize,
    final_count: i64,
    history_length: usize,
    elapsed_ms: u128,
}

fn counter_module(increments: usize) -> Arc<Module> {
    let manifest = Manifest::new().with_permission(Permission::global_var(PermissionKind::Read, "counter"));
    Module::native("increment-counter", manifest, move |state, _| {
        let counter = state
            .global("counter")?
            .ok_or_else(|| EvalError::Failed("missing global 'counter'".into()))?;
        let counter = counter
            .as_object()
            .ok_or_else(|| EvalError::Failed("'counter' is not an object".into()))?;

        for _ in 0..increments {
            let tx = start_new_transaction(state.ctx(), TransactionOptions::default())
                .map_err(|err| EvalError::Failed(err.to_string()))?;
            let n = counter
                .prop(state.ctx(), "n")?
                .and_then(|v| v.as_int())
                .unwrap_or(0);
            counter.set_prop(state.ctx(), "n", Value::Int(n + 1))?;
            tx.commit().map_err(|err| EvalError::Failed(err.to_string()))?;
            state.yield_step(Value::Int(n + 1))?;
        }
        Ok(Value::Nil)
    })
}

pub fn run_stress(opts: StressOptions) -> Result<()> {
    let ctx = Context::root(
        vec![
            Permission::create_lthread(),
            Permission::global_var(PermissionKind::Read, "counter"),
        ],
        vec![],
    )?;

    let counter = Object::from_entries(vec![("n".to_string(), Value::Int(0))]);
    let history = ValueHistory::with_max_length(&ctx, &Value::Object(counter.clone()), opts.history)
        .context("Failed to watch the counter")?;

    let started = Instant::now();
    let module = counter_module(opts.increments);
    let group = LThreadGroup::new();
    for _ in 0..opts.threads {
        let args = SpawnArgs::new(&ctx, module.clone(), Arc::new(NativeEvaluator))
            .with_global("counter", Value::Object(counter.clone()))
            .pause_after_yield(false);
        group.add(spawn_lthread(args).context("Failed to spawn lthread")?);
    }
    group
        .wait_all_results()
        .map_err(|err| anyhow!("lthread failed: {}", err))?;

    let final_count = counter
        .prop(&ctx, "n")?
        .and_then(|v| v.as_int())
        .unwrap_or_default();
    let summary = StressSummary {
        threads: opts.threads,
        increments: opts.increments,
        final_count,
        history_length: history.change_count(),
        elapsed_ms: started.elapsed().as_millis(),
    };
    history.stop(&ctx);
    ctx.cancel_gracefully();

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Stress complete: {} lthreads x {} increments in {}ms",
            summary.threads, summary.increments, summary.elapsed_ms
        );
        println!("final count: {}", summary.final_count);
        println!("history length: {}", summary.history_length);
    }
    Ok(())
}
