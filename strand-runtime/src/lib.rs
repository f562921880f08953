//! strand runtime - lightweight threads and lifetime jobs
//!
//! This crate runs modules on lightweight threads (lthreads) built on the
//! contexts, limits and sharing rules of `strand-core`.
//!
//! - **Modules**: a manifest plus an opaque program, run by an [`Evaluator`]
//! - **LThreads**: one OS thread per evaluation, pausable at yield points
//! - **Lifetime jobs**: background lthreads bound to an owner value
//! - **Scheduler**: a single thread that keeps paused job instances moving
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use strand_core::{Context, Permission, Value};
//! use strand_runtime::{spawn_lthread, Manifest, Module, NativeEvaluator, SpawnArgs};
//!
//! let ctx = Context::root(vec![Permission::create_lthread()], vec![]).unwrap();
//! let module = Module::native("two-steps", Manifest::new(), |state, _| {
//!     state.yield_step(Value::Int(1))?;
//!     Ok(Value::Int(2))
//! });
//!
//! let lthread = spawn_lthread(SpawnArgs::new(&ctx, module, Arc::new(NativeEvaluator))).unwrap();
//! while !lthread.is_paused() && !lthread.is_done() {
//!     std::thread::yield_now();
//! }
//! lthread.resume_async().unwrap();
//! assert_eq!(lthread.wait_result().unwrap().as_int(), Some(2));
//! ```

pub mod error;
pub mod lifetime_job;
pub mod lthread;
pub mod module;
pub mod scheduler;

// Re-export main types
pub use error::{EvalError, JobError, LThreadError, Result, RuntimeError, SpawnError};
pub use lifetime_job::{LifetimeJob, ValueLifetimeJobs};
pub use lthread::{spawn_lthread, ExecutedStep, LThread, LThreadGroup, SpawnArgs, StepDecision, StepPolicy};
pub use module::{Evaluator, ExecutionState, Manifest, Module, NativeEvaluator, NativeProgram};
pub use scheduler::LifetimeJobScheduler;
