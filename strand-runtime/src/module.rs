//! Modules, evaluators and the state a module runs with
//!
//! The runtime does not know how a module is compiled or interpreted. A
//! [`Module`] carries a manifest (permissions and limits it needs) and an
//! opaque program; an [`Evaluator`] turns the program into a [`Value`].
//! [`NativeEvaluator`] runs Rust closures and is what tests and the CLI use.

use crate::error::EvalError;
use crate::lthread::LThreadInner;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use strand_core::{Context, Limit, Object, Permission, PermissionKind, Value};

/// Static requirements of a module
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub permissions: Vec<Permission>,
    pub limits: Vec<Limit>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_permission(mut self, perm: Permission) -> Self {
        self.permissions.push(perm);
        self
    }

    pub fn with_limit(mut self, limit: Limit) -> Self {
        self.limits.push(limit);
        self
    }
}

pub struct Module {
    pub name: String,
    pub manifest: Manifest,
    pub program: Arc<dyn Any + Send + Sync>,
}

impl Module {
    pub fn new(name: impl Into<String>, manifest: Manifest, program: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            name: name.into(),
            manifest,
            program,
        }
    }

    /// Module whose program is a Rust closure, run by [`NativeEvaluator`]
    pub fn native<F>(name: impl Into<String>, manifest: Manifest, program: F) -> Arc<Self>
    where
        F: Fn(&ExecutionState, Option<&Value>) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        let program: NativeProgram = Arc::new(program);
        Arc::new(Self::new(name, manifest, Arc::new(program)))
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

/// Runs a module's program
pub trait Evaluator: Send + Sync {
    fn evaluate(
        &self,
        module: &Module,
        state: &ExecutionState,
        self_value: Option<&Value>,
    ) -> Result<Value, EvalError>;
}

pub type NativeProgram =
    Arc<dyn Fn(&ExecutionState, Option<&Value>) -> Result<Value, EvalError> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeEvaluator;

impl Evaluator for NativeEvaluator {
    fn evaluate(
        &self,
        module: &Module,
        state: &ExecutionState,
        self_value: Option<&Value>,
    ) -> Result<Value, EvalError> {
        let program = module
            .program
            .downcast_ref::<NativeProgram>()
            .ok_or_else(|| EvalError::Failed(format!("module '{}' has no native program", module.name)))?;
        state.check_cancelled()?;
        program(state, self_value)
    }
}

/// What a running module sees: its context, its globals and a yield point
pub struct ExecutionState {
    ctx: Context,
    globals: Object,
    lthread: Option<Arc<LThreadInner>>,
}

impl ExecutionState {
    /// State for a direct evaluation, outside of any lthread
    pub fn new(ctx: Context, globals: Object) -> Self {
        Self {
            ctx,
            globals,
            lthread: None,
        }
    }

    pub(crate) fn for_lthread(ctx: Context, globals: Object, lthread: Arc<LThreadInner>) -> Self {
        Self {
            ctx,
            globals,
            lthread: Some(lthread),
        }
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn globals(&self) -> &Object {
        &self.globals
    }

    /// Read a global; requires the read permission on it
    pub fn global(&self, name: &str) -> Result<Option<Value>, EvalError> {
        self.ctx
            .check_permission(&Permission::global_var(PermissionKind::Read, name))?;
        Ok(self.globals.prop(&self.ctx, name)?)
    }

    pub fn check_cancelled(&self) -> Result<(), EvalError> {
        if self.ctx.is_done() {
            Err(EvalError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Record a step result and possibly pause until resumed.
    ///
    /// Outside of an lthread this only checks for cancellation.
    pub fn yield_step(&self, result: Value) -> Result<(), EvalError> {
        self.check_cancelled()?;
        match &self.lthread {
            Some(lthread) => lthread.yield_step(&self.ctx, result),
            None => Ok(()),
        }
    }
}
