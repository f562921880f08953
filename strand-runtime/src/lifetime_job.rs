//! Lifetime jobs: background work bound to the life of an owner value
//!
//! A [`LifetimeJob`] pairs immutable metadata with a module. Each owner
//! value gets a [`ValueLifetimeJobs`] set; instantiating it spawns one
//! paused lthread per job with the owner as `self`, and registers the
//! instances with the [`LifetimeJobScheduler`] that keeps them running.

use crate::error::JobError;
use crate::lthread::{spawn_lthread, LThread, SpawnArgs};
use crate::module::{Evaluator, Module};
use crate::scheduler::LifetimeJobScheduler;
use parking_lot::Mutex;
use std::sync::Arc;
use strand_core::{Context, Permission, Value};
use strand_types::JobsId;

#[derive(Clone)]
pub struct LifetimeJob {
    meta: Value,
    module: Arc<Module>,
    evaluator: Arc<dyn Evaluator>,
}

impl LifetimeJob {
    pub fn new(meta: Value, module: Arc<Module>, evaluator: Arc<dyn Evaluator>) -> Result<Self, JobError> {
        if meta.is_mutable() {
            return Err(JobError::MetaMustBeImmutable(meta.type_name()));
        }
        Ok(Self {
            meta,
            module,
            evaluator,
        })
    }

    pub fn meta(&self) -> &Value {
        &self.meta
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Spawn the job paused, with `owner` as its self value
    pub fn instantiate(&self, ctx: &Context, owner: &Value) -> Result<LThread, JobError> {
        ctx.check_permission(&Permission::create_lthread())?;
        let args = SpawnArgs::new(ctx, self.module.clone(), self.evaluator.clone())
            .with_self(owner.clone())
            .start_paused(true);
        Ok(spawn_lthread(args)?)
    }
}

impl std::fmt::Debug for LifetimeJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifetimeJob")
            .field("meta", &self.meta)
            .field("module", &self.module.name)
            .finish()
    }
}

/// The lifetime jobs of one owner value
pub struct ValueLifetimeJobs {
    id: JobsId,
    owner: Value,
    jobs: Vec<LifetimeJob>,
    instances: Mutex<Vec<LThread>>,
    scheduler: LifetimeJobScheduler,
}

impl ValueLifetimeJobs {
    pub fn new(owner: Value, jobs: Vec<LifetimeJob>) -> Self {
        Self::with_scheduler(owner, jobs, LifetimeJobScheduler::global().clone())
    }

    pub fn with_scheduler(owner: Value, jobs: Vec<LifetimeJob>, scheduler: LifetimeJobScheduler) -> Self {
        Self {
            id: JobsId::next(),
            owner,
            jobs,
            instances: Mutex::new(Vec::new()),
            scheduler,
        }
    }

    pub fn id(&self) -> JobsId {
        self.id
    }

    pub fn owner(&self) -> &Value {
        &self.owner
    }

    /// Spawn one lthread per job and hand them to the scheduler.
    ///
    /// If one job fails to start, the instances already spawned are
    /// cancelled.
    pub fn instantiate_lthreads(&self, ctx: &Context) -> Result<(), JobError> {
        let mut spawned = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            match job.instantiate(ctx, &self.owner) {
                Ok(lthread) => spawned.push(lthread),
                Err(err) => {
                    for lthread in &spawned {
                        lthread.cancel();
                    }
                    return Err(err);
                }
            }
        }

        tracing::debug!(jobs = %self.id, count = spawned.len(), "lifetime jobs instantiated");
        self.scheduler.register(self.id, spawned.clone());
        self.instances.lock().extend(spawned);
        Ok(())
    }

    pub fn instances(&self) -> Vec<LThread> {
        self.instances.lock().clone()
    }

    /// Unregister from the scheduler and cancel every instance
    pub fn teardown(&self) {
        self.scheduler.unregister(self.id);
        for lthread in self.instances.lock().drain(..) {
            lthread.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Manifest, NativeEvaluator};
    use strand_core::Object;

    fn job(meta: Value) -> Result<LifetimeJob, JobError> {
        let module = Module::native("job", Manifest::new(), |_, _| Ok(Value::Nil));
        LifetimeJob::new(meta, module, Arc::new(NativeEvaluator))
    }

    #[test]
    fn test_mutable_meta_is_rejected() {
        assert!(matches!(
            job(Value::Object(Object::new())),
            Err(JobError::MetaMustBeImmutable("object"))
        ));
        assert!(job(Value::from("name")).is_ok());
    }

    #[test]
    fn test_instantiate_requires_permission() {
        let ctx = Context::root(vec![], vec![]).unwrap();
        let job = job(Value::Nil).unwrap();
        assert!(matches!(
            job.instantiate(&ctx, &Value::Object(Object::new())),
            Err(JobError::Permission(_))
        ));
    }

    #[test]
    fn test_instance_starts_paused_with_owner() {
        let ctx = Context::root(vec![Permission::create_lthread()], vec![]).unwrap();
        let module = Module::native("echo-owner", Manifest::new(), |_, owner| {
            Ok(owner.cloned().unwrap_or_default())
        });
        let job = LifetimeJob::new(Value::Nil, module, Arc::new(NativeEvaluator)).unwrap();
        let owner = Value::Object(Object::new());

        let lthread = job.instantiate(&ctx, &owner).unwrap();
        assert!(lthread.is_paused());
        assert!(!lthread.has_started());
        lthread.resume_async().unwrap();
        assert!(lthread.wait_result().unwrap().same_identity(&owner));
        assert!(owner.is_shared());
    }
}
