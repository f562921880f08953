//! Watchable values and blocking watchers
//!
//! Callbacks registered with [`Watchable::on_mutation`] run synchronously
//! on the mutating thread. Watchers are the pull-based counterpart: each
//! one buffers mutations in a bounded channel and lets an observer block
//! in [`Watcher::wait_next`] until a matching mutation arrives.

use crate::config;
use crate::context::Context;
use crate::error::{ValueError, WatchError};
use crate::mutation::{Mutation, MutationCallbackConfig, WatchingDepth};
use crossbeam::channel::{self, Receiver, Select, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use strand_types::CallbackHandle;

pub type MutationFilter = Arc<dyn Fn(&Mutation) -> bool + Send + Sync>;

/// A value that reports its mutations
pub trait Watchable: Send + Sync {
    fn on_mutation(
        &self,
        ctx: &Context,
        config: MutationCallbackConfig,
    ) -> Result<CallbackHandle, ValueError>;

    fn remove_mutation_callback(&self, ctx: &Context, handle: CallbackHandle);

    fn remove_mutation_callbacks(&self, ctx: &Context);

    fn watcher(&self, ctx: &Context, config: WatcherConfig) -> Arc<GenericWatcher>;
}

#[derive(Clone, Default)]
pub struct WatcherConfig {
    pub filter: Option<MutationFilter>,
    pub depth: WatchingDepth,
}

impl WatcherConfig {
    pub fn with_depth(depth: WatchingDepth) -> Self {
        Self {
            filter: None,
            depth,
        }
    }

    pub fn filter(mut self, filter: impl Fn(&Mutation) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }
}

pub trait Watcher: Send + Sync {
    /// Block until a mutation accepted by the watcher's own filter and by
    /// `filter` arrives, the timeout elapses, or the watcher stops.
    fn wait_next(
        &self,
        ctx: &Context,
        filter: Option<&MutationFilter>,
        timeout: Duration,
    ) -> Result<Mutation, WatchError>;

    /// Idempotent
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

fn accepts(filter: Option<&MutationFilter>, mutation: &Mutation) -> bool {
    filter.map_or(true, |f| f(mutation))
}

pub struct GenericWatcher {
    config: WatcherConfig,
    sender: Mutex<Option<Sender<Mutation>>>,
    receiver: Receiver<Mutation>,
    stopped: AtomicBool,
}

impl GenericWatcher {
    pub fn new(config: WatcherConfig) -> Arc<Self> {
        Self::with_capacity(config, config::current().watchers.channel_capacity)
    }

    pub fn with_capacity(config: WatcherConfig, capacity: usize) -> Arc<Self> {
        let (sender, receiver) = channel::bounded(capacity.max(1));
        Arc::new(Self {
            config,
            sender: Mutex::new(Some(sender)),
            receiver,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn depth(&self) -> WatchingDepth {
        self.config.depth
    }

    /// Queue `mutation` if it passes the depth and filter checks. Returns
    /// false once the watcher is stopped.
    pub fn inform(&self, mutation: &Mutation) -> bool {
        if self.is_stopped() {
            return false;
        }
        let depth = self.config.depth.or_shallow();
        if mutation.depth().is_specified() && depth < mutation.depth() {
            return true;
        }
        if !accepts(self.config.filter.as_ref(), mutation) {
            return true;
        }
        if let Some(sender) = self.sender.lock().as_ref() {
            if sender.try_send(mutation.clone()).is_err() {
                tracing::debug!(path = mutation.path(), "watcher queue full, mutation dropped");
            }
        }
        true
    }

    fn receive(&self, mutation: Result<Mutation, channel::RecvError>) -> Result<Mutation, WatchError> {
        match mutation {
            Ok(mutation) if !self.is_stopped() => Ok(mutation),
            _ => Err(WatchError::Stopped),
        }
    }
}

impl Watcher for GenericWatcher {
    fn wait_next(
        &self,
        ctx: &Context,
        filter: Option<&MutationFilter>,
        timeout: Duration,
    ) -> Result<Mutation, WatchError> {
        if self.is_stopped() {
            return Err(WatchError::Stopped);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let mutation = crossbeam::select! {
                recv(self.receiver) -> mutation => self.receive(mutation)?,
                recv(ctx.done()) -> _ => return Err(WatchError::ContextDone),
                recv(channel::at(deadline)) -> _ => return Err(WatchError::Timeout),
            };
            if accepts(filter, &mutation) {
                return Ok(mutation);
            }
        }
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.sender.lock().take();
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// A watcher that is stopped from the start
#[derive(Debug, Default, Clone, Copy)]
pub struct StoppedWatcher;

impl Watcher for StoppedWatcher {
    fn wait_next(&self, _: &Context, _: Option<&MutationFilter>, _: Duration) -> Result<Mutation, WatchError> {
        Err(WatchError::Stopped)
    }

    fn stop(&self) {}

    fn is_stopped(&self) -> bool {
        true
    }
}

/// Waits on several watchers at once; stopping it stops every member
pub struct JoinedWatchers {
    watchers: Vec<Arc<GenericWatcher>>,
}

impl JoinedWatchers {
    pub fn new(watchers: Vec<Arc<GenericWatcher>>) -> Self {
        Self { watchers }
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }
}

impl Watcher for JoinedWatchers {
    fn wait_next(
        &self,
        ctx: &Context,
        filter: Option<&MutationFilter>,
        timeout: Duration,
    ) -> Result<Mutation, WatchError> {
        if self.is_stopped() {
            return Err(WatchError::Stopped);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let mut select = Select::new();
            for watcher in &self.watchers {
                select.recv(&watcher.receiver);
            }
            let done_index = select.recv(ctx.done());

            let remaining = deadline.saturating_duration_since(Instant::now());
            let operation = select
                .select_timeout(remaining)
                .map_err(|_| WatchError::Timeout)?;
            let index = operation.index();
            if index == done_index {
                let _ = operation.recv(ctx.done());
                return Err(WatchError::ContextDone);
            }

            let watcher = &self.watchers[index];
            let mutation = watcher.receive(operation.recv(&watcher.receiver))?;
            if accepts(filter, &mutation) {
                return Ok(mutation);
            }
        }
    }

    fn stop(&self) {
        for watcher in &self.watchers {
            watcher.stop();
        }
    }

    fn is_stopped(&self) -> bool {
        self.watchers.iter().all(|w| w.is_stopped())
    }
}

/// Per-value fan-out list. Holds watchers weakly so that dropping the
/// last handle to a watcher unregisters it.
#[derive(Default)]
pub struct ValueWatchers {
    watchers: Mutex<Vec<Weak<GenericWatcher>>>,
}

impl ValueWatchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, watcher: &Arc<GenericWatcher>) {
        self.watchers.lock().push(Arc::downgrade(watcher));
    }

    pub fn len(&self) -> usize {
        self.watchers.lock().iter().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inform(&self, mutation: &Mutation) {
        let live: Vec<Arc<GenericWatcher>> = {
            let mut watchers = self.watchers.lock();
            watchers.retain(|w| w.upgrade().is_some_and(|w| !w.is_stopped()));
            watchers.iter().filter_map(Weak::upgrade).collect()
        };
        for watcher in live {
            watcher.inform(mutation);
        }
    }

    pub fn stop_all(&self) {
        let watchers = std::mem::take(&mut *self.watchers.lock());
        for watcher in watchers.iter().filter_map(Weak::upgrade) {
            watcher.stop();
        }
    }
}
