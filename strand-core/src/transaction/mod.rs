//! Transactions
//!
//! A [`Transaction`] collects reversible effects, resources and end
//! callbacks, and is bound to exactly one [`Context`] while it runs.
//!
//! Lifecycle: created → started → finishing → finished (committed or
//! rolled back). A watchdog rolls the transaction back when its context is
//! cancelled or when the timeout elapses.
//!
//! While finishing, every method fails with [`TransactionError::Finishing`];
//! once finished, with [`TransactionError::Finished`].

mod isolation;

pub use isolation::TransactionIsolator;

use crate::config;
use crate::context::{panic_message, Context};
use crate::error::TransactionError;
use crate::resource::ResourceHolder;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strand_types::TransactionId;

/// Whether an effect can be undone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reversibility {
    Reversible,
    Irreversible,
}

/// A deferred side effect, applied on commit and reversed on rollback
pub trait Effect: Send + Sync + fmt::Debug {
    fn reversibility(&self) -> Reversibility;

    fn apply(&self, ctx: &Context) -> Result<(), String>;

    fn reverse(&self, ctx: &Context) -> Result<(), String>;
}

/// Called once with `true` on commit and `false` on rollback
pub type EndCallback = Box<dyn FnOnce(&Transaction, bool) -> Result<(), String> + Send>;

#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub readonly: bool,
    /// Defaults to the configured transaction timeout (20s)
    pub timeout: Option<Duration>,
}

impl TransactionOptions {
    pub fn readonly() -> Self {
        Self {
            readonly: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

#[derive(Default)]
struct TxState {
    started: bool,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    effects: Vec<Arc<dyn Effect>>,
    end_callbacks: Vec<(String, EndCallback)>,
    resources: Vec<String>,
    outcome: Option<TransactionOutcome>,
}

pub struct Transaction {
    id: TransactionId,
    readonly: bool,
    timeout: Duration,
    ctx: Context,
    state: Mutex<TxState>,
    finishing: AtomicBool,
    finished: AtomicBool,
    finished_tx: Mutex<Option<Sender<()>>>,
    finished_rx: Receiver<()>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("readonly", &self.readonly)
            .field("finishing", &self.is_finishing())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Create and start a write transaction bound to `ctx`
pub fn start_new_transaction(
    ctx: &Context,
    options: TransactionOptions,
) -> Result<Arc<Transaction>, TransactionError> {
    let tx = Transaction::new(ctx, options);
    tx.start()?;
    Ok(tx)
}

/// Create and start a readonly transaction bound to `ctx`
pub fn start_new_readonly_transaction(ctx: &Context) -> Result<Arc<Transaction>, TransactionError> {
    start_new_transaction(ctx, TransactionOptions::readonly())
}

impl Transaction {
    pub fn new(ctx: &Context, options: TransactionOptions) -> Arc<Self> {
        let (finished_tx, finished_rx) = channel::bounded(0);
        Arc::new(Self {
            id: TransactionId::new(),
            readonly: options.readonly,
            timeout: options
                .timeout
                .unwrap_or_else(|| config::current().transaction_timeout()),
            ctx: ctx.clone(),
            state: Mutex::new(TxState::default()),
            finishing: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            finished_tx: Mutex::new(Some(finished_tx)),
            finished_rx,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::Acquire) && !self.is_finished()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().end_time
    }

    pub fn outcome(&self) -> Option<TransactionOutcome> {
        self.state.lock().outcome
    }

    /// Disconnected once the transaction is finished
    pub fn finished(&self) -> &Receiver<()> {
        &self.finished_rx
    }

    fn check_running(&self) -> Result<(), TransactionError> {
        if self.is_finished() {
            return Err(TransactionError::Finished);
        }
        if self.finishing.load(Ordering::Acquire) {
            return Err(TransactionError::Finishing);
        }
        Ok(())
    }

    /// Bind to the context and start the watchdog
    pub fn start(self: &Arc<Self>) -> Result<(), TransactionError> {
        self.check_running()?;
        {
            let mut state = self.state.lock();
            if state.started {
                tracing::error!(tx = %self.id, "transaction started twice");
                return Err(TransactionError::AlreadyStarted);
            }
            if !self.ctx.bind_transaction(self.clone()) {
                return Err(TransactionError::ContextAlreadyHasTransaction);
            }
            state.started = true;
            state.start_time = Some(Utc::now());
        }

        self.spawn_watchdog();
        tracing::debug!(tx = %self.id, ctx = %self.ctx.id(), readonly = self.readonly, "transaction started");
        Ok(())
    }

    fn spawn_watchdog(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let ctx_done = self.ctx.done().clone();
        let finished = self.finished_rx.clone();
        let timeout = self.timeout;

        let spawned = thread::Builder::new()
            .name("strand-tx-watchdog".to_string())
            .spawn(move || {
                let reason = crossbeam::select! {
                    recv(ctx_done) -> _ => "context done",
                    recv(finished) -> _ => return,
                    default(timeout) => "timeout",
                };
                let Some(tx) = weak.upgrade() else {
                    return;
                };
                if tx.is_finished() || tx.finishing.load(Ordering::Acquire) {
                    return;
                }
                tracing::warn!(tx = %tx.id, reason, "rolling back transaction");
                if let Err(err) = tx.rollback() {
                    tracing::debug!(tx = %tx.id, error = %err, "watchdog rollback");
                }
            });
        if let Err(err) = spawned {
            tracing::error!(tx = %self.id, error = %err, "failed to start transaction watchdog");
        }
    }

    pub fn add_effect(&self, effect: Arc<dyn Effect>) -> Result<(), TransactionError> {
        self.check_running()?;
        if self.readonly {
            return Err(TransactionError::EffectsNotAllowedInReadonly);
        }
        if effect.reversibility() == Reversibility::Irreversible {
            return Err(TransactionError::CannotAddIrreversibleEffect);
        }
        self.state.lock().effects.push(effect);
        Ok(())
    }

    /// Register a callback run when the transaction ends
    pub fn on_end(
        &self,
        key: impl Into<String>,
        callback: impl FnOnce(&Transaction, bool) -> Result<(), String> + Send + 'static,
    ) -> Result<(), TransactionError> {
        self.check_running()?;
        let key = key.into();
        let mut state = self.state.lock();
        if state.end_callbacks.iter().any(|(k, _)| *k == key) {
            return Err(TransactionError::AlreadySetEndCallback(key));
        }
        state.end_callbacks.push((key, Box::new(callback)));
        Ok(())
    }

    pub(crate) fn record_resource(&self, name: &str) {
        let mut state = self.state.lock();
        if !state.resources.iter().any(|r| r == name) {
            state.resources.push(name.to_string());
        }
    }

    pub fn commit(&self) -> Result<(), TransactionError> {
        self.finish(true)
    }

    pub fn rollback(&self) -> Result<(), TransactionError> {
        self.finish(false)
    }

    fn finish(&self, commit: bool) -> Result<(), TransactionError> {
        if self.is_finished() {
            return Err(TransactionError::Finished);
        }
        if self
            .finishing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // The winner may have completed since the first check
            if self.is_finished() {
                return Err(TransactionError::Finished);
            }
            return Err(TransactionError::Finishing);
        }

        let (effects, callbacks, resources) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.effects),
                std::mem::take(&mut state.end_callbacks),
                std::mem::take(&mut state.resources),
            )
        };

        let mut effect_error = None;
        let mut errors = Vec::new();

        if commit {
            for effect in &effects {
                if let Err(err) = effect.apply(&self.ctx) {
                    tracing::warn!(tx = %self.id, ?effect, error = %err, "failed to apply effect");
                    effect_error = Some(err);
                    break;
                }
            }
        } else {
            // Effects are reversed in registration order.
            for effect in &effects {
                if let Err(err) = effect.reverse(&self.ctx) {
                    tracing::warn!(tx = %self.id, ?effect, error = %err, "failed to reverse effect");
                    errors.push(format!("reverse {:?}: {}", effect, err));
                }
            }
        }

        let holder = ResourceHolder::Transaction(self.id);
        for name in &resources {
            if let Err(err) = self.ctx.resource_table().release(name, holder) {
                tracing::warn!(tx = %self.id, error = %err, "failed to release resource");
            }
        }

        let success = commit && effect_error.is_none();
        for (key, callback) in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(self, success))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(format!("{}: {}", key, err)),
                Err(payload) => errors.push(format!("{}: panic: {}", key, panic_message(&payload))),
            }
        }

        self.ctx.unbind_transaction(self);
        {
            let mut state = self.state.lock();
            state.end_time = Some(Utc::now());
            state.outcome = Some(if success {
                TransactionOutcome::Committed
            } else {
                TransactionOutcome::RolledBack
            });
        }
        self.finished.store(true, Ordering::Release);
        self.finished_tx.lock().take();

        tracing::debug!(tx = %self.id, committed = success, "transaction finished");

        if let Some(err) = effect_error {
            return Err(TransactionError::EffectFailed(err));
        }
        if !errors.is_empty() {
            return Err(TransactionError::Callbacks(errors));
        }
        Ok(())
    }
}
