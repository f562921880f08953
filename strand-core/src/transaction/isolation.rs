//! Read/write isolation between transactions
//!
//! Rules enforced by [`TransactionIsolator`]:
//! - readonly transactions never block each other,
//! - a write transaction waits for the current write transaction and for
//!   every running readonly transaction,
//! - a readonly transaction (or a non-transactional access) waits for the
//!   current write transaction.

use super::Transaction;
use crate::config;
use crate::context::Context;
use crate::error::IsolationError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

static NEXT_ISOLATOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct IsolatorState {
    writer: Option<Arc<Transaction>>,
    readers: Vec<Arc<Transaction>>,
}

impl IsolatorState {
    fn prune(&mut self) {
        if self.writer.as_ref().is_some_and(|w| w.is_finished()) {
            self.writer = None;
        }
        self.readers.retain(|r| !r.is_finished());
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<IsolatorState>,
    changed: Condvar,
}

enum Blocker {
    Writer,
    Readers,
}

pub struct TransactionIsolator {
    id: u64,
    shared: Arc<Shared>,
    wait_timeout: Duration,
}

impl Default for TransactionIsolator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionIsolator {
    pub fn new() -> Self {
        Self::with_wait_timeout(config::current().isolation_wait_timeout())
    }

    pub fn with_wait_timeout(wait_timeout: Duration) -> Self {
        Self {
            id: NEXT_ISOLATOR_ID.fetch_add(1, Ordering::Relaxed),
            shared: Arc::new(Shared::default()),
            wait_timeout,
        }
    }

    /// Current write transaction, if any
    pub fn writer(&self) -> Option<Arc<Transaction>> {
        let mut state = self.shared.state.lock();
        state.prune();
        state.writer.clone()
    }

    pub fn reader_count(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.prune();
        state.readers.len()
    }

    /// Wait until the transaction of `ctx` (or a non-transactional access)
    /// may proceed, and register the transaction as reader or writer.
    pub fn wait_for_other_transactions(
        &self,
        ctx: &Context,
        require_running_tx: bool,
    ) -> Result<Option<Arc<Transaction>>, IsolationError> {
        let tx = ctx.transaction().filter(|tx| !tx.is_finished());
        if tx.is_none() && require_running_tx {
            return Err(IsolationError::RunningTransactionExpected);
        }

        let deadline = Instant::now() + self.wait_timeout;
        let mut state = self.shared.state.lock();

        loop {
            state.prune();
            let same = |other: &Option<Arc<Transaction>>, tx: &Transaction| {
                other.as_ref().map_or(true, |o| o.id() == tx.id())
            };

            let blocker = match &tx {
                None => {
                    if state.writer.is_none() {
                        return Ok(None);
                    }
                    Blocker::Writer
                }
                Some(tx) if tx.is_readonly() => {
                    if same(&state.writer, tx) {
                        if !state.readers.iter().any(|r| r.id() == tx.id()) {
                            state.readers.push(tx.clone());
                            drop(state);
                            self.notify_on_end(tx);
                        }
                        return Ok(Some(tx.clone()));
                    }
                    Blocker::Writer
                }
                Some(tx) => {
                    let other_readers = state.readers.iter().any(|r| r.id() != tx.id());
                    if !same(&state.writer, tx) {
                        Blocker::Writer
                    } else if other_readers {
                        Blocker::Readers
                    } else {
                        let newly_admitted = state.writer.is_none();
                        state.writer = Some(tx.clone());
                        drop(state);
                        if newly_admitted {
                            self.notify_on_end(tx);
                        }
                        return Ok(Some(tx.clone()));
                    }
                }
            };

            if ctx.is_done() {
                return Err(IsolationError::ContextDone);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(ctx = %ctx.id(), "isolation wait timed out");
                return Err(match blocker {
                    Blocker::Readers => IsolationError::ReadonlyWaitTimeout,
                    Blocker::Writer => IsolationError::WriteWaitTimeout,
                });
            }
            self.shared
                .changed
                .wait_for(&mut state, (deadline - now).min(POLL_INTERVAL));
        }
    }

    fn notify_on_end(&self, tx: &Arc<Transaction>) {
        let shared = self.shared.clone();
        let key = format!("isolator-{}", self.id);
        // A finishing transaction cannot take callbacks; pruning covers it.
        let _ = tx.on_end(key, move |tx, _| {
            let mut state = shared.state.lock();
            if state.writer.as_ref().is_some_and(|w| w.id() == tx.id()) {
                state.writer = None;
            }
            state.readers.retain(|r| r.id() != tx.id());
            drop(state);
            shared.changed.notify_all();
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{start_new_readonly_transaction, start_new_transaction, TransactionOptions};
    use std::sync::mpsc;
    use std::thread;

    fn ctx() -> Context {
        Context::root(vec![], vec![]).unwrap()
    }

    #[test]
    fn test_readonly_transactions_do_not_block_each_other() {
        let isolator = TransactionIsolator::with_wait_timeout(Duration::from_millis(50));
        let (c1, c2) = (ctx(), ctx());
        let r1 = start_new_readonly_transaction(&c1).unwrap();
        let r2 = start_new_readonly_transaction(&c2).unwrap();

        isolator.wait_for_other_transactions(&c1, true).unwrap();
        isolator.wait_for_other_transactions(&c2, true).unwrap();
        assert_eq!(isolator.reader_count(), 2);

        r1.commit().unwrap();
        r2.commit().unwrap();
        assert_eq!(isolator.reader_count(), 0);
    }

    #[test]
    fn test_write_waits_for_readers() {
        let isolator = Arc::new(TransactionIsolator::with_wait_timeout(Duration::from_secs(5)));
        let (c1, c2, cw) = (ctx(), ctx(), ctx());
        let r1 = start_new_readonly_transaction(&c1).unwrap();
        let r2 = start_new_readonly_transaction(&c2).unwrap();
        isolator.wait_for_other_transactions(&c1, true).unwrap();
        isolator.wait_for_other_transactions(&c2, true).unwrap();

        let w = start_new_transaction(&cw, TransactionOptions::default()).unwrap();
        let (sender, receiver) = mpsc::channel();
        let iso = isolator.clone();
        let handle = thread::spawn(move || {
            let res = iso.wait_for_other_transactions(&cw, true);
            sender.send(()).unwrap();
            res
        });

        thread::sleep(Duration::from_millis(30));
        assert!(receiver.try_recv().is_err(), "writer should be blocked");

        r1.commit().unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(receiver.try_recv().is_err(), "writer should wait for r2");

        r2.commit().unwrap();
        let admitted = handle.join().unwrap().unwrap();
        assert_eq!(admitted.map(|t| t.id()), Some(w.id()));
        assert_eq!(isolator.writer().map(|t| t.id()), Some(w.id()));
    }

    #[test]
    fn test_reader_waits_for_writer() {
        let isolator = TransactionIsolator::with_wait_timeout(Duration::from_millis(30));
        let (cw, cr) = (ctx(), ctx());
        let _w = start_new_transaction(&cw, TransactionOptions::default()).unwrap();
        isolator.wait_for_other_transactions(&cw, true).unwrap();

        let _r = start_new_readonly_transaction(&cr).unwrap();
        assert!(matches!(
            isolator.wait_for_other_transactions(&cr, true),
            Err(IsolationError::WriteWaitTimeout)
        ));
    }

    #[test]
    fn test_write_wait_timeout_on_readers() {
        let isolator = TransactionIsolator::with_wait_timeout(Duration::from_millis(30));
        let (cr, cw) = (ctx(), ctx());
        let _r = start_new_readonly_transaction(&cr).unwrap();
        isolator.wait_for_other_transactions(&cr, true).unwrap();

        let _w = start_new_transaction(&cw, TransactionOptions::default()).unwrap();
        assert!(matches!(
            isolator.wait_for_other_transactions(&cw, true),
            Err(IsolationError::ReadonlyWaitTimeout)
        ));
    }

    #[test]
    fn test_writer_is_reentrant() {
        let isolator = TransactionIsolator::with_wait_timeout(Duration::from_millis(30));
        let c = ctx();
        let w = start_new_transaction(&c, TransactionOptions::default()).unwrap();
        isolator.wait_for_other_transactions(&c, true).unwrap();
        isolator.wait_for_other_transactions(&c, true).unwrap();
        w.commit().unwrap();
        assert!(isolator.writer().is_none());
    }

    #[test]
    fn test_running_transaction_expected() {
        let isolator = TransactionIsolator::new();
        assert!(matches!(
            isolator.wait_for_other_transactions(&ctx(), true),
            Err(IsolationError::RunningTransactionExpected)
        ));
        assert!(matches!(
            isolator.wait_for_other_transactions(&ctx(), false),
            Ok(None)
        ));
    }
}
