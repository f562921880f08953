//! Per-value lock, inert until the value is shared
//!
//! Before [`SmartLock::share`] only the owning thread can reach the value,
//! so locking is a no-op. After sharing, the lock is a reentrant (per
//! context) mutual exclusion with a starvation breaker: a waiter blocked
//! for longer than the hold timeout cancels the holder's context and takes
//! the lock.

use crate::config;
use crate::context::Context;
use crate::error::LockError;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use strand_types::ContextId;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(2);

struct Holder {
    ctx: Context,
    depth: u32,
}

#[derive(Default)]
struct LockState {
    holder: Option<Holder>,
    waiters: u32,
}

pub struct SmartLock {
    shared: AtomicBool,
    state: Mutex<LockState>,
    released: Condvar,
    hold_timeout: Duration,
}

impl fmt::Debug for SmartLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartLock")
            .field("shared", &self.is_value_shared())
            .field("holder", &self.holder())
            .finish()
    }
}

impl Default for SmartLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SmartLock {
    pub fn new() -> Self {
        Self::with_hold_timeout(config::current().lock_hold_timeout())
    }

    pub fn with_hold_timeout(hold_timeout: Duration) -> Self {
        Self {
            shared: AtomicBool::new(false),
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            hold_timeout,
        }
    }

    pub fn is_value_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    /// Mark the value shared. `on_share` runs only for the call that
    /// performs the transition; returns whether this call shared the value.
    pub fn share(&self, origin: &Context, on_share: impl FnOnce()) -> bool {
        if self
            .shared
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        tracing::debug!(ctx = %origin.id(), "value shared");
        on_share();
        true
    }

    pub fn holder(&self) -> Option<ContextId> {
        self.state.lock().holder.as_ref().map(|h| h.ctx.id())
    }

    pub fn waiter_count(&self) -> u32 {
        self.state.lock().waiters
    }

    /// Acquire the lock for `ctx`; a no-op while the value is not shared
    pub fn lock(&self, ctx: &Context) -> Result<(), LockError> {
        self.lock_engaged(ctx).map(|_| ())
    }

    /// Returns whether the lock was actually taken
    fn lock_engaged(&self, ctx: &Context) -> Result<bool, LockError> {
        if !self.is_value_shared() {
            return Ok(false);
        }

        let start = Instant::now();
        let mut state = self.state.lock();
        let mut waiting = false;

        loop {
            let verdict = match &mut state.holder {
                None => Verdict::Take,
                Some(holder) if holder.ctx.id() == ctx.id() => {
                    holder.depth += 1;
                    Verdict::Reentered
                }
                Some(holder) if holder.ctx.is_done() => Verdict::Take,
                Some(holder) => {
                    if ctx.is_done() {
                        Verdict::Abort
                    } else if start.elapsed() >= self.hold_timeout {
                        Verdict::Steal(holder.ctx.clone())
                    } else {
                        Verdict::Wait
                    }
                }
            };

            match verdict {
                Verdict::Wait => {
                    if !waiting {
                        state.waiters += 1;
                        waiting = true;
                    }
                    let remaining = self.hold_timeout.saturating_sub(start.elapsed());
                    self.released
                        .wait_for(&mut state, remaining.min(WAIT_POLL_INTERVAL).max(Duration::from_micros(100)));
                    continue;
                }
                Verdict::Abort => {
                    if waiting {
                        state.waiters -= 1;
                    }
                    return Err(LockError::ContextDone);
                }
                Verdict::Reentered => {}
                Verdict::Take => {
                    state.holder = Some(Holder {
                        ctx: ctx.clone(),
                        depth: 1,
                    });
                }
                Verdict::Steal(victim) => {
                    state.holder = Some(Holder {
                        ctx: ctx.clone(),
                        depth: 1,
                    });
                    if waiting {
                        state.waiters -= 1;
                    }
                    drop(state);
                    tracing::warn!(
                        holder = %victim.id(),
                        waiter = %ctx.id(),
                        waited_ms = start.elapsed().as_millis() as u64,
                        "smart lock held too long, cancelling holder"
                    );
                    victim.cancel_ungracefully();
                    return Ok(true);
                }
            }

            if waiting {
                state.waiters -= 1;
            }
            return Ok(true);
        }
    }

    /// Release one level of the lock held by `ctx`.
    ///
    /// # Panics
    ///
    /// Panics if the value is shared and `ctx` neither holds the lock nor
    /// was cancelled (a cancelled holder may have lost the lock to a
    /// starving waiter).
    pub fn unlock(&self, ctx: &Context) {
        if !self.is_value_shared() {
            return;
        }
        let mut state = self.state.lock();
        match &mut state.holder {
            Some(holder) if holder.ctx.id() == ctx.id() => {
                holder.depth -= 1;
                if holder.depth == 0 {
                    state.holder = None;
                    drop(state);
                    self.released.notify_all();
                }
            }
            _ if ctx.is_done() => {}
            _ => {
                drop(state);
                panic!("smart lock unlocked by {} which does not hold it", ctx.id());
            }
        }
    }

    /// Lock and return a guard that unlocks on drop
    pub fn acquire(&self, ctx: &Context) -> Result<SmartLockGuard<'_>, LockError> {
        let engaged = self.lock_engaged(ctx)?;
        Ok(SmartLockGuard {
            lock: self,
            ctx: ctx.clone(),
            engaged,
        })
    }
}

enum Verdict {
    Take,
    Reentered,
    Wait,
    Abort,
    Steal(Context),
}

/// Releases the [`SmartLock`] level taken by [`SmartLock::acquire`]
pub struct SmartLockGuard<'a> {
    lock: &'a SmartLock,
    ctx: Context,
    engaged: bool,
}

impl Drop for SmartLockGuard<'_> {
    fn drop(&mut self) {
        if self.engaged {
            self.lock.unlock(&self.ctx);
        }
    }
}
