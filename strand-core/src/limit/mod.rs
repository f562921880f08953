//! Resource limits backed by token buckets
//!
//! - `Total` limits are plain counters: `take` fails immediately when the
//!   balance is insufficient, `give_back` restores capacity.
//! - `ByteRate` and `SimpleRate` limits refill continuously from the
//!   process-wide [`ticker`]; `take` blocks the caller until enough tokens
//!   have accumulated.
//!
//! Balances are stored in milli-tokens so that refills smaller than one
//! token per tick accumulate.

mod ticker;

pub use ticker::BucketTicker;

use crate::error::LimitError;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TOKEN_SCALE: i64 = 1_000;

/// How long a blocked `take` sleeps before re-checking cancellation
const TAKE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Name of the limit counting simultaneously running lightweight threads
pub const THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME: &str = "threads/simul-instances";

/// Name of the limit bounding the execution time of a context tree, in milliseconds
pub const EXECUTION_TOTAL_LIMIT_NAME: &str = "execution/total-time";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimitKind {
    Total,
    ByteRate,
    SimpleRate,
}

impl LimitKind {
    pub fn is_rate(self) -> bool {
        !matches!(self, LimitKind::Total)
    }
}

/// Number of tokens consumed by a Total limiter for an elapsed tick
pub type DepletionFn = Arc<dyn Fn(Duration) -> f64 + Send + Sync>;

/// Declaration of one named limit
#[derive(Clone)]
pub struct Limit {
    pub name: String,
    pub kind: LimitKind,
    /// Capacity; for rate kinds also the refill rate per second
    pub value: i64,
    /// Optional per-tick depletion (Total kind only)
    pub depletion: Option<DepletionFn>,
}

impl fmt::Debug for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limit")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &self.value)
            .field("depletion", &self.depletion.is_some())
            .finish()
    }
}

impl Limit {
    pub fn new(name: impl Into<String>, kind: LimitKind, value: i64) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            depletion: None,
        }
    }

    pub fn total(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, LimitKind::Total, value)
    }

    pub fn simple_rate(name: impl Into<String>, per_second: i64) -> Self {
        Self::new(name, LimitKind::SimpleRate, per_second)
    }

    pub fn byte_rate(name: impl Into<String>, bytes_per_second: i64) -> Self {
        Self::new(name, LimitKind::ByteRate, bytes_per_second)
    }

    /// Execution time budget in milliseconds, depleted in real time
    pub fn execution_time(budget: Duration) -> Self {
        Self {
            name: EXECUTION_TOTAL_LIMIT_NAME.to_string(),
            kind: LimitKind::Total,
            value: budget.as_millis() as i64,
            depletion: Some(Arc::new(|elapsed: Duration| elapsed.as_secs_f64() * 1_000.0)),
        }
    }

    pub fn with_depletion(mut self, depletion: DepletionFn) -> Self {
        self.depletion = Some(depletion);
        self
    }

    pub fn validate(&self) -> Result<(), LimitError> {
        if self.value < 0 {
            return Err(LimitError::Invalid {
                name: self.name.clone(),
                reason: "value must not be negative".to_string(),
            });
        }
        if self.value > i64::MAX / TOKEN_SCALE {
            return Err(LimitError::Invalid {
                name: self.name.clone(),
                reason: format!("value must not exceed {}", i64::MAX / TOKEN_SCALE),
            });
        }
        if self.kind.is_rate() && self.value == 0 {
            return Err(LimitError::Invalid {
                name: self.name.clone(),
                reason: "a rate limit cannot be zero".to_string(),
            });
        }
        if self.kind.is_rate() && self.depletion.is_some() {
            return Err(LimitError::Invalid {
                name: self.name.clone(),
                reason: "only total limits can be depleted".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BucketState {
    /// Milli-tokens
    available: i64,
    last_tick: Instant,
    depletion_paused: u32,
    exhausted_reported: bool,
}

type ExhaustionHook = Box<dyn Fn() + Send + Sync>;

/// Token bucket for one named limit
pub struct Limiter {
    name: String,
    kind: LimitKind,
    capacity: i64,
    fill_per_sec: i64,
    depletion: Option<DepletionFn>,
    state: Mutex<BucketState>,
    refilled: Condvar,
    on_exhausted: Mutex<Option<ExhaustionHook>>,
    destroyed: AtomicBool,
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("available", &self.available())
            .finish()
    }
}

impl Limiter {
    /// Create a limiter, registering rate and depleting buckets with the ticker
    pub fn new(limit: &Limit) -> Result<Arc<Self>, LimitError> {
        limit.validate()?;
        let capacity = limit.value * TOKEN_SCALE;
        let limiter = Arc::new(Self {
            name: limit.name.clone(),
            kind: limit.kind,
            capacity,
            fill_per_sec: if limit.kind.is_rate() { capacity } else { 0 },
            depletion: limit.depletion.clone(),
            state: Mutex::new(BucketState {
                available: capacity,
                last_tick: Instant::now(),
                depletion_paused: 0,
                exhausted_reported: false,
            }),
            refilled: Condvar::new(),
            on_exhausted: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        if limiter.kind.is_rate() || limiter.depletion.is_some() {
            BucketTicker::global().register(&limiter);
        }
        Ok(limiter)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> LimitKind {
        self.kind
    }

    pub fn capacity(&self) -> i64 {
        self.capacity / TOKEN_SCALE
    }

    /// Whole tokens currently available
    pub fn available(&self) -> i64 {
        self.state.lock().available.div_euclid(TOKEN_SCALE)
    }

    /// Called once when a depleting Total limiter drops below zero
    pub fn set_exhaustion_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_exhausted.lock() = Some(Box::new(hook));
    }

    /// Take `count` tokens.
    ///
    /// `is_done` is polled while a rate limiter waits; returning true aborts
    /// the wait with [`LimitError::ContextDone`].
    pub fn take(&self, count: i64, is_done: &dyn Fn() -> bool) -> Result<(), LimitError> {
        if count <= 0 {
            return Ok(());
        }
        if is_done() {
            return Err(LimitError::ContextDone);
        }

        let scaled = count.checked_mul(TOKEN_SCALE).ok_or_else(|| LimitError::Invalid {
            name: self.name.clone(),
            reason: format!("cannot take {} tokens at once", count),
        })?;
        let mut state = self.state.lock();

        if !self.kind.is_rate() {
            if state.available < scaled {
                return Err(LimitError::Exhausted {
                    name: self.name.clone(),
                    requested: count,
                    available: state.available.div_euclid(TOKEN_SCALE),
                });
            }
            state.available -= scaled;
            return Ok(());
        }

        // Requests larger than the bucket are served capacity-sized chunk by chunk.
        let mut remaining = scaled;
        while remaining > 0 {
            let chunk = remaining.min(self.capacity);
            while state.available < chunk {
                if is_done() {
                    return Err(LimitError::ContextDone);
                }
                self.refilled.wait_for(&mut state, TAKE_POLL_INTERVAL);
            }
            state.available -= chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Restore `count` tokens, capped at capacity
    pub fn give_back(&self, count: i64) {
        if count <= 0 {
            return;
        }
        let mut state = self.state.lock();
        let scaled = count.saturating_mul(TOKEN_SCALE);
        state.available = state.available.saturating_add(scaled).min(self.capacity);
        drop(state);
        self.refilled.notify_all();
    }

    pub fn pause_depletion(&self) {
        self.state.lock().depletion_paused += 1;
    }

    pub fn resume_depletion(&self) {
        let mut state = self.state.lock();
        state.depletion_paused = state.depletion_paused.saturating_sub(1);
    }

    /// Stop refilling; the ticker forgets destroyed buckets
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.refilled.notify_all();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Refill or deplete according to the time elapsed since the last tick
    pub(crate) fn tick(&self, now: Instant) {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_tick);
        state.last_tick = now;

        if self.kind.is_rate() {
            let refill = (elapsed.as_nanos() * self.fill_per_sec as u128 / 1_000_000_000)
                .min(self.capacity as u128) as i64;
            state.available = state.available.saturating_add(refill).min(self.capacity);
            drop(state);
            self.refilled.notify_all();
            return;
        }

        let Some(depletion) = &self.depletion else {
            return;
        };
        if state.depletion_paused > 0 {
            return;
        }
        let consumed = (depletion(elapsed) * TOKEN_SCALE as f64) as i64;
        state.available = state.available.saturating_sub(consumed);

        if state.available < 0 && !state.exhausted_reported {
            state.exhausted_reported = true;
            drop(state);
            tracing::warn!(limit = %self.name, "limit exhausted by depletion");
            if let Some(hook) = self.on_exhausted.lock().as_ref() {
                hook();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn never_done() -> bool {
        false
    }

    #[test]
    fn test_total_take_give_back() {
        let limiter = Limiter::new(&Limit::total("quota", 1)).unwrap();
        limiter.take(1, &never_done).unwrap();

        let err = limiter.take(1, &never_done).unwrap_err();
        assert_eq!(
            err,
            LimitError::Exhausted {
                name: "quota".to_string(),
                requested: 1,
                available: 0
            }
        );

        limiter.give_back(1);
        limiter.take(1, &never_done).unwrap();
    }

    #[test]
    fn test_huge_values_are_rejected() {
        assert!(matches!(
            Limiter::new(&Limit::total("quota", i64::MAX)),
            Err(LimitError::Invalid { .. })
        ));

        let limiter = Limiter::new(&Limit::total("quota", i64::MAX / TOKEN_SCALE)).unwrap();
        assert!(matches!(
            limiter.take(i64::MAX, &never_done),
            Err(LimitError::Invalid { .. })
        ));
        limiter.take(1, &never_done).unwrap();
        limiter.give_back(i64::MAX);
        assert_eq!(limiter.available(), i64::MAX / TOKEN_SCALE);
    }

    #[test]
    fn test_give_back_is_capped() {
        let limiter = Limiter::new(&Limit::total("quota", 3)).unwrap();
        limiter.give_back(10);
        assert_eq!(limiter.available(), 3);
    }

    #[test]
    fn test_rate_take_blocks_until_refill() {
        let limiter = Limiter::new(&Limit::simple_rate("rate", 100)).unwrap();
        limiter.take(100, &never_done).unwrap();

        // 20 tokens at 100/s need roughly 200ms of refill
        let start = Instant::now();
        limiter.take(20, &never_done).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_rate_take_aborts_when_done() {
        let limiter = Limiter::new(&Limit::byte_rate("bytes", 10)).unwrap();
        limiter.take(10, &never_done).unwrap();

        let polls = AtomicUsize::new(0);
        let is_done = || polls.fetch_add(1, Ordering::SeqCst) > 2;
        assert_eq!(limiter.take(10, &is_done), Err(LimitError::ContextDone));
    }

    #[test]
    fn test_depletion_fires_hook_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let limit = Limit::total("budget", 1).with_depletion(Arc::new(|_| 1.0));
        let limiter = Limiter::new(&limit).unwrap();
        let counter = fired.clone();
        limiter.set_exhaustion_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(limiter.available() < 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        limiter.destroy();
    }

    #[test]
    fn test_paused_depletion() {
        let limit = Limit::total("budget", 1_000).with_depletion(Arc::new(|_| 1.0));
        let limiter = Limiter::new(&limit).unwrap();
        limiter.pause_depletion();
        let before = limiter.available();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(limiter.available(), before);
        limiter.destroy();
    }

    #[test]
    fn test_invalid_limits() {
        assert!(Limiter::new(&Limit::total("neg", -1)).is_err());
        assert!(Limiter::new(&Limit::simple_rate("zero", 0)).is_err());
        let depleting_rate = Limit::simple_rate("r", 1).with_depletion(Arc::new(|_| 1.0));
        assert!(depleting_rate.validate().is_err());
    }
}
