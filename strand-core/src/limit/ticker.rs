//! Background refill of rate limiters

use super::Limiter;
use crate::config;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Single thread ticking every registered bucket at a fixed interval
pub struct BucketTicker {
    buckets: Mutex<Vec<Weak<Limiter>>>,
    interval: Duration,
}

static GLOBAL_TICKER: Lazy<Arc<BucketTicker>> = Lazy::new(|| {
    let ticker = Arc::new(BucketTicker {
        buckets: Mutex::new(Vec::new()),
        interval: config::current().bucket_tick_interval(),
    });
    let weak = Arc::downgrade(&ticker);
    let spawned = thread::Builder::new()
        .name("strand-bucket-ticker".to_string())
        .spawn(move || run(weak));
    if let Err(err) = spawned {
        tracing::error!(error = %err, "failed to start the bucket ticker");
    }
    ticker
});

fn run(ticker: Weak<BucketTicker>) {
    loop {
        let Some(ticker) = ticker.upgrade() else {
            return;
        };
        let interval = ticker.interval;
        ticker.tick_all(Instant::now());
        drop(ticker);
        thread::sleep(interval);
    }
}

impl BucketTicker {
    pub fn global() -> &'static Arc<BucketTicker> {
        &GLOBAL_TICKER
    }

    pub fn register(&self, limiter: &Arc<Limiter>) {
        self.buckets.lock().push(Arc::downgrade(limiter));
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    fn tick_all(&self, now: Instant) {
        let live: Vec<Arc<Limiter>> = {
            let mut buckets = self.buckets.lock();
            buckets.retain(|weak| weak.upgrade().is_some_and(|b| !b.is_destroyed()));
            buckets.iter().filter_map(Weak::upgrade).collect()
        };
        for bucket in live {
            bucket.tick(now);
        }
    }
}
