//! Watchdog (§4.5): an independent monitor thread that fires a callback
//! when the scan loop has not fed it within a configured bound.

use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const MIN_TIMEOUT: Duration = Duration::from_secs(5);

type Callback = Box<dyn Fn() + Send + Sync>;

struct Shared {
    last_feed: Mutex<Instant>,
    timeout: Duration,
    running: AtomicBool,
    stop: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

/// Cloneable handle around the monitor thread; `feed()` is the hot path
/// called once per scan cycle and must stay lock-cheap.
#[derive(Clone)]
pub struct Watchdog {
    shared: Arc<Shared>,
}

impl Watchdog {
    /// `timeout` is floored at 5 seconds per §4.5.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let timeout = timeout.max(MIN_TIMEOUT);
        Self {
            shared: Arc::new(Shared {
                last_feed: Mutex::new(Instant::now()),
                timeout,
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                callback: Mutex::new(None),
            }),
        }
    }

    pub fn set_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.callback.lock() = Some(Box::new(cb));
    }

    pub fn feed(&self) {
        *self.shared.last_feed.lock() = Instant::now();
    }

    pub fn start(&self) {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.feed();
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("watchdog".to_owned())
            .spawn(move || monitor_loop(&shared))
            .expect("failed to spawn watchdog monitor thread");
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }
}

fn monitor_loop(shared: &Shared) {
    debug!("watchdog monitor started, timeout={:?}", shared.timeout);
    while !shared.stop.load(Ordering::Relaxed) {
        thread::sleep(POLL_INTERVAL);
        let elapsed = shared.last_feed.lock().elapsed();
        if elapsed >= shared.timeout {
            warn!("watchdog timeout after {:?}", elapsed);
            if let Some(cb) = shared.callback.lock().as_ref() {
                cb();
            }
            // Reset so the callback does not re-fire every tick (§4.5).
            *shared.last_feed.lock() = Instant::now();
        }
    }
    shared.running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_callback_after_timeout() {
        let wd = Watchdog::new(Duration::from_millis(10).max(MIN_TIMEOUT));
        // Use the real floor but shrink POLL by feeding manually instead of
        // waiting multiple seconds in a unit test: exercise the timeout
        // math directly rather than the thread loop.
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        wd.set_callback(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        // Simulate an elapsed timeout by checking the predicate directly.
        *wd.shared.last_feed.lock() = Instant::now() - wd.shared.timeout - Duration::from_millis(1);
        let elapsed = wd.shared.last_feed.lock().elapsed();
        assert!(elapsed >= wd.shared.timeout);
        if let Some(cb) = wd.shared.callback.lock().as_ref() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_is_floored_at_five_seconds() {
        let wd = Watchdog::new(Duration::from_millis(1));
        assert_eq!(wd.shared.timeout, MIN_TIMEOUT);
    }
}
