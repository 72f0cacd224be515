//! Debounced flush scheduling
//!
//! A single one-shot deadline guards the flush worker. Mutations ask for a
//! flush after some delay; the deadline only ever moves earlier while armed,
//! so a steady stream of changes cannot starve the flush. The worker thread
//! sleeps on a condition variable until the deadline passes, disarms it and
//! runs the flush callback.

use crate::config::StoreConfig;
use crate::pending::{Category, DirtySet};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Categories flushed after the short debounce
pub const IMMEDIATE: [Category; 3] = [Category::Net, Category::Iv, Category::Role];

/// Delay before flushing the given dirty set
///
/// Identity, IV and role changes use the short debounce. A lone replay-list
/// change uses the replay timeout when that is the shorter of the two.
/// Everything else waits for the generic store timeout.
pub fn flush_delay(dirty: DirtySet, config: &StoreConfig) -> Duration {
    if dirty.contains_any(&IMMEDIATE) {
        config.flush_debounce
    } else if dirty == DirtySet::of(&[Category::Rpl])
        && config.rpl_store_timeout < config.store_timeout
    {
        config.rpl_store_timeout
    } else {
        config.store_timeout
    }
}

/// Deadline after asking for a flush in `delay` at `now`
///
/// An armed deadline that fires no later than the new request is kept.
pub fn rearm(current: Option<Instant>, delay: Duration, now: Instant) -> Instant {
    let requested = now + delay;
    match current {
        Some(deadline) if deadline <= requested => deadline,
        _ => requested,
    }
}

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

/// One-shot flush deadline shared between mutators and the worker
#[derive(Debug, Clone, Default)]
pub struct FlushTimer {
    signal: Arc<(Mutex<TimerState>, Condvar)>,
}

impl FlushTimer {
    /// Disarmed timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a flush within `delay`, returning the effective deadline
    pub fn schedule(&self, delay: Duration) -> Instant {
        let (lock, cvar) = &*self.signal;
        let mut state = lock.lock();
        let now = Instant::now();
        let deadline = rearm(state.deadline, delay, now);

        if state.deadline == Some(deadline) {
            trace!(
                remaining_ms = deadline.saturating_duration_since(now).as_millis() as u64,
                "keeping earlier flush deadline"
            );
        } else {
            debug!(delay_ms = delay.as_millis() as u64, "flush scheduled");
            state.deadline = Some(deadline);
            cvar.notify_one();
        }
        deadline
    }

    /// Armed deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.signal.0.lock().deadline
    }

    /// Time left until the armed deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Stop the worker. Any armed deadline is dropped.
    pub fn shutdown(&self) {
        let (lock, cvar) = &*self.signal;
        let mut state = lock.lock();
        state.shutdown = true;
        state.deadline = None;
        cvar.notify_all();
    }

    /// Block until the deadline passes and disarm it
    ///
    /// Returns `false` once the timer has been shut down.
    pub fn wait(&self) -> bool {
        let (lock, cvar) = &*self.signal;
        let mut state = lock.lock();
        loop {
            if state.shutdown {
                return false;
            }
            match state.deadline {
                None => cvar.wait(&mut state),
                Some(deadline) if Instant::now() >= deadline => {
                    state.deadline = None;
                    return true;
                }
                Some(deadline) => {
                    // Woken early when the deadline moves or on shutdown
                    let _ = cvar.wait_until(&mut state, deadline);
                }
            }
        }
    }

    /// Run `on_fire` on a dedicated thread each time the deadline passes
    ///
    /// The worker exits after shutdown or when `on_fire` returns `false`.
    pub fn spawn<F>(&self, mut on_fire: F) -> io::Result<thread::JoinHandle<()>>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let timer = self.clone();
        thread::Builder::new()
            .name("mesh-settings-flush".to_string())
            .spawn(move || {
                while timer.wait() {
                    if !on_fire() {
                        break;
                    }
                }
                debug!("flush worker stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> StoreConfig {
        StoreConfig {
            store_timeout: Duration::from_secs(2),
            rpl_store_timeout: Duration::from_secs(1),
            flush_debounce: Duration::from_millis(500),
            seq_store_rate: 128,
        }
    }

    #[test]
    fn test_delay_classes() {
        let config = config();

        let net = DirtySet::of(&[Category::Net, Category::Model]);
        assert_eq!(flush_delay(net, &config), config.flush_debounce);

        let rpl = DirtySet::of(&[Category::Rpl]);
        assert_eq!(flush_delay(rpl, &config), config.rpl_store_timeout);

        let mixed = DirtySet::of(&[Category::Rpl, Category::Keys]);
        assert_eq!(flush_delay(mixed, &config), config.store_timeout);

        let slow_rpl = StoreConfig {
            rpl_store_timeout: Duration::from_secs(5),
            ..config
        };
        assert_eq!(flush_delay(rpl, &slow_rpl), slow_rpl.store_timeout);
    }

    #[test]
    fn test_rearm_only_moves_earlier() {
        let now = Instant::now();
        let first = rearm(None, Duration::from_secs(2), now);
        assert_eq!(first, now + Duration::from_secs(2));

        // A later request keeps the armed deadline
        let later = rearm(Some(first), Duration::from_secs(5), now + Duration::from_millis(100));
        assert_eq!(later, first);

        // A sooner request pulls it in
        let sooner = rearm(Some(first), Duration::from_millis(500), now);
        assert_eq!(sooner, now + Duration::from_millis(500));
    }

    #[test]
    fn test_deadline_is_monotonic_under_repeated_marks() {
        let timer = FlushTimer::new();
        let first = timer.schedule(Duration::from_secs(60));
        for _ in 0..10 {
            assert!(timer.schedule(Duration::from_secs(60)) <= first);
        }
        assert_eq!(timer.deadline(), Some(first));
    }

    #[test]
    fn test_worker_fires_once_per_deadline() {
        let timer = FlushTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = timer
            .spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();

        for _ in 0..5 {
            timer.schedule(Duration::from_millis(30));
        }
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.deadline(), None);

        timer.shutdown();
        handle.join().unwrap();
    }
}
