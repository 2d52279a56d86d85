//! Minimal timing service for timeouts and housekeeping.
//!
//! Jobs run on their own tokio task. Accuracy floor is the runtime timer
//! (tens of milliseconds under load); callers must not depend on sub-10 ms
//! precision.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

/// Handle to a scheduled job. Dropping the handle does not cancel the job.
#[derive(Debug)]
pub struct JobHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl JobHandle {
    /// Cancel the job; no further fires will happen. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.task.abort();
        }
    }

    /// Whether `cancel` was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Schedules deferred and periodic callbacks.
///
/// Injectable per the crate's no-singleton policy; a process-wide default
/// is available through [`default_scheduler`].
#[derive(Debug, Default)]
pub struct Scheduler {
    _private: (),
}

impl Scheduler {
    /// Create a scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` once after `delay`.
    pub fn call_later<F>(&self, delay: Duration, callback: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if flag.load(Ordering::SeqCst) {
                return;
            }
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                warn!("Scheduled callback panicked");
            }
        });

        JobHandle { cancelled, task }
    }

    /// Run `callback` every `interval`, starting one interval from now.
    ///
    /// A fire whose callback overruns the interval delays subsequent fires;
    /// fires are never run concurrently. A panicking callback cancels the
    /// job.
    pub fn call_periodic<F>(&self, interval: Duration, mut callback: F) -> JobHandle
    where
        F: FnMut() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                if catch_unwind(AssertUnwindSafe(&mut callback)).is_err() {
                    warn!("Periodic callback panicked, cancelling job");
                    flag.store(true, Ordering::SeqCst);
                    return;
                }
            }
        });

        JobHandle { cancelled, task }
    }
}

/// The process-wide default scheduler.
pub fn default_scheduler() -> &'static Scheduler {
    static DEFAULT: OnceLock<Scheduler> = OnceLock::new();
    DEFAULT.get_or_init(Scheduler::new)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn call_later_fires_once() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        scheduler.call_later(Duration::from_millis(50), move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_job_never_fires() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        let job = scheduler.call_later(Duration::from_millis(50), move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        job.cancel();
        job.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(job.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_fires_until_cancelled() {
        let scheduler = Scheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        let job = scheduler.call_periodic(Duration::from_millis(100), move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        job.cancel();
        let seen = hits.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), seen);
    }
}
