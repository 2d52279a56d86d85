//! The observer future surface.
//!
//! Commands and events share one completion machine: a state that moves
//! `created -> running -> done | cancelled` exactly once, slots for the
//! result or the failure, done-subscribers invoked exactly once after the
//! terminal state is visible, and a completion signal the runner listens
//! on. The parsing halves live in [`crate::command`] and [`crate::event`];
//! everything future-like lives here.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{ConsumerId, FanoutConnection};
use crate::error::Error;

/// What an observer ultimately produced.
pub type ObserverOutcome = Result<Value, Error>;

/// Life stages of an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    /// Built but not started; intake not subscribed.
    Created,
    /// Subscribed and consuming chunks.
    Running,
    /// Terminal with a result or failure stored.
    Done,
    /// Terminal via `cancel()`.
    Cancelled,
}

/// Token for removing a done-subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DoneSubscription(u64);

type DoneSubscriber = Arc<dyn Fn(&ObserverOutcome) + Send + Sync>;

struct CoreInner {
    state: ObserverState,
    timeout: Duration,
    started_at: Option<Instant>,
    result: Option<Value>,
    failure: Option<Error>,
    consumer_id: Option<ConsumerId>,
    done_subscribers: HashMap<u64, DoneSubscriber>,
    next_subscriber_id: u64,
    finalized: bool,
    submitted: bool,
    completion_tx: Option<mpsc::UnboundedSender<Uuid>>,
}

/// The future half of an observer, shared by [`crate::command::Command`]
/// and [`crate::event::Event`].
pub struct ObserverCore {
    id: Uuid,
    label: String,
    connection: Arc<FanoutConnection>,
    inner: Mutex<CoreInner>,
    done: Notify,
}

impl std::fmt::Debug for ObserverCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverCore")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

impl ObserverCore {
    /// Create a core bound to one connection. The label shows up in logs.
    pub fn new(label: &str, connection: Arc<FanoutConnection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            connection,
            inner: Mutex::new(CoreInner {
                state: ObserverState::Created,
                timeout: Duration::ZERO,
                started_at: None,
                result: None,
                failure: None,
                consumer_id: None,
                done_subscribers: HashMap::new(),
                next_subscriber_id: 0,
                finalized: false,
                submitted: false,
                completion_tx: None,
            }),
            done: Notify::new(),
        }
    }

    /// Unique id of this observer.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Human-readable label, e.g. the command name.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The connection this observer is bound to.
    pub fn connection(&self) -> &Arc<FanoutConnection> {
        &self.connection
    }

    /// Current life stage.
    pub fn state(&self) -> ObserverState {
        self.lock().state
    }

    /// True once a terminal state (done or cancelled) is reached.
    pub fn done(&self) -> bool {
        matches!(
            self.state(),
            ObserverState::Done | ObserverState::Cancelled
        )
    }

    /// True while consuming chunks.
    pub fn running(&self) -> bool {
        self.state() == ObserverState::Running
    }

    /// True if `cancel()` won.
    pub fn cancelled(&self) -> bool {
        self.state() == ObserverState::Cancelled
    }

    /// The deadline derived from start time and timeout, once started.
    pub fn deadline(&self) -> Option<Instant> {
        let inner = self.lock();
        inner.started_at.map(|at| at + inner.timeout)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoreInner> {
        self.inner.lock().expect("observer lock")
    }

    /// Move `created -> running`, recording the start time on the
    /// monotonic clock. The timeout clock starts here.
    pub(crate) fn start_running(&self, timeout: Duration) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state != ObserverState::Created {
            return Err(Error::AlreadyStarted);
        }
        inner.state = ObserverState::Running;
        inner.timeout = timeout;
        inner.started_at = Some(Instant::now());
        debug!(observer = %self.label, id = %self.id, ?timeout, "Started");
        Ok(())
    }

    /// Remember the fan-out subscription so it can be removed on finalize.
    pub(crate) fn record_subscription(&self, id: ConsumerId) {
        self.lock().consumer_id = Some(id);
    }

    /// Called by a runner accepting this observer. Fails the second time.
    pub(crate) fn mark_submitted(
        &self,
        completion_tx: mpsc::UnboundedSender<Uuid>,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.submitted {
            return Err(Error::AlreadySubmitted);
        }
        inner.submitted = true;
        inner.completion_tx = Some(completion_tx);
        Ok(())
    }

    /// Store the final result. Legal exactly once; triggers the terminal
    /// transition.
    pub fn set_result(&self, value: Value) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            if is_terminal(inner.state) {
                return Err(Error::AlreadyDone);
            }
            inner.result = Some(value);
            inner.state = ObserverState::Done;
        }
        self.after_terminal();
        Ok(())
    }

    /// Store a failure. Legal exactly once; triggers the terminal
    /// transition.
    pub fn set_exception(&self, failure: Error) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            if is_terminal(inner.state) {
                return Err(Error::AlreadyDone);
            }
            debug!(observer = %self.label, id = %self.id, %failure, "Failed");
            inner.failure = Some(failure);
            inner.state = ObserverState::Done;
        }
        self.after_terminal();
        Ok(())
    }

    /// Transition to cancelled. Idempotent; returns whether this call won.
    pub fn cancel(&self) -> bool {
        {
            let mut inner = self.lock();
            if is_terminal(inner.state) {
                return false;
            }
            inner.state = ObserverState::Cancelled;
            debug!(observer = %self.label, id = %self.id, "Cancelled");
        }
        self.after_terminal();
        true
    }

    /// Force a `Timeout` failure if still running. Returns whether this
    /// call performed the transition.
    pub(crate) fn force_timeout(&self) -> bool {
        {
            let mut inner = self.lock();
            if inner.state != ObserverState::Running {
                return false;
            }
            let elapsed = inner
                .started_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            inner.failure = Some(Error::Timeout {
                allowed: inner.timeout,
                elapsed,
            });
            inner.state = ObserverState::Done;
            debug!(observer = %self.label, id = %self.id, ?elapsed, "Timed out");
        }
        self.after_terminal();
        true
    }

    /// The transport closed under us; fail with `ConnectionLost` if still
    /// running.
    pub(crate) fn on_connection_lost(&self) {
        let name = self.connection.name().to_string();
        {
            let mut inner = self.lock();
            if is_terminal(inner.state) {
                return;
            }
            inner.failure = Some(Error::ConnectionLost(name));
            inner.state = ObserverState::Done;
        }
        self.after_terminal();
    }

    /// Wake awaiters and tell the runner, after the terminal state became
    /// visible.
    fn after_terminal(&self) {
        self.done.notify_waiters();
        let tx = self.lock().completion_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(self.id);
        }
    }

    /// The stored result or failure.
    ///
    /// Fails with `NotDone` before the terminal state, `Cancelled` after
    /// cancellation, or the stored failure.
    pub fn outcome(&self) -> ObserverOutcome {
        let inner = self.lock();
        if let Some(failure) = &inner.failure {
            return Err(failure.clone());
        }
        match inner.state {
            ObserverState::Cancelled => Err(Error::Cancelled),
            ObserverState::Done => Ok(inner.result.clone().unwrap_or(Value::Null)),
            _ => Err(Error::NotDone),
        }
    }

    /// The stored failure, if any.
    pub fn exception(&self) -> Option<Error> {
        self.lock().failure.clone()
    }

    /// Block (asynchronously) until terminal or until `timeout` passes.
    ///
    /// On expiry while still running, the observer is forced to done with
    /// `Timeout` exactly as the runner's timer would do it; elapsed time is
    /// measured from `start()`. Awaiting a never-started observer fails
    /// with `NotDone` right away.
    pub async fn await_done(&self, timeout: Duration) -> ObserverOutcome {
        if self.state() == ObserverState::Created {
            return Err(Error::NotDone);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.done() {
                return self.outcome();
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.force_timeout();
                    return self.outcome();
                }
            }
        }
    }

    /// Register a callback invoked once with the outcome when the observer
    /// terminates. If already terminal, the callback runs immediately on
    /// the caller's context and is not registered.
    pub fn add_done_subscriber<F>(&self, subscriber: F) -> DoneSubscription
    where
        F: Fn(&ObserverOutcome) + Send + Sync + 'static,
    {
        let immediate = {
            let mut inner = self.lock();
            if is_terminal(inner.state) {
                true
            } else {
                let id = inner.next_subscriber_id;
                inner.next_subscriber_id += 1;
                inner.done_subscribers.insert(id, Arc::new(subscriber));
                return DoneSubscription(id);
            }
        };

        debug_assert!(immediate);
        let outcome = self.outcome();
        subscriber(&outcome);
        DoneSubscription(u64::MAX)
    }

    /// Remove a done-subscriber. Returns whether it was registered.
    pub fn remove_done_subscriber(&self, subscription: DoneSubscription) -> bool {
        self.lock().done_subscribers.remove(&subscription.0).is_some()
    }

    /// Runner-side cleanup: remove the fan-out subscription and fire the
    /// done-subscribers, both exactly once across all paths.
    pub(crate) fn finalize(&self) {
        let (consumer_id, subscribers) = {
            let mut inner = self.lock();
            if inner.finalized {
                return;
            }
            inner.finalized = true;
            let subscribers: Vec<DoneSubscriber> =
                inner.done_subscribers.drain().map(|(_, s)| s).collect();
            (inner.consumer_id.take(), subscribers)
        };

        if let Some(id) = consumer_id {
            self.connection.unsubscribe(id);
        }

        let outcome = self.outcome();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&outcome))).is_err() {
                warn!(observer = %self.label, id = %self.id, "Done-subscriber panicked");
            }
        }
    }
}

fn is_terminal(state: ObserverState) -> bool {
    matches!(state, ObserverState::Done | ObserverState::Cancelled)
}

/// Anything a runner can drive: commands, events, and test doubles.
pub trait Observer: Send + Sync {
    /// Access the shared future surface.
    fn core(&self) -> &ObserverCore;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::{FanoutConnectionBuilder, TransportChannels};

    fn connection() -> Arc<FanoutConnection> {
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        // Keep the wire open for the duration of the test.
        std::mem::forget(_in_tx);
        FanoutConnectionBuilder::new("test").attach(TransportChannels {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }

    #[tokio::test]
    async fn result_before_done_is_rejected() {
        let core = ObserverCore::new("obs", connection());
        assert_eq!(core.outcome(), Err(Error::NotDone));

        core.start_running(Duration::from_secs(1)).unwrap();
        assert_eq!(core.outcome(), Err(Error::NotDone));

        core.set_result(json!({"ok": true})).unwrap();
        assert_eq!(core.outcome(), Ok(json!({"ok": true})));
    }

    #[tokio::test]
    async fn double_start_fails() {
        let core = ObserverCore::new("obs", connection());
        core.start_running(Duration::from_secs(1)).unwrap();
        assert_eq!(
            core.start_running(Duration::from_secs(1)),
            Err(Error::AlreadyStarted)
        );
    }

    #[tokio::test]
    async fn set_result_twice_fails() {
        let core = ObserverCore::new("obs", connection());
        core.start_running(Duration::from_secs(1)).unwrap();
        core.set_result(Value::Null).unwrap();
        assert_eq!(core.set_result(Value::Null), Err(Error::AlreadyDone));
        assert_eq!(
            core.set_exception(Error::Cancelled),
            Err(Error::AlreadyDone)
        );
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_visible_to_awaiters() {
        let core = Arc::new(ObserverCore::new("obs", connection()));
        core.start_running(Duration::from_secs(5)).unwrap();

        assert!(core.cancel());
        assert!(!core.cancel());
        assert!(core.cancelled());
        assert!(core.done());

        let outcome = core.await_done(Duration::from_millis(100)).await;
        assert_eq!(outcome, Err(Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn await_done_forces_timeout_on_deadline() {
        let core = Arc::new(ObserverCore::new("obs", connection()));
        core.start_running(Duration::from_millis(200)).unwrap();

        let outcome = core.await_done(Duration::from_millis(500)).await;
        match outcome {
            Err(Error::Timeout { allowed, .. }) => {
                assert_eq!(allowed, Duration::from_millis(200))
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn done_subscriber_after_terminal_runs_immediately() {
        let core = ObserverCore::new("obs", connection());
        core.start_running(Duration::from_secs(1)).unwrap();
        core.set_result(json!(1)).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        core.add_done_subscriber(move |outcome| {
            assert_eq!(outcome, &Ok(json!(1)));
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finalize_fires_subscribers_exactly_once() {
        let core = ObserverCore::new("obs", connection());
        core.start_running(Duration::from_secs(1)).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        core.add_done_subscriber(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        core.set_result(Value::Null).unwrap();
        core.finalize();
        core.finalize();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
