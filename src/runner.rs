//! Runners drive observers from submission to completion under a deadline.
//!
//! Two interchangeable strategies share the [`Runner`] contract:
//!
//! - [`SharedRunner`] (the default): one worker task services every
//!   submitted observer, advancing timers by absolute deadlines. No parsing
//!   happens inside this worker — intake runs on the fan-out's dispatch
//!   context — so the task count stays flat under heavy fan-out.
//! - [`TaskRunner`]: one task per observer, timers registered with the
//!   [`Scheduler`]. Opt-in for observers whose completion waits are better
//!   kept independent.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::observer::{Observer, ObserverOutcome};
use crate::scheduler::Scheduler;

/// Upper bound on waiting for workers to go away during `shutdown`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The service that drives observers to completion under deadlines.
pub trait Runner: Send + Sync {
    /// Accept an observer for driving. Non-blocking. Fails with
    /// `AlreadySubmitted` if this observer was ever submitted before.
    fn submit(&self, observer: Arc<dyn Observer>) -> Result<(), Error>;

    /// Block until the observer is terminal or the deadline passes; on
    /// deadline, the observer is forced to done with `Timeout`.
    fn wait_for(
        &self,
        observer: &Arc<dyn Observer>,
        timeout: Duration,
    ) -> BoxFuture<'static, ObserverOutcome> {
        let observer = Arc::clone(observer);
        async move { observer.core().await_done(timeout).await }.boxed()
    }

    /// Cancel all outstanding observers, drain queues, release workers.
    /// Workers refusing to join within a bound are reported and leaked.
    fn shutdown(&self) -> BoxFuture<'static, ()>;
}

enum RunnerMessage {
    Submit(Arc<dyn Observer>),
    Shutdown(oneshot::Sender<()>),
}

/// One worker, many observers; see the module docs.
pub struct SharedRunner {
    messages: mpsc::UnboundedSender<RunnerMessage>,
    completions: mpsc::UnboundedSender<Uuid>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SharedRunner {
    /// Create the runner and start its worker. Must be called within a
    /// tokio runtime.
    pub fn new() -> Self {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(shared_worker(messages_rx, completions_rx));

        Self {
            messages: messages_tx,
            completions: completions_tx,
            worker: Mutex::new(Some(worker)),
        }
    }
}

impl Default for SharedRunner {
    fn default() -> Self {
        Self::new()
    }
}

async fn shared_worker(
    mut messages: mpsc::UnboundedReceiver<RunnerMessage>,
    mut completions: mpsc::UnboundedReceiver<Uuid>,
) {
    let mut active: HashMap<Uuid, Arc<dyn Observer>> = HashMap::new();
    // Min-heap of absolute deadlines; stale entries are skipped.
    let mut deadlines: BinaryHeap<Reverse<(tokio::time::Instant, Uuid)>> = BinaryHeap::new();

    loop {
        let next_deadline = deadlines.peek().map(|Reverse((at, _))| *at);

        tokio::select! {
            message = messages.recv() => match message {
                Some(RunnerMessage::Submit(observer)) => {
                    let core = observer.core();
                    let id = core.id();

                    // The observer may have completed between submission
                    // and us picking it up.
                    if core.done() {
                        core.finalize();
                        continue;
                    }

                    if let Some(at) = core.deadline() {
                        deadlines.push(Reverse((tokio::time::Instant::from_std(at), id)));
                    }
                    trace!(observer = %core.label(), %id, "Driving observer");
                    active.insert(id, observer);
                }
                Some(RunnerMessage::Shutdown(ack)) => {
                    debug!(outstanding = active.len(), "Runner shutting down");
                    for (_, observer) in active.drain() {
                        observer.core().cancel();
                        observer.core().finalize();
                    }
                    let _ = ack.send(());
                    break;
                }
                None => break,
            },

            Some(id) = completions.recv() => {
                if let Some(observer) = active.remove(&id) {
                    observer.core().finalize();
                }
            }

            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(tokio::time::Instant::now)),
                if next_deadline.is_some() =>
            {
                let now = tokio::time::Instant::now();
                while let Some(Reverse((at, id))) = deadlines.peek().copied() {
                    if at > now {
                        break;
                    }
                    deadlines.pop();
                    if let Some(observer) = active.get(&id) {
                        // Forcing the timeout raises a completion notice,
                        // which finalizes on the next loop turn.
                        observer.core().force_timeout();
                    }
                }
            }
        }
    }

    trace!("Runner worker stopped");
}

impl Runner for SharedRunner {
    fn submit(&self, observer: Arc<dyn Observer>) -> Result<(), Error> {
        observer.core().mark_submitted(self.completions.clone())?;
        self.messages
            .send(RunnerMessage::Submit(observer))
            .map_err(|_| Error::InternalError("runner is shut down".into()))
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        let messages = self.messages.clone();
        let worker = self.worker.lock().expect("runner lock").take();

        async move {
            let (ack_tx, ack_rx) = oneshot::channel();
            if messages.send(RunnerMessage::Shutdown(ack_tx)).is_ok()
                && tokio::time::timeout(JOIN_TIMEOUT, ack_rx).await.is_err()
            {
                warn!("Runner worker did not acknowledge shutdown, leaking it");
                return;
            }

            if let Some(handle) = worker {
                if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                    warn!("Runner worker did not join within bound, leaking it");
                }
            }
        }
        .boxed()
    }
}

/// One task per observer; timers via the [`Scheduler`].
pub struct TaskRunner {
    scheduler: Arc<Scheduler>,
    workers: Mutex<Vec<(Arc<dyn Observer>, JoinHandle<()>)>>,
}

impl TaskRunner {
    /// Create a runner registering its timers with `scheduler`.
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            workers: Mutex::new(Vec::new()),
        }
    }
}

impl Runner for TaskRunner {
    fn submit(&self, observer: Arc<dyn Observer>) -> Result<(), Error> {
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel();
        observer.core().mark_submitted(completion_tx)?;

        let timer = observer.core().deadline().map(|deadline| {
            let delay = deadline.saturating_duration_since(std::time::Instant::now());
            let for_timer = Arc::clone(&observer);
            self.scheduler.call_later(delay, move || {
                for_timer.core().force_timeout();
            })
        });

        let for_worker = Arc::clone(&observer);
        let worker = tokio::spawn(async move {
            // Parsing happens on the fan-out dispatch context; this task
            // only waits for the terminal state.
            let _ = completion_rx.recv().await;
            if let Some(timer) = timer {
                timer.cancel();
            }
            for_worker.core().finalize();
        });

        let mut workers = self.workers.lock().expect("task runner lock");
        workers.retain(|(_, handle)| !handle.is_finished());
        workers.push((observer, worker));
        Ok(())
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        let drained: Vec<_> = {
            let mut workers = self.workers.lock().expect("task runner lock");
            workers.drain(..).collect()
        };

        async move {
            for (observer, _) in &drained {
                observer.core().cancel();
            }
            for (observer, handle) in drained {
                if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                    warn!(
                        observer = %observer.core().label(),
                        "Observer worker did not join within bound, leaking it"
                    );
                }
            }
        }
        .boxed()
    }
}

/// The process-wide default runner (the shared single-worker variant).
/// Must first be touched from within a tokio runtime.
pub fn default_runner() -> Arc<dyn Runner> {
    static DEFAULT: OnceLock<Arc<SharedRunner>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| Arc::new(SharedRunner::new()))) as Arc<dyn Runner>
}
