//! Events: long-lived observers matching patterns against inbound text.
//!
//! An event watches every complete line on its connection and publishes an
//! occurrence for each pattern match. It runs until cancelled or until the
//! connection closes, unless built to stop after a fixed number of
//! matches, in which case the collected occurrences become its result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::connection::{FanoutConnection, InboundChunk, StreamConsumer};
use crate::error::Error;
use crate::observer::{
    DoneSubscription, Observer, ObserverCore, ObserverOutcome, ObserverState,
};
use crate::publisher::{Publisher, Subscription};
use crate::runner::Runner;

/// One pattern match on the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventOccurrence {
    /// The full matched text.
    pub matched: String,
    /// Named capture groups of the matching pattern.
    pub groups: HashMap<String, String>,
    /// Timestamp of the chunk that carried the match.
    pub at: DateTime<Utc>,
}

struct EventBuffer {
    pending: String,
    occurrences: Vec<EventOccurrence>,
}

struct EventInner {
    core: ObserverCore,
    runner: Arc<dyn Runner>,
    patterns: Vec<Regex>,
    publisher: Publisher<EventOccurrence>,
    buffer: Mutex<EventBuffer>,
    stop_after: Option<usize>,
}

impl EventInner {
    fn match_line(&self, line: &str, at: DateTime<Utc>) -> Option<EventOccurrence> {
        for pattern in &self.patterns {
            if let Some(captures) = pattern.captures(line) {
                let groups = pattern
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        captures
                            .name(name)
                            .map(|value| (name.to_string(), value.as_str().to_string()))
                    })
                    .collect();

                return Some(EventOccurrence {
                    matched: captures
                        .get(0)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                    groups,
                    at,
                });
            }
        }
        None
    }
}

impl StreamConsumer for EventInner {
    fn feed(&self, chunk: &InboundChunk) {
        if self.core.done() {
            return;
        }

        let mut finished: Option<Vec<EventOccurrence>> = None;
        {
            let mut buffer = self.buffer.lock().expect("event buffer lock");
            buffer.pending.push_str(&chunk.text);

            while let Some(newline_at) = buffer.pending.find('\n') {
                let raw: String = buffer.pending.drain(..=newline_at).collect();
                let line = raw.trim_end_matches(['\n', '\r']);

                if let Some(occurrence) = self.match_line(line, chunk.received_at) {
                    debug!(event = %self.core.label(), matched = %occurrence.matched, "Event fired");
                    buffer.occurrences.push(occurrence.clone());
                    self.publisher.notify_subscribers(&occurrence);

                    if let Some(limit) = self.stop_after {
                        if buffer.occurrences.len() >= limit {
                            finished = Some(buffer.occurrences.clone());
                            break;
                        }
                    }
                }
            }
        }

        if let Some(occurrences) = finished {
            let _ = self.core.set_result(
                serde_json::to_value(occurrences)
                    .unwrap_or_else(|_| Value::Array(vec![])),
            );
        }
    }

    fn connection_lost(&self) {
        self.core.on_connection_lost();
    }

    fn internal_failure(&self, reason: &str) {
        let _ = self.core.set_exception(Error::InternalError(reason.into()));
    }
}

impl Observer for EventInner {
    fn core(&self) -> &ObserverCore {
        &self.core
    }
}

/// A long-lived pattern-matching observer. Cheap to clone; all clones
/// refer to the same execution.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("label", &self.inner.core.label())
            .field("state", &self.inner.core.state())
            .finish()
    }
}

impl Event {
    /// Build an event matching any of `patterns`, running until cancelled.
    pub fn new(
        label: &str,
        connection: Arc<FanoutConnection>,
        runner: Arc<dyn Runner>,
        patterns: Vec<Regex>,
    ) -> Self {
        Self::with_stop_after(label, connection, runner, patterns, None)
    }

    /// Build an event that self-terminates after `stop_after` matches,
    /// storing the collected occurrences as its result.
    pub fn with_stop_after(
        label: &str,
        connection: Arc<FanoutConnection>,
        runner: Arc<dyn Runner>,
        patterns: Vec<Regex>,
        stop_after: Option<usize>,
    ) -> Self {
        Self {
            inner: Arc::new(EventInner {
                core: ObserverCore::new(label, connection),
                runner,
                patterns,
                publisher: Publisher::new(),
                buffer: Mutex::new(EventBuffer {
                    pending: String::new(),
                    occurrences: Vec::new(),
                }),
                stop_after,
            }),
        }
    }

    /// Subscribe the intake and hand the event to the runner.
    pub fn start(&self, timeout: Duration) -> Result<(), Error> {
        self.inner.core.start_running(timeout)?;

        let consumer: Arc<dyn StreamConsumer> = Arc::clone(&self.inner) as _;
        let id = self.inner.core.connection().subscribe(consumer);
        self.inner.core.record_subscription(id);

        let observer: Arc<dyn Observer> = Arc::clone(&self.inner) as _;
        self.inner.runner.submit(observer)?;

        info!(
            event = %self.inner.core.label(),
            connection = %self.inner.core.connection().name(),
            "Watching for event"
        );
        Ok(())
    }

    /// Await the terminal state, bounded by `timeout`.
    pub async fn await_done(&self, timeout: Duration) -> ObserverOutcome {
        self.inner.core.await_done(timeout).await
    }

    /// Subscribe for occurrences. No replay: matches published before
    /// subscription are not delivered.
    pub fn subscribe<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&EventOccurrence) + Send + Sync + 'static,
    {
        self.inner.publisher.subscribe(subscriber)
    }

    /// Remove an occurrence subscription.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.inner.publisher.unsubscribe(subscription)
    }

    /// Snapshot of the occurrences recorded so far.
    pub fn occurrences(&self) -> Vec<EventOccurrence> {
        self.inner
            .buffer
            .lock()
            .expect("event buffer lock")
            .occurrences
            .clone()
    }

    /// Cancel the event; idempotent.
    pub fn cancel(&self) -> bool {
        self.inner.core.cancel()
    }

    /// True once terminal.
    pub fn done(&self) -> bool {
        self.inner.core.done()
    }

    /// True while watching the stream.
    pub fn running(&self) -> bool {
        self.inner.core.running()
    }

    /// True if cancelled.
    pub fn cancelled(&self) -> bool {
        self.inner.core.cancelled()
    }

    /// Current life stage.
    pub fn state(&self) -> ObserverState {
        self.inner.core.state()
    }

    /// The stored result; fails with `NotDone` before completion.
    pub fn result(&self) -> ObserverOutcome {
        self.inner.core.outcome()
    }

    /// The stored failure, if any.
    pub fn exception(&self) -> Option<Error> {
        self.inner.core.exception()
    }

    /// Register a completion callback.
    pub fn add_done_subscriber<F>(&self, subscriber: F) -> DoneSubscription
    where
        F: Fn(&ObserverOutcome) + Send + Sync + 'static,
    {
        self.inner.core.add_done_subscriber(subscriber)
    }

    /// Remove a completion callback.
    pub fn remove_done_subscriber(&self, subscription: DoneSubscription) -> bool {
        self.inner.core.remove_done_subscriber(subscription)
    }

    /// The observer view of this event.
    pub fn as_observer(&self) -> Arc<dyn Observer> {
        Arc::clone(&self.inner) as _
    }
}
