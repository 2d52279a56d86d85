//! Commands: observers that write a CMD string and parse its output.
//!
//! A command subscribes its intake to the connection *before* putting the
//! CMD string on the wire, so no output can be lost. Output is split into
//! lines and handed to a [`CommandParser`]; the command completes once the
//! expected prompt is seen and the parser reports no outstanding
//! continuation. Error patterns win over the prompt when both show up in
//! the same chunk.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::connection::{FanoutConnection, InboundChunk, StreamConsumer};
use crate::error::Error;
use crate::observer::{
    DoneSubscription, Observer, ObserverCore, ObserverOutcome, ObserverState,
};
use crate::runner::Runner;

/// Free-form parameters for command/event construction, as found in
/// configuration hop tables.
pub type Params = serde_json::Map<String, Value>;

/// What a parser concluded from one line of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineVerdict {
    /// Nothing to act on; keep feeding lines.
    Continue,
    /// Write this line back on the connection (password prompts,
    /// host-key confirmations). The parse machine sends it verbatim.
    Respond(String),
    /// The output indicates the CMD failed; the command concludes with
    /// `CommandFailure` carrying the reason.
    Failed(String),
}

/// Parses the output of one CMD into a structured result.
///
/// `on_line` is called for every complete line (with `is_full_line ==
/// true`) and for the trailing partial line of each chunk (`false`) —
/// prompts such as `Password:` arrive without a newline. Parsers observing
/// partial lines repeatedly must track what they already acted on.
pub trait CommandParser: Send {
    /// The CMD string to put on the wire, without trailing newline.
    fn command_string(&self) -> String;

    /// Inspect one line of output.
    fn on_line(&mut self, line: &str, is_full_line: bool) -> LineVerdict;

    /// Whether a multi-line continuation is outstanding; a prompt match
    /// does not complete the command while this is true.
    fn pending_continuation(&self) -> bool {
        false
    }

    /// Build the final structured result once the prompt was seen.
    fn finish(&mut self) -> Result<Value, Error>;
}

struct ParseMachine {
    parser: Box<dyn CommandParser>,
    prompt: Regex,
    command_string: String,
    pending: String,
    echo_skipped: bool,
    failure: Option<String>,
    complete: bool,
}

enum Step {
    Incomplete,
    Complete(Result<Value, Error>),
}

impl ParseMachine {
    fn consume(&mut self, text: &str, responds: &mut Vec<String>) -> Step {
        if self.complete {
            return Step::Incomplete;
        }
        self.pending.push_str(text);

        while let Some(newline_at) = self.pending.find('\n') {
            let raw: String = self.pending.drain(..=newline_at).collect();
            let line = raw.trim_end_matches(['\n', '\r']);

            if !self.echo_skipped && line.contains(self.command_string.as_str()) {
                self.echo_skipped = true;
                continue;
            }

            self.apply_verdict(line, true, responds);
            // Error indications win: they conclude right away, before any
            // prompt later in the same chunk gets a say.
            if self.failure.is_some() || self.prompt_completes(line) {
                return Step::Complete(self.conclude());
            }
        }

        if !self.pending.is_empty() {
            let partial = self.pending.clone();
            self.apply_verdict(&partial, false, responds);
            if self.failure.is_some() || self.prompt_completes(&partial) {
                return Step::Complete(self.conclude());
            }
        }

        Step::Incomplete
    }

    fn apply_verdict(&mut self, line: &str, is_full_line: bool, responds: &mut Vec<String>) {
        match self.parser.on_line(line, is_full_line) {
            LineVerdict::Continue => {}
            LineVerdict::Respond(reply) => responds.push(reply),
            LineVerdict::Failed(reason) => {
                // First recorded failure wins; it takes precedence over a
                // prompt seen in the same chunk.
                if self.failure.is_none() {
                    self.failure = Some(reason);
                }
            }
        }
    }

    fn prompt_completes(&self, line: &str) -> bool {
        self.prompt.is_match(line) && !self.parser.pending_continuation()
    }

    fn conclude(&mut self) -> Result<Value, Error> {
        self.complete = true;
        self.pending.clear();

        if let Some(reason) = self.failure.take() {
            return Err(Error::CommandFailure {
                command: self.command_string.clone(),
                reason,
            });
        }
        self.parser.finish()
    }
}

struct CommandInner {
    core: ObserverCore,
    runner: Arc<dyn Runner>,
    machine: Mutex<ParseMachine>,
}

impl StreamConsumer for CommandInner {
    fn feed(&self, chunk: &InboundChunk) {
        if self.core.done() {
            return;
        }

        let mut responds = Vec::new();
        let step = {
            let mut machine = self.machine.lock().expect("parse machine lock");
            machine.consume(&chunk.text, &mut responds)
        };

        // Writes to the wire are queue pushes; intake never blocks on them.
        for reply in responds {
            if let Err(failure) = self.core.connection().sendline(&reply) {
                let _ = self.core.set_exception(failure);
                return;
            }
        }

        match step {
            Step::Incomplete => {}
            Step::Complete(Ok(value)) => {
                let _ = self.core.set_result(value);
            }
            Step::Complete(Err(failure)) => {
                let _ = self.core.set_exception(failure);
            }
        }
    }

    fn connection_lost(&self) {
        self.core.on_connection_lost();
    }

    fn internal_failure(&self, reason: &str) {
        let _ = self.core.set_exception(Error::InternalError(reason.into()));
    }
}

impl Observer for CommandInner {
    fn core(&self) -> &ObserverCore {
        &self.core
    }
}

/// A single-shot observer that actively runs a CMD on the device.
///
/// Cheap to clone; all clones refer to the same execution.
#[derive(Clone)]
pub struct Command {
    inner: Arc<CommandInner>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("command", &self.command_string())
            .field("state", &self.inner.core.state())
            .finish()
    }
}

impl Command {
    /// Bind a parser to a connection and runner. `expected_prompt` is the
    /// device's readiness pattern, compiled once here.
    pub fn new(
        connection: Arc<FanoutConnection>,
        runner: Arc<dyn Runner>,
        expected_prompt: Regex,
        parser: Box<dyn CommandParser>,
    ) -> Self {
        let command_string = parser.command_string();
        let label = command_string
            .split_whitespace()
            .next()
            .unwrap_or("command")
            .to_string();

        Self {
            inner: Arc::new(CommandInner {
                core: ObserverCore::new(&label, connection),
                runner,
                machine: Mutex::new(ParseMachine {
                    parser,
                    prompt: expected_prompt,
                    command_string,
                    pending: String::new(),
                    echo_skipped: false,
                    failure: None,
                    complete: false,
                }),
            }),
        }
    }

    /// The CMD string this command puts on the wire.
    pub fn command_string(&self) -> String {
        self.inner
            .machine
            .lock()
            .expect("parse machine lock")
            .command_string
            .clone()
    }

    /// Begin background execution: subscribe the intake, hand the command
    /// to the runner, then write the CMD string followed by a newline.
    pub fn start(&self, timeout: Duration) -> Result<(), Error> {
        let command_string = self.command_string();
        self.inner.core.start_running(timeout)?;

        let consumer: Arc<dyn StreamConsumer> = Arc::clone(&self.inner) as _;
        let id = self.inner.core.connection().subscribe(consumer);
        self.inner.core.record_subscription(id);

        let observer: Arc<dyn Observer> = Arc::clone(&self.inner) as _;
        self.inner.runner.submit(observer)?;

        info!(
            command = %command_string,
            connection = %self.inner.core.connection().name(),
            "Sending command"
        );
        if let Err(failure) = self.inner.core.connection().sendline(&command_string) {
            let _ = self.inner.core.set_exception(failure.clone());
            return Err(failure);
        }
        Ok(())
    }

    /// Await the parsed result, bounded by `timeout`.
    pub async fn await_done(&self, timeout: Duration) -> ObserverOutcome {
        let outcome = self.inner.core.await_done(timeout).await;
        debug!(command = %self.command_string(), ok = outcome.is_ok(), "Command finished");
        outcome
    }

    /// The callable shape: `start` then `await_done` sharing the deadline.
    pub async fn run(&self, timeout: Duration) -> ObserverOutcome {
        self.start(timeout)?;
        self.await_done(timeout).await
    }

    /// Cancel execution; idempotent.
    pub fn cancel(&self) -> bool {
        self.inner.core.cancel()
    }

    /// True once terminal.
    pub fn done(&self) -> bool {
        self.inner.core.done()
    }

    /// True while consuming output.
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

    /// Register a completion callback; see
    /// [`ObserverCore::add_done_subscriber`].
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

    /// The observer view of this command, e.g. for direct runner use.
    pub fn as_observer(&self) -> Arc<dyn Observer> {
        Arc::clone(&self.inner) as _
    }
}
