//! Per-target operational state machine.
//!
//! A device binds one fan-out connection to a labelled directed graph of
//! states. Edges carry hop actions: opening/closing the transport, or
//! running a command whose success effects the transition. Commands and
//! events are looked up in per-state registries, so what a test may run
//! depends on where the device currently is.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use regex::Regex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cmd::default_prompt;
use crate::command::{Command, CommandParser, Params};
use crate::connection::{FanoutConnection, FanoutConnectionBuilder, TransportChannels};
use crate::error::Error;
use crate::event::Event;
use crate::publisher::{Publisher, Subscription};
use crate::runner::Runner;

pub mod unix;

/// The state every device begins in and returns to when its transport
/// goes away.
pub const NOT_CONNECTED: &str = "NOT_CONNECTED";

/// Why a device changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// A hop command succeeded.
    Hop,
    /// A hop failed; the device stays where it was.
    Failure,
    /// The transport reported closure.
    ConnectionLost,
    /// The device was closed.
    Closed,
    /// Auto-reconnect restored the former state.
    Reconnected,
}

impl std::fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ChangeReason::Hop => "hop",
            ChangeReason::Failure => "failure",
            ChangeReason::ConnectionLost => "connection_lost",
            ChangeReason::Closed => "closed",
            ChangeReason::Reconnected => "reconnected",
        };
        write!(f, "{label}")
    }
}

/// Payload of a state-change notification, published after the new state
/// is stored.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    /// State before the change.
    pub from: String,
    /// State after the change (equals `from` when a hop failed).
    pub to: String,
    /// Why the change happened.
    pub reason: ChangeReason,
    /// When the change was stored.
    pub at: DateTime<Utc>,
}

/// A configured command hop between two states.
#[derive(Debug, Clone)]
pub struct HopSpec {
    /// Name of the command to run, looked up in the from-state registry.
    pub execute_command: String,
    /// Parameters handed to the command factory. May carry
    /// `expected_prompt` to override the to-state's prompt.
    pub command_params: Params,
}

/// How an edge of the state graph is effected.
#[derive(Debug, Clone)]
pub enum Hop {
    /// Open the transport (leaving `NOT_CONNECTED`).
    Open,
    /// Close the transport (entering `NOT_CONNECTED`).
    Close,
    /// Run a command; its success completes the transition.
    Run(HopSpec),
}

/// Auto-reconnect backoff: `initial`, multiplied by `factor` per failed
/// attempt, capped at `max`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub initial: Duration,
    /// Multiplier applied after each failed attempt.
    pub factor: u32,
    /// Upper bound on the delay.
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2,
            max: Duration::from_secs(30),
        }
    }
}

/// What an event registry entry produces.
pub struct EventSpec {
    /// Patterns matched against each line.
    pub patterns: Vec<Regex>,
    /// Self-terminate after this many matches.
    pub stop_after: Option<usize>,
}

/// Produces the transport when the device opens or reconnects.
pub type TransportFactory = Arc<dyn Fn() -> Result<TransportChannels, Error> + Send + Sync>;

type ParserFactory = Box<dyn Fn(&Params) -> Result<Box<dyn CommandParser>, Error> + Send + Sync>;
type EventFactory = Box<dyn Fn(&Params) -> Result<EventSpec, Error> + Send + Sync>;

/// Handle to a background state transition started with
/// [`Device::goto_state_bg`].
#[derive(Debug)]
pub struct Transition {
    rx: oneshot::Receiver<Result<(), Error>>,
}

impl Transition {
    /// Await the transition outcome.
    pub async fn await_done(self) -> Result<(), Error> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::InternalError("transition worker vanished".into())))
    }
}

/// Builder for a [`Device`]. Device classes (see [`unix`]) use this to
/// register states, prompts, hops, and per-state command/event factories.
pub struct DeviceBuilder {
    name: String,
    runner: Arc<dyn Runner>,
    transport_factory: TransportFactory,
    local_state: String,
    states: BTreeSet<String>,
    hops: BTreeMap<String, BTreeMap<String, Hop>>,
    prompts: HashMap<String, Regex>,
    cmds: HashMap<String, HashMap<String, ParserFactory>>,
    events: HashMap<String, HashMap<String, EventFactory>>,
    reconnect: Option<ReconnectPolicy>,
    hop_timeout: Duration,
}

impl DeviceBuilder {
    /// Start building a device.
    pub fn new(name: &str, runner: Arc<dyn Runner>, transport_factory: TransportFactory) -> Self {
        let mut states = BTreeSet::new();
        states.insert(NOT_CONNECTED.to_string());

        Self {
            name: name.into(),
            runner,
            transport_factory,
            local_state: NOT_CONNECTED.into(),
            states,
            hops: BTreeMap::new(),
            prompts: HashMap::new(),
            cmds: HashMap::new(),
            events: HashMap::new(),
            reconnect: None,
            hop_timeout: Duration::from_secs(10),
        }
    }

    /// Declare a state.
    pub fn state(mut self, state: &str) -> Self {
        self.states.insert(state.into());
        self
    }

    /// Mark the state `close()` retreats to before dropping the transport.
    pub fn local_state(mut self, state: &str) -> Self {
        self.local_state = state.into();
        self
    }

    /// The readiness prompt shown while in `state`.
    pub fn prompt(mut self, state: &str, prompt: Regex) -> Self {
        self.prompts.insert(state.into(), prompt);
        self
    }

    /// Annotate the edge `from -> to` with a hop action.
    pub fn hop(mut self, from: &str, to: &str, hop: Hop) -> Self {
        self.states.insert(from.into());
        self.states.insert(to.into());
        self.hops
            .entry(from.into())
            .or_default()
            .insert(to.into(), hop);
        self
    }

    /// Register a command factory for `state`.
    pub fn cmd<F>(mut self, state: &str, name: &str, factory: F) -> Self
    where
        F: Fn(&Params) -> Result<Box<dyn CommandParser>, Error> + Send + Sync + 'static,
    {
        self.cmds
            .entry(state.into())
            .or_default()
            .insert(name.into(), Box::new(factory));
        self
    }

    /// Register an event factory for `state`.
    pub fn event<F>(mut self, state: &str, name: &str, factory: F) -> Self
    where
        F: Fn(&Params) -> Result<EventSpec, Error> + Send + Sync + 'static,
    {
        self.events
            .entry(state.into())
            .or_default()
            .insert(name.into(), Box::new(factory));
        self
    }

    /// Enable auto-reconnect with the given backoff.
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Timeout applied to each hop command (default 10 s).
    pub fn hop_timeout(mut self, timeout: Duration) -> Self {
        self.hop_timeout = timeout;
        self
    }

    /// Finish; the device starts in `NOT_CONNECTED` with no transport
    /// attached.
    pub fn build(self) -> Arc<Device> {
        info!(device = %self.name, states = self.states.len(), "Created device");
        Arc::new_cyclic(|weak_self| Device {
            weak_self: weak_self.clone(),
            name: self.name,
            runner: self.runner,
            transport_factory: self.transport_factory,
            local_state: self.local_state,
            states: self.states,
            hops: self.hops,
            prompts: self.prompts,
            cmds: self.cmds,
            events: self.events,
            reconnect: self.reconnect,
            hop_timeout: self.hop_timeout,
            connection: StdMutex::new(None),
            state: StdMutex::new(NOT_CONNECTED.to_string()),
            transitions: tokio::sync::Mutex::new(()),
            state_changes: Publisher::new(),
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        })
    }
}

/// A named state machine bound to one connection and a catalog of
/// commands/events indexed by state.
pub struct Device {
    weak_self: Weak<Device>,
    name: String,
    runner: Arc<dyn Runner>,
    transport_factory: TransportFactory,
    local_state: String,
    states: BTreeSet<String>,
    hops: BTreeMap<String, BTreeMap<String, Hop>>,
    prompts: HashMap<String, Regex>,
    cmds: HashMap<String, HashMap<String, ParserFactory>>,
    events: HashMap<String, HashMap<String, EventFactory>>,
    reconnect: Option<ReconnectPolicy>,
    hop_timeout: Duration,

    connection: StdMutex<Option<Arc<FanoutConnection>>>,
    state: StdMutex<String>,
    /// Serializes `goto_state`; concurrent callers queue here.
    transitions: tokio::sync::Mutex<()>,
    state_changes: Publisher<StateChange>,
    closed: AtomicBool,
    reconnecting: AtomicBool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("state", &self.current_state())
            .finish()
    }
}

impl Device {
    /// The device's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn arc(&self) -> Arc<Device> {
        self.weak_self.upgrade().expect("device is alive")
    }

    /// The current state.
    pub fn current_state(&self) -> String {
        self.state.lock().expect("state lock").clone()
    }

    /// The connection, once a transport was attached.
    pub fn connection(&self) -> Option<Arc<FanoutConnection>> {
        self.connection.lock().expect("connection lock").clone()
    }

    /// Subscribe for state-change notifications.
    pub fn add_state_change_subscriber<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.state_changes.subscribe(subscriber)
    }

    /// Remove a state-change subscription.
    pub fn remove_state_change_subscriber(&self, subscription: Subscription) -> bool {
        self.state_changes.unsubscribe(subscription)
    }

    /// Construct the command registered as `name` for the current state,
    /// bound to this device's connection.
    pub fn get_cmd(&self, name: &str, params: Params) -> Result<Command, Error> {
        let state = self.current_state();
        let factory = self
            .cmds
            .get(&state)
            .and_then(|registry| registry.get(name))
            .ok_or_else(|| Error::NotAllowed {
                name: name.into(),
                state: state.clone(),
            })?;

        let parser = factory(&params)?;
        let prompt = self.prompt_from_params(&params, &state)?;
        let connection = self
            .connection()
            .ok_or_else(|| Error::ConnectionLost(self.name.clone()))?;

        Ok(Command::new(
            connection,
            Arc::clone(&self.runner),
            prompt,
            parser,
        ))
    }

    /// Construct the event registered as `name` for the current state.
    pub fn get_event(&self, name: &str, params: Params) -> Result<Event, Error> {
        let state = self.current_state();
        let factory = self
            .events
            .get(&state)
            .and_then(|registry| registry.get(name))
            .ok_or_else(|| Error::NotAllowed {
                name: name.into(),
                state: state.clone(),
            })?;

        let spec = factory(&params)?;
        let connection = self
            .connection()
            .ok_or_else(|| Error::ConnectionLost(self.name.clone()))?;

        Ok(Event::with_stop_after(
            name,
            connection,
            Arc::clone(&self.runner),
            spec.patterns,
            spec.stop_after,
        ))
    }

    fn prompt_from_params(&self, params: &Params, state: &str) -> Result<Regex, Error> {
        if let Some(pattern) = params.get("expected_prompt").and_then(|v| v.as_str()) {
            return Regex::new(pattern)
                .map_err(|e| Error::BadConfig(format!("bad `expected_prompt` pattern: {e}")));
        }
        Ok(self
            .prompts
            .get(state)
            .cloned()
            .unwrap_or_else(default_prompt))
    }

    /// Walk the hop path to `target`, executing hop commands in order.
    ///
    /// Idempotent when already there. A failed hop leaves the device in
    /// the last state it reached and surfaces the failure wrapped in
    /// `HopFailure`. Concurrent calls are serialized.
    pub async fn goto_state(&self, target: &str, timeout: Duration) -> Result<(), Error> {
        let _guard = self.transitions.lock().await;
        self.goto_state_locked(target, timeout).await
    }

    async fn goto_state_locked(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        let current = self.current_state();
        if current == target {
            return Ok(());
        }
        if !self.states.contains(target) {
            return Err(Error::BadConfig(format!(
                "device `{}` has no state `{target}`",
                self.name
            )));
        }

        let path = self.shortest_path(&current, target)?;
        debug!(device = %self.name, path = %path.iter().join(" -> "), "Transition path");

        for pair in path.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            if let Err(failure) = self.execute_hop(from, to, timeout).await {
                self.state_changes.notify_subscribers(&StateChange {
                    from: from.clone(),
                    to: to.clone(),
                    reason: ChangeReason::Failure,
                    at: Utc::now(),
                });
                return Err(failure);
            }
            self.store_state(to, ChangeReason::Hop);
        }
        Ok(())
    }

    /// Like [`goto_state`](Self::goto_state), but returns immediately; the
    /// transition runs on a background task with the device's hop timeout.
    pub fn goto_state_bg(&self, target: &str) -> Transition {
        let (tx, rx) = oneshot::channel();
        let device = self.arc();
        let target = target.to_string();
        let timeout = self.hop_timeout;

        tokio::spawn(async move {
            let result = device.goto_state(&target, timeout).await;
            let _ = tx.send(result);
        });

        Transition { rx }
    }

    /// Shortest hop path, BFS with lexicographic neighbour order for
    /// deterministic tie-breaks.
    fn shortest_path(&self, from: &str, to: &str) -> Result<Vec<String>, Error> {
        let mut predecessors: HashMap<String, String> = HashMap::new();
        let mut queue = VecDeque::from([from.to_string()]);

        while let Some(state) = queue.pop_front() {
            if state == to {
                let mut path = vec![state];
                while let Some(previous) = predecessors.get(path.last().expect("non-empty")) {
                    path.push(previous.clone());
                }
                path.reverse();
                return Ok(path);
            }

            if let Some(neighbours) = self.hops.get(&state) {
                for neighbour in neighbours.keys() {
                    if neighbour != from && !predecessors.contains_key(neighbour) {
                        predecessors.insert(neighbour.clone(), state.clone());
                        queue.push_back(neighbour.clone());
                    }
                }
            }
        }

        Err(Error::BadConfig(format!(
            "device `{}` has no hop path from `{from}` to `{to}`",
            self.name
        )))
    }

    async fn execute_hop(
        &self,
        from: &str,
        to: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        let hop = self
            .hops
            .get(from)
            .and_then(|edges| edges.get(to))
            .cloned()
            .ok_or_else(|| Error::BadConfig(format!("no hop `{from}` -> `{to}` configured")))?;

        let wrap = |stage: &str, source: Error| Error::HopFailure {
            from: from.into(),
            to: to.into(),
            stage: stage.into(),
            source: Box::new(source),
        };

        match hop {
            Hop::Open => self.open_transport().map_err(|e| wrap("open", e)),
            Hop::Close => {
                if let Some(connection) = self.connection() {
                    connection.close();
                }
                Ok(())
            }
            Hop::Run(spec) => {
                let state = self.current_state();
                let factory = self
                    .cmds
                    .get(&state)
                    .and_then(|registry| registry.get(&spec.execute_command))
                    .ok_or_else(|| {
                        wrap(
                            "lookup",
                            Error::NotAllowed {
                                name: spec.execute_command.clone(),
                                state: state.clone(),
                            },
                        )
                    })?;

                let parser = factory(&spec.command_params).map_err(|e| wrap("build", e))?;
                // The prompt that proves arrival is the one of the state
                // we are hopping into.
                let prompt = self
                    .prompt_from_params(&spec.command_params, to)
                    .map_err(|e| wrap("build", e))?;
                let connection = self
                    .connection()
                    .ok_or_else(|| wrap("build", Error::ConnectionLost(self.name.clone())))?;

                let command =
                    Command::new(connection, Arc::clone(&self.runner), prompt, parser);
                info!(device = %self.name, %from, %to, command = %command.command_string(), "Executing hop");
                command
                    .run(timeout)
                    .await
                    .map(|_| ())
                    .map_err(|e| wrap("command", e))
            }
        }
    }

    fn open_transport(&self) -> Result<(), Error> {
        let transport = (self.transport_factory)()?;
        let mut guard = self.connection.lock().expect("connection lock");

        match guard.as_ref() {
            Some(connection) => connection.reattach(transport),
            None => {
                let connection = FanoutConnectionBuilder::new(&self.name).attach(transport);

                let weak = self.weak_self.clone();
                connection.add_closed_subscriber(move |_| {
                    if let Some(device) = weak.upgrade() {
                        tokio::spawn(device.handle_connection_lost());
                    }
                });

                *guard = Some(connection);
                Ok(())
            }
        }
    }

    fn store_state(&self, to: &str, reason: ChangeReason) {
        let from = {
            let mut state = self.state.lock().expect("state lock");
            std::mem::replace(&mut *state, to.to_string())
        };
        info!(device = %self.name, %from, %to, %reason, "State changed");

        // Notify only after the new state is stored.
        self.state_changes.notify_subscribers(&StateChange {
            from,
            to: to.to_string(),
            reason,
            at: Utc::now(),
        });
    }

    async fn handle_connection_lost(self: Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Wait out any in-flight transition so an intentional hop into
        // `NOT_CONNECTED` is not mistaken for a lost transport.
        let _guard = self.transitions.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let former = self.current_state();
        if former == NOT_CONNECTED {
            return;
        }

        warn!(device = %self.name, state = %former, "Transport lost");
        self.store_state(NOT_CONNECTED, ChangeReason::ConnectionLost);

        drop(_guard);
        if let Some(policy) = self.reconnect.clone() {
            if !self.reconnecting.swap(true, Ordering::SeqCst) {
                tokio::spawn(reconnect_loop(self, former, policy));
            }
        }
    }

    /// Close the device: retreat to the local state issuing reverse hops,
    /// then drop the transport. Closing an already-closed device is a
    /// no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let current = self.current_state();
        if current == NOT_CONNECTED {
            return;
        }

        if current != self.local_state {
            if let Err(failure) = self.goto_state(&self.local_state, self.hop_timeout).await {
                warn!(device = %self.name, %failure, "Could not retreat cleanly while closing");
            }
        }

        if let Some(connection) = self.connection() {
            connection.close();
        }
        self.store_state(NOT_CONNECTED, ChangeReason::Closed);
        info!(device = %self.name, "Closed");
    }
}

async fn reconnect_loop(device: Arc<Device>, target: String, policy: ReconnectPolicy) {
    let mut delay = policy.initial;

    loop {
        tokio::time::sleep(delay).await;
        if device.closed.load(Ordering::SeqCst) {
            break;
        }

        info!(device = %device.name, %target, ?delay, "Attempting reconnect");
        match device.goto_state(&target, device.hop_timeout).await {
            Ok(()) => {
                device.state_changes.notify_subscribers(&StateChange {
                    from: NOT_CONNECTED.into(),
                    to: target.clone(),
                    reason: ChangeReason::Reconnected,
                    at: Utc::now(),
                });
                info!(device = %device.name, %target, "Reconnected");
                break;
            }
            Err(failure) => {
                warn!(device = %device.name, %failure, "Reconnect attempt failed");
                delay = (delay * policy.factor).min(policy.max);
            }
        }
    }

    device.reconnecting.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::runner::SharedRunner;

    fn run_hop(command: &str) -> Hop {
        Hop::Run(HopSpec {
            execute_command: command.into(),
            command_params: Params::new(),
        })
    }

    fn diamond_device() -> Arc<Device> {
        let runner: Arc<dyn Runner> = Arc::new(SharedRunner::new());
        let factory: TransportFactory =
            Arc::new(|| Err(Error::InternalError("no wire in this test".into())));

        DeviceBuilder::new("dut", runner, factory)
            .hop(NOT_CONNECTED, "ALPHA", Hop::Open)
            .hop(NOT_CONNECTED, "BETA", Hop::Open)
            .hop("ALPHA", "GAMMA", run_hop("go"))
            .hop("BETA", "GAMMA", run_hop("go"))
            .build()
    }

    #[tokio::test]
    async fn bfs_breaks_ties_lexicographically() {
        let device = diamond_device();
        let path = device.shortest_path(NOT_CONNECTED, "GAMMA").unwrap();
        assert_eq!(path, vec!["NOT_CONNECTED", "ALPHA", "GAMMA"]);
    }

    #[tokio::test]
    async fn unknown_target_is_rejected() {
        let device = diamond_device();
        let result = device.goto_state("NOWHERE", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::BadConfig(_))));
    }

    #[tokio::test]
    async fn failed_open_surfaces_as_hop_failure() {
        let device = diamond_device();
        let failure = device
            .goto_state("ALPHA", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(failure, Error::HopFailure { stage, .. } if stage == "open"));
        assert_eq!(device.current_state(), NOT_CONNECTED);
    }
}
