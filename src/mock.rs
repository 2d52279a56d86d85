//! A mock wire, useful to test command and device functionality without
//! actual transports.
//!
//! The mock plays the remote side of a connection: every line written by
//! the connection is recorded and checked against scripted replies, and a
//! test can inject arbitrary inbound data or drop the wire to simulate
//! connection loss.

use std::sync::{Arc, Mutex};

use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::connection::{ChunkBytes, TransportChannels};

#[derive(Debug, Clone)]
struct ScriptedReply {
    pattern: Regex,
    reply: String,
}

enum Control {
    Inject(String),
    Close,
}

/// Builder for a mock wire.
#[derive(Debug, Clone, Default)]
pub struct MockWireBuilder {
    name: String,
    greeting: Option<String>,
    replies: Vec<ScriptedReply>,
}

impl MockWireBuilder {
    /// Start building a wire with the given name (used in logs).
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Emit `text` as soon as the wire is up, like a login banner.
    pub fn greeting(mut self, text: &str) -> Self {
        self.greeting = Some(text.into());
        self
    }

    /// When a written line matches `pattern`, emit `reply` on the inbound
    /// side. The first matching script wins; later writes match again.
    pub fn reply(mut self, pattern: &str, reply: &str) -> Self {
        self.replies.push(ScriptedReply {
            pattern: Regex::new(pattern).expect("mock reply pattern compiles"),
            reply: reply.into(),
        });
        self
    }

    /// Start the wire: returns the transport side (to attach to a
    /// connection) and the remote handle driving the far end.
    pub fn build(self) -> (TransportChannels, MockRemote) {
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ChunkBytes>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<ChunkBytes>();
        let (control_tx, control_rx) = mpsc::unbounded_channel::<Control>();

        let written = Arc::new(Mutex::new(Vec::new()));

        if let Some(greeting) = &self.greeting {
            in_tx
                .send(greeting.clone().into_bytes())
                .expect("fresh channel accepts greeting");
        }

        debug!(name = %self.name, scripts = self.replies.len(), "Running mock wire");
        tokio::spawn(pump(self, in_tx, out_rx, control_rx, Arc::clone(&written)));

        (
            TransportChannels {
                outgoing: out_tx,
                incoming: in_rx,
            },
            MockRemote {
                control: control_tx,
                written,
            },
        )
    }
}

async fn pump(
    spec: MockWireBuilder,
    in_tx: mpsc::UnboundedSender<ChunkBytes>,
    mut out_rx: mpsc::UnboundedReceiver<ChunkBytes>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    written: Arc<Mutex<Vec<String>>>,
) {
    loop {
        tokio::select! {
            bytes = out_rx.recv() => {
                let Some(bytes) = bytes else {
                    debug!(name = %spec.name, "Connection side closed, mock wire going down");
                    break;
                };

                let text = String::from_utf8_lossy(&bytes).into_owned();
                for line in text.lines() {
                    trace!(name = %spec.name, %line, "Mock wire got line");
                    written.lock().expect("written log lock").push(line.to_string());

                    if let Some(script) = spec
                        .replies
                        .iter()
                        .find(|script| script.pattern.is_match(line))
                    {
                        if in_tx.send(script.reply.clone().into_bytes()).is_err() {
                            warn!(name = %spec.name, "Reply had no receiver");
                        }
                    }
                }
            }

            control = control_rx.recv() => match control {
                Some(Control::Inject(text)) => {
                    if in_tx.send(text.into_bytes()).is_err() {
                        warn!(name = %spec.name, "Injection had no receiver");
                    }
                }
                Some(Control::Close) | None => {
                    debug!(name = %spec.name, "Mock wire dropped");
                    break;
                }
            }
        }
    }
    // Dropping `in_tx` here is what the connection observes as loss.
}

/// The far end of a mock wire.
#[derive(Debug, Clone)]
pub struct MockRemote {
    control: mpsc::UnboundedSender<Control>,
    written: Arc<Mutex<Vec<String>>>,
}

impl MockRemote {
    /// Push inbound data onto the wire, as if the device produced it.
    pub fn inject(&self, text: &str) {
        let _ = self.control.send(Control::Inject(text.into()));
    }

    /// Drop the wire; the connection observes this as connection loss.
    pub fn close(&self) {
        let _ = self.control.send(Control::Close);
    }

    /// Every line written by the connection so far.
    pub fn written(&self) -> Vec<String> {
        self.written.lock().expect("written log lock").clone()
    }
}

/// Builds a fresh wire from the same script each time; used where a device
/// needs to (re)open its transport.
#[derive(Debug, Clone)]
pub struct MockWireFactory {
    spec: MockWireBuilder,
    remotes: Arc<Mutex<Vec<MockRemote>>>,
}

impl MockWireFactory {
    /// Wrap a builder as a reusable wire source.
    pub fn new(spec: MockWireBuilder) -> Self {
        Self {
            spec,
            remotes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Build a fresh wire, remembering its remote handle.
    pub fn transport(&self) -> TransportChannels {
        let (transport, remote) = self.spec.clone().build();
        self.remotes.lock().expect("remotes lock").push(remote);
        transport
    }

    /// Remote handles of every wire built so far, oldest first.
    pub fn remotes(&self) -> Vec<MockRemote> {
        self.remotes.lock().expect("remotes lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::connection::FanoutConnectionBuilder;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn scripted_reply_answers_written_line() {
        let (transport, remote) = MockWireBuilder::new("wire")
            .reply(r"^echo", "hello\n")
            .build();
        let connection = FanoutConnectionBuilder::new("conn").attach(transport);

        connection.sendline("echo hello").unwrap();
        settle().await;

        assert_eq!(remote.written(), vec!["echo hello"]);
    }

    #[tokio::test]
    async fn close_is_seen_as_connection_loss() {
        let (transport, remote) = MockWireBuilder::new("wire").build();
        let connection = FanoutConnectionBuilder::new("conn").attach(transport);

        assert!(connection.is_open());
        remote.close();
        settle().await;
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn factory_hands_out_fresh_wires() {
        let factory = MockWireFactory::new(MockWireBuilder::new("wire").greeting("hi\n"));

        let _first = factory.transport();
        let _second = factory.transport();
        assert_eq!(factory.remotes().len(), 2);
    }
}
