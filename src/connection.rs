//! The fan-out connection: one transport, many observers.
//!
//! A transport (pty, ssh channel, serial port, mock wire) is represented by
//! a pair of unbounded byte channels. The [`FanoutConnection`] wraps that
//! pair: a reader task stamps every inbound chunk as early as possible and
//! snapshots the live consumer set, and a dispatch task drains the
//! processing queue and feeds each consumer. A slow consumer therefore
//! cannot back-pressure the transport reader, and every consumer sees
//! chunks in arrival order with monotonically non-decreasing timestamps.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::logging::{log_raw, Direction};
use crate::publisher::{Publisher, Subscription};

/// Raw bytes as read from / written to the wire.
pub type ChunkBytes = Vec<u8>;

/// The abstract wire: what the core needs from any transport binding.
///
/// The transport drains `outgoing` onto the wire and pushes everything it
/// reads into the sender side of `incoming`. Dropping that sender signals
/// connection loss.
#[derive(Debug)]
pub struct TransportChannels {
    /// Writes performed by the connection end up here.
    pub outgoing: mpsc::UnboundedSender<ChunkBytes>,
    /// Chunks the transport read off the wire.
    pub incoming: mpsc::UnboundedReceiver<ChunkBytes>,
}

/// One decoded chunk of inbound data.
#[derive(Debug, Clone)]
pub struct InboundChunk {
    /// The chunk decoded as UTF-8, bad bytes replaced.
    pub text: String,
    /// Wall-clock stamp taken when the reader received the chunk, clamped
    /// so stamps never go backwards within one connection.
    pub received_at: DateTime<Utc>,
}

/// Identifies one consumer subscription on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

/// The intake side of an observer, as seen by the fan-out.
///
/// `feed` must not block and must not panic; heavy parsing is fine, I/O and
/// waiting are not. Failures belong inside the consumer (converted to its
/// own failure state), never propagated back into the dispatch worker.
pub trait StreamConsumer: Send + Sync {
    /// A new chunk arrived on the connection.
    fn feed(&self, chunk: &InboundChunk);

    /// The transport closed or errored; no further chunks will arrive.
    fn connection_lost(&self);

    /// The dispatch worker caught a panic escaping `feed`. Implementors
    /// owning an observer should store an internal failure there.
    fn internal_failure(&self, reason: &str) {
        let _ = reason;
    }
}

/// Payload published when a connection transitions to closed.
#[derive(Debug, Clone)]
pub struct ConnectionClosed {
    /// Name of the connection that closed.
    pub name: String,
    /// When the closure was observed.
    pub at: DateTime<Utc>,
}

enum QueueItem {
    Chunk {
        chunk: InboundChunk,
        targets: Vec<Arc<dyn StreamConsumer>>,
    },
    Lost {
        targets: Vec<Arc<dyn StreamConsumer>>,
    },
}

struct Shared {
    name: String,
    newline: String,
    open: AtomicBool,
    lost_signalled: AtomicBool,
    outgoing: Mutex<Option<mpsc::UnboundedSender<ChunkBytes>>>,
    subscribers: Mutex<HashMap<u64, Arc<dyn StreamConsumer>>>,
    next_consumer_id: AtomicU64,
    queue: mpsc::UnboundedSender<QueueItem>,
    last_stamp: Mutex<DateTime<Utc>>,
    closed_events: Publisher<ConnectionClosed>,
}

impl Shared {
    fn snapshot(&self) -> Vec<Arc<dyn StreamConsumer>> {
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .values()
            .cloned()
            .collect()
    }

    /// Stamp a chunk, clamped to keep per-connection stamps non-decreasing.
    fn stamp(&self) -> DateTime<Utc> {
        let mut last = self.last_stamp.lock().expect("stamp lock");
        let now = Utc::now();
        let stamp = if now < *last { *last } else { now };
        *last = stamp;
        stamp
    }

    fn signal_lost(&self) {
        if self.lost_signalled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        *self.outgoing.lock().expect("outgoing lock") = None;

        let targets = self.snapshot();
        debug!(name = %self.name, consumers = targets.len(), "Connection lost, informing consumers");
        // The dispatch worker may already be gone during shutdown.
        let _ = self.queue.send(QueueItem::Lost { targets });
    }
}

/// Builder for a [`FanoutConnection`].
#[derive(Debug)]
pub struct FanoutConnectionBuilder {
    name: String,
    newline: String,
}

impl FanoutConnectionBuilder {
    /// Start building a connection with the given name (used in logs).
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            newline: "\n".into(),
        }
    }

    /// Override the newline appended by `sendline` (default `"\n"`).
    pub fn newline(mut self, newline: &str) -> Self {
        self.newline = newline.into();
        self
    }

    /// Attach the transport and start the reader and dispatch workers.
    pub fn attach(self, transport: TransportChannels) -> Arc<FanoutConnection> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            name: self.name,
            newline: self.newline,
            open: AtomicBool::new(true),
            lost_signalled: AtomicBool::new(false),
            outgoing: Mutex::new(Some(transport.outgoing)),
            subscribers: Mutex::new(HashMap::new()),
            next_consumer_id: AtomicU64::new(0),
            queue: queue_tx,
            last_stamp: Mutex::new(Utc::now()),
            closed_events: Publisher::new(),
        });

        // The dispatcher only borrows the shared state weakly: once every
        // strong holder (connection handle, reader) is gone, the queue
        // sender drops and the worker winds down instead of keeping the
        // connection alive through its own reference.
        tokio::spawn(dispatch_worker(Arc::downgrade(&shared), queue_rx));
        tokio::spawn(read_worker(Arc::clone(&shared), transport.incoming));

        Arc::new(FanoutConnection { shared })
    }
}

/// Drains the transport, stamping chunks and snapshotting consumers at
/// queuing time.
async fn read_worker(shared: Arc<Shared>, mut incoming: mpsc::UnboundedReceiver<ChunkBytes>) {
    while let Some(bytes) = incoming.recv().await {
        if !shared.open.load(Ordering::SeqCst) {
            break;
        }

        let chunk = InboundChunk {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            received_at: shared.stamp(),
        };
        log_raw(&shared.name, Direction::In, &chunk.text);

        // Snapshot here: a consumer unsubscribed later still sees this
        // chunk, one subscribed later does not.
        let targets = shared.snapshot();
        if shared
            .queue
            .send(QueueItem::Chunk { chunk, targets })
            .is_err()
        {
            break;
        }
    }

    shared.signal_lost();
}

/// Feeds queued chunks to their snapshot of consumers, in FIFO order.
async fn dispatch_worker(shared: Weak<Shared>, mut queue: mpsc::UnboundedReceiver<QueueItem>) {
    while let Some(item) = queue.recv().await {
        let Some(shared) = shared.upgrade() else { break };

        match item {
            QueueItem::Chunk { chunk, targets } => {
                trace!(name = %shared.name, bytes = chunk.text.len(), consumers = targets.len(), "Dispatching chunk");
                for consumer in targets {
                    // Intake must not take the whole pipeline down with it.
                    if catch_unwind(AssertUnwindSafe(|| consumer.feed(&chunk))).is_err() {
                        warn!(name = %shared.name, "Consumer intake panicked");
                        consumer.internal_failure("intake panicked");
                    }
                }
            }
            QueueItem::Lost { targets } => {
                for consumer in targets {
                    consumer.connection_lost();
                }
                shared.closed_events.notify_subscribers(&ConnectionClosed {
                    name: shared.name.clone(),
                    at: Utc::now(),
                });
            }
        }
    }

    trace!("Dispatch worker stopped");
}

/// Wraps one transport and multicasts its inbound chunks to any number of
/// [`StreamConsumer`]s. See the module docs for the pipeline shape.
pub struct FanoutConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FanoutConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutConnection")
            .field("name", &self.shared.name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl FanoutConnection {
    /// The connection's name, as used in logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the transport is currently attached and not lost.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Subscribe a consumer. It will see every chunk queued from now on.
    pub fn subscribe(&self, consumer: Arc<dyn StreamConsumer>) -> ConsumerId {
        let id = self.shared.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .subscribers
            .lock()
            .expect("subscriber lock")
            .insert(id, consumer);
        trace!(name = %self.shared.name, consumer = id, "Subscribed");
        ConsumerId(id)
    }

    /// Remove a subscription. Chunks already queued for this consumer are
    /// still delivered. Idempotent.
    pub fn unsubscribe(&self, id: ConsumerId) {
        self.shared
            .subscribers
            .lock()
            .expect("subscriber lock")
            .remove(&id.0);
        trace!(name = %self.shared.name, consumer = id.0, "Unsubscribed");
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().expect("subscriber lock").len()
    }

    /// Write raw text onto the wire.
    pub fn send(&self, text: &str) -> Result<(), Error> {
        let outgoing = self.shared.outgoing.lock().expect("outgoing lock");
        let sender = outgoing
            .as_ref()
            .ok_or_else(|| Error::ConnectionLost(self.shared.name.clone()))?;

        log_raw(&self.shared.name, Direction::Out, text);
        sender
            .send(text.as_bytes().to_vec())
            .map_err(|_| Error::ConnectionLost(self.shared.name.clone()))
    }

    /// Write text followed by the configured newline.
    pub fn sendline(&self, text: &str) -> Result<(), Error> {
        let mut line = String::with_capacity(text.len() + self.shared.newline.len());
        line.push_str(text);
        line.push_str(&self.shared.newline);
        self.send(&line)
    }

    /// Subscribe for closure notifications.
    pub fn add_closed_subscriber<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&ConnectionClosed) + Send + Sync + 'static,
    {
        self.shared.closed_events.subscribe(subscriber)
    }

    /// Remove a closure subscription.
    pub fn remove_closed_subscriber(&self, subscription: Subscription) -> bool {
        self.shared.closed_events.unsubscribe(subscription)
    }

    /// Close the connection. Live consumers receive a connection-lost
    /// notification; closing twice is a no-op.
    pub fn close(&self) {
        if self.is_open() {
            debug!(name = %self.shared.name, "Closing connection");
        }
        self.shared.signal_lost();
    }

    /// Attach a fresh transport after the previous one was lost.
    ///
    /// The connection keeps its identity and subscriber registry, so
    /// handles held by devices stay valid across reconnects.
    pub fn reattach(&self, transport: TransportChannels) -> Result<(), Error> {
        if self.is_open() {
            return Err(Error::InternalError(format!(
                "connection `{}` is still open, cannot reattach",
                self.shared.name
            )));
        }

        *self.shared.outgoing.lock().expect("outgoing lock") = Some(transport.outgoing);
        self.shared.lost_signalled.store(false, Ordering::SeqCst);
        self.shared.open.store(true, Ordering::SeqCst);

        tokio::spawn(read_worker(Arc::clone(&self.shared), transport.incoming));
        debug!(name = %self.shared.name, "Transport reattached");
        Ok(())
    }
}

impl Drop for FanoutConnection {
    fn drop(&mut self) {
        if self.shared.open.load(Ordering::SeqCst) {
            warn!(name = %self.shared.name, "Connection dropped while open");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    struct Recorder {
        chunks: StdMutex<Vec<String>>,
        lost: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                chunks: StdMutex::new(vec![]),
                lost: AtomicBool::new(false),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.chunks.lock().unwrap().clone()
        }
    }

    impl StreamConsumer for Recorder {
        fn feed(&self, chunk: &InboundChunk) {
            self.chunks.lock().unwrap().push(chunk.text.clone());
        }

        fn connection_lost(&self) {
            self.lost.store(true, Ordering::SeqCst);
        }
    }

    fn wire() -> (
        TransportChannels,
        mpsc::UnboundedSender<ChunkBytes>,
        mpsc::UnboundedReceiver<ChunkBytes>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            TransportChannels {
                outgoing: out_tx,
                incoming: in_rx,
            },
            in_tx,
            out_rx,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn chunks_reach_every_subscriber_in_order() {
        let (transport, in_tx, _out_rx) = wire();
        let connection = FanoutConnectionBuilder::new("conn").attach(transport);

        let first = Recorder::new();
        let second = Recorder::new();
        connection.subscribe(first.clone());
        connection.subscribe(second.clone());

        in_tx.send(b"alpha\n".to_vec()).unwrap();
        in_tx.send(b"beta\n".to_vec()).unwrap();
        settle().await;

        assert_eq!(first.seen(), vec!["alpha\n", "beta\n"]);
        assert_eq!(second.seen(), vec!["alpha\n", "beta\n"]);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_chunks() {
        let (transport, in_tx, _out_rx) = wire();
        let connection = FanoutConnectionBuilder::new("conn").attach(transport);

        let early = Recorder::new();
        connection.subscribe(early.clone());

        in_tx.send(b"first".to_vec()).unwrap();
        settle().await;

        let late = Recorder::new();
        connection.subscribe(late.clone());

        in_tx.send(b"second".to_vec()).unwrap();
        settle().await;

        assert_eq!(early.seen(), vec!["first", "second"]);
        assert_eq!(late.seen(), vec!["second"]);
    }

    #[tokio::test]
    async fn timestamps_do_not_go_backwards() {
        let (transport, in_tx, _out_rx) = wire();
        let connection = FanoutConnectionBuilder::new("conn").attach(transport);

        struct Stamps(StdMutex<Vec<DateTime<Utc>>>);
        impl StreamConsumer for Stamps {
            fn feed(&self, chunk: &InboundChunk) {
                self.0.lock().unwrap().push(chunk.received_at);
            }
            fn connection_lost(&self) {}
        }

        let stamps = Arc::new(Stamps(StdMutex::new(vec![])));
        connection.subscribe(stamps.clone());

        for _ in 0..20 {
            in_tx.send(b"x".to_vec()).unwrap();
        }
        settle().await;

        let seen = stamps.0.lock().unwrap().clone();
        assert_eq!(seen.len(), 20);
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test]
    async fn dropping_the_wire_informs_consumers() {
        let (transport, in_tx, _out_rx) = wire();
        let connection = FanoutConnectionBuilder::new("conn").attach(transport);

        let consumer = Recorder::new();
        connection.subscribe(consumer.clone());

        drop(in_tx);
        settle().await;

        assert!(consumer.lost.load(Ordering::SeqCst));
        assert!(!connection.is_open());
        assert!(connection.send("nope").is_err());
    }

    #[tokio::test]
    async fn send_reaches_the_transport() {
        let (transport, _in_tx, mut out_rx) = wire();
        let connection = FanoutConnectionBuilder::new("conn").attach(transport);

        connection.sendline("ls -l").unwrap();
        let written = out_rx.recv().await.unwrap();
        assert_eq!(written, b"ls -l\n".to_vec());
    }

    #[tokio::test]
    async fn reattach_restores_traffic() {
        let (transport, in_tx, _out_rx) = wire();
        let connection = FanoutConnectionBuilder::new("conn").attach(transport);

        let consumer = Recorder::new();
        connection.subscribe(consumer.clone());

        drop(in_tx);
        settle().await;
        assert!(!connection.is_open());

        let (transport, in_tx2, _out_rx2) = wire();
        connection.reattach(transport).unwrap();
        assert!(connection.is_open());

        in_tx2.send(b"back".to_vec()).unwrap();
        settle().await;
        assert_eq!(consumer.seen(), vec!["back"]);
    }
}
