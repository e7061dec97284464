// Subscribing side of the client.
//
// A consumer discovers the nsqd set for its topic through lookupd, keeps one
// subscribed connection per node, and funnels every inbound message through
// a single dispatch loop. Concurrency is a fixed pool of worker permits;
// flow control is the RDY credit the consumer advertises per connection.
//
// When the worker pool is saturated the message is requeued immediately and
// the connection's credit drops to zero. A single probe timer then restores
// RDY 1 after a delay that grows half a second per saturation event and
// shrinks half a second per success, so a struggling consumer backs off
// without ever stalling permanently.
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time;

use crate::addr::ServerAddress;
use crate::config::{Config, BACKOFF_CAP, BACKOFF_STEP};
use crate::conn::{Connection, ErrorCallback};
use crate::error::Result;
use crate::lookup::LookupClient;
use crate::message::{InboundMessage, Message};
use crate::wire::{Command, Frame};

type Decoder<T> = Arc<dyn Fn(&[u8]) -> std::io::Result<T> + Send + Sync>;
type Callback<T> = Arc<dyn Fn(Message<T>) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    incoming_rx: Option<mpsc::Receiver<InboundMessage>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared<T> {
    topic: String,
    channel: String,
    config: Config,
    lookup: LookupClient,
    connections: Mutex<HashMap<ServerAddress, Arc<Connection>>>,
    incoming_tx: mpsc::Sender<InboundMessage>,
    workers: Arc<Semaphore>,
    decoder: Decoder<T>,
    callback: Callback<T>,
    on_error: Option<ErrorCallback>,
    total_messages: AtomicU64,
    /// Messages seen per connection, driving the RDY refill watermark.
    seen: Mutex<HashMap<ServerAddress, u64>>,
    backoff: Arc<Mutex<Backoff>>,
    shutdown: watch::Sender<bool>,
}

/// Saturation backoff state. The accumulator only moves in half-second
/// steps, so bursty saturation converges to a stable probe delay instead of
/// oscillating.
struct Backoff {
    accumulator: Duration,
    probe: Option<JoinHandle<()>>,
}

impl Backoff {
    fn new() -> Self {
        Self {
            accumulator: Duration::ZERO,
            probe: None,
        }
    }

    fn bump(&mut self) -> Duration {
        self.accumulator = (self.accumulator + BACKOFF_STEP).min(BACKOFF_CAP);
        self.accumulator
    }

    fn relax(&mut self) {
        self.accumulator = self.accumulator.saturating_sub(BACKOFF_STEP);
    }
}

/// True when enough credit has been consumed to top the connection back up.
/// Refilling at the halfway watermark keeps the pipeline full without
/// sending RDY for every message.
fn should_refill(seen: u64, batch: usize) -> bool {
    let batch = batch.max(1) as u64;
    seen % batch > batch / 2
}

fn topology_diff(
    current: &HashSet<ServerAddress>,
    desired: &HashSet<ServerAddress>,
) -> (Vec<ServerAddress>, Vec<ServerAddress>) {
    let added = desired.difference(current).cloned().collect();
    let removed = current.difference(desired).cloned().collect();
    (added, removed)
}

impl<T: Send + 'static> Consumer<T> {
    /// `decoder` turns a raw body into `T`; `callback` handles each decoded
    /// message and owns its acknowledgement.
    pub fn new<D, C, F>(
        lookup: LookupClient,
        topic: impl Into<String>,
        channel: impl Into<String>,
        config: Config,
        decoder: D,
        callback: C,
    ) -> Self
    where
        D: Fn(&[u8]) -> std::io::Result<T> + Send + Sync + 'static,
        C: Fn(Message<T>) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let (incoming_tx, incoming_rx) = mpsc::channel(config.messages_per_batch.max(1));
        let (shutdown, _) = watch::channel(false);
        let workers = Arc::new(Semaphore::new(config.executor_threads.max(1)));
        Self {
            shared: Arc::new(Shared {
                topic: topic.into(),
                channel: channel.into(),
                config,
                lookup,
                connections: Mutex::new(HashMap::new()),
                incoming_tx,
                workers,
                decoder: Arc::new(decoder),
                callback: Arc::new(move |message| callback(message).boxed()),
                on_error: None,
                total_messages: AtomicU64::new(0),
                seen: Mutex::new(HashMap::new()),
                backoff: Arc::new(Mutex::new(Backoff::new())),
                shutdown,
            }),
            incoming_rx: Some(incoming_rx),
            tasks: Vec::new(),
        }
    }

    /// Observe the text of every Error frame a broker sends on this
    /// consumer's connections. Only effective before [`Consumer::start`].
    pub fn on_error(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.on_error = Some(Arc::new(callback));
        }
        self
    }

    /// Connect to the current topology and begin delivering messages.
    /// Discovery keeps running in the background, so starting with no
    /// reachable nsqd is not an error; the consumer connects as nodes
    /// appear.
    pub async fn start(&mut self) -> Result<()> {
        let Some(incoming_rx) = self.incoming_rx.take() else {
            return Ok(());
        };
        self.shared.reconcile().await;

        let shared = self.shared.clone();
        let shutdown = self.shared.shutdown.subscribe();
        self.tasks
            .push(tokio::spawn(dispatch_loop(shared, incoming_rx, shutdown)));

        let shared = self.shared.clone();
        let shutdown = self.shared.shutdown.subscribe();
        self.tasks
            .push(tokio::spawn(discovery_loop(shared, shutdown)));
        Ok(())
    }

    /// Messages received since start, including requeued redeliveries.
    pub fn total_messages(&self) -> u64 {
        self.shared.total_messages.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections().len()
    }

    /// Stop discovery, ask every broker to stop deliveries, and tear down.
    pub async fn shutdown(mut self) {
        let _ = self.shared.shutdown.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(probe) = self.shared.backoff().probe.take() {
            probe.abort();
        }
        let connections: Vec<_> = self.shared.connections().drain().collect();
        for (_, conn) in connections {
            conn.close_gracefully().await;
        }
    }
}

async fn dispatch_loop<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    mut incoming_rx: mpsc::Receiver<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let inbound = tokio::select! {
            _ = shutdown.changed() => break,
            inbound = incoming_rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };
        shared.handle(inbound).await;
    }
}

async fn discovery_loop<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = shared.config.lookup_period;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = time::sleep(period) => {}
        }
        shared.reconcile().await;
    }
}

impl<T: Send + 'static> Shared<T> {
    async fn handle(&self, inbound: InboundMessage) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        let Some(conn) = inbound.conn.upgrade() else {
            // Connection already gone; the broker will redeliver.
            return;
        };

        let body = match inbound.decompressed_body() {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(id = %inbound.frame.id, error = %err, "failed to decompress message; finishing");
                let _ = conn.send(Command::finish(inbound.frame.id)).await;
                return;
            }
        };
        let decoded = match (self.decoder)(&body) {
            Ok(decoded) => decoded,
            Err(err) => {
                // A body that cannot decode never will; requeueing it would
                // loop forever.
                tracing::warn!(id = %inbound.frame.id, error = %err, "failed to decode message; finishing");
                let _ = conn.send(Command::finish(inbound.frame.id)).await;
                return;
            }
        };

        let Ok(permit) = self.workers.clone().try_acquire_owned() else {
            self.saturated(&conn, &inbound).await;
            return;
        };

        self.note_delivery(&conn).await;
        let message = Message::new(&inbound, decoded);
        let callback = self.callback.clone();
        let backoff = self.backoff_handle();
        let batch = self.config.messages_per_batch;
        let conn = Arc::downgrade(&conn);
        tokio::spawn(async move {
            callback(message).await;
            drop(permit);
            // While the accumulator is draining, each success re-arms the
            // probe with the shortened delay so credit keeps trickling
            // back; once it reaches zero the full batch is restored.
            let restore_full = {
                let mut backoff = backoff.lock().unwrap_or_else(PoisonError::into_inner);
                if backoff.accumulator.is_zero() {
                    false
                } else {
                    backoff.relax();
                    if let Some(probe) = backoff.probe.take() {
                        probe.abort();
                    }
                    if backoff.accumulator.is_zero() {
                        true
                    } else {
                        backoff.probe = Some(tokio::spawn(probe_ready(
                            conn.clone(),
                            backoff.accumulator,
                        )));
                        false
                    }
                }
            };
            if restore_full {
                if let Some(conn) = conn.upgrade() {
                    let _ = conn.send(Command::ready(batch)).await;
                }
            }
        });
    }

    /// All workers busy: hand the message back, stop the flow on this
    /// connection, and schedule a one-message probe.
    async fn saturated(&self, conn: &Arc<Connection>, inbound: &InboundMessage) {
        let _ = conn.send(Command::requeue(inbound.frame.id, 0)).await;
        let _ = conn.send(Command::ready(0)).await;

        let mut backoff = self.backoff();
        let delay = backoff.bump();
        if let Some(probe) = backoff.probe.take() {
            probe.abort();
        }
        tracing::debug!(delay_ms = delay.as_millis() as u64, "worker pool saturated; backing off");
        let weak = Arc::downgrade(conn);
        backoff.probe = Some(tokio::spawn(probe_ready(weak, delay)));
    }

    async fn note_delivery(&self, conn: &Arc<Connection>) {
        let refill = {
            let mut seen = self.seen();
            let count = seen.entry(conn.addr().clone()).or_insert(0);
            *count += 1;
            should_refill(*count, self.config.messages_per_batch)
        };
        if refill {
            let _ = conn
                .send(Command::ready(self.config.messages_per_batch))
                .await;
        }
    }

    /// Fetch the topic's nsqd set and converge connections onto it. Lookup
    /// failures keep the present topology.
    async fn reconcile(&self) {
        let desired = match self.lookup.lookup(&self.topic).await {
            Ok(desired) => desired,
            Err(err) => {
                tracing::warn!(topic = %self.topic, error = %err, "lookup failed; keeping current topology");
                return;
            }
        };

        let current: HashSet<ServerAddress> = {
            let mut connections = self.connections();
            // Unhealthy connections get re-dialed if the node is still
            // desired.
            connections.retain(|_, conn| {
                if conn.is_healthy() {
                    true
                } else {
                    conn.close();
                    false
                }
            });
            connections.keys().cloned().collect()
        };
        let (added, removed) = topology_diff(&current, &desired);

        for addr in removed {
            let conn = self.connections().remove(&addr);
            self.seen().remove(&addr);
            if let Some(conn) = conn {
                tracing::info!(addr = %addr, "nsqd left the topology; closing");
                conn.close_gracefully().await;
            }
        }

        for addr in added {
            match self.subscribe_to(&addr).await {
                Ok(conn) => {
                    tracing::info!(addr = %addr, topic = %self.topic, "subscribed to nsqd");
                    self.connections().insert(addr, conn);
                }
                Err(err) => {
                    tracing::warn!(addr = %addr, error = %err, "could not subscribe to nsqd");
                }
            }
        }
    }

    async fn subscribe_to(&self, addr: &ServerAddress) -> Result<Arc<Connection>> {
        let conn = Connection::connect(
            addr,
            &self.config,
            Some(self.incoming_tx.clone()),
            self.on_error.clone(),
        )
        .await?;
        let sub = Command::subscribe(&self.topic, &self.channel);
        match conn.command_and_wait(sub).await {
            Ok(Frame::Response(_)) => {}
            Ok(Frame::Error(text)) => {
                conn.close();
                return Err(crate::error::Error::from_error_frame(&text));
            }
            Ok(Frame::Message(_)) => {
                conn.close();
                return Err(crate::error::Error::Protocol(
                    "message frame before subscription was acknowledged".into(),
                ));
            }
            Err(err) => {
                conn.close();
                return Err(err);
            }
        }
        conn.send(Command::ready(self.config.messages_per_batch))
            .await?;
        Ok(conn)
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ServerAddress, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn seen(&self) -> MutexGuard<'_, HashMap<ServerAddress, u64>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backoff(&self) -> MutexGuard<'_, Backoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backoff_handle(&self) -> Arc<Mutex<Backoff>> {
        self.backoff.clone()
    }
}

async fn probe_ready(conn: Weak<Connection>, delay: Duration) {
    time::sleep(delay).await;
    if let Some(conn) = conn.upgrade() {
        let _ = conn.send(Command::ready(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_triggers_past_the_halfway_watermark() {
        // batch 200: refill once more than 100 credits are consumed since
        // the last multiple of the batch size.
        assert!(!should_refill(0, 200));
        assert!(!should_refill(100, 200));
        assert!(should_refill(101, 200));
        assert!(should_refill(199, 200));
        assert!(!should_refill(200, 200));
        assert!(should_refill(301, 200));
    }

    #[test]
    fn refill_handles_tiny_batches() {
        assert!(!should_refill(0, 1));
        assert!(!should_refill(5, 1));
        assert!(should_refill(2, 3));
    }

    #[test]
    fn topology_diff_splits_added_and_removed() {
        let a = ServerAddress::new("a", 4150);
        let b = ServerAddress::new("b", 4150);
        let c = ServerAddress::new("c", 4150);
        let current: HashSet<_> = [a.clone(), b.clone()].into_iter().collect();
        let desired: HashSet<_> = [b.clone(), c.clone()].into_iter().collect();

        let (added, removed) = topology_diff(&current, &desired);
        assert_eq!(added, vec![c]);
        assert_eq!(removed, vec![a]);
    }

    #[test]
    fn unchanged_topology_diffs_empty() {
        let a = ServerAddress::new("a", 4150);
        let set: HashSet<_> = [a].into_iter().collect();
        let (added, removed) = topology_diff(&set, &set.clone());
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn backoff_accumulator_is_monotone_and_clamped() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.bump(), BACKOFF_STEP);
        assert_eq!(backoff.bump(), BACKOFF_STEP * 2);
        backoff.relax();
        assert_eq!(backoff.accumulator, BACKOFF_STEP);
        backoff.relax();
        backoff.relax();
        assert_eq!(backoff.accumulator, Duration::ZERO);
        for _ in 0..1000 {
            backoff.bump();
        }
        assert_eq!(backoff.accumulator, BACKOFF_CAP);
    }
}
