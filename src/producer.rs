// Publishing side of the client.
//
// A producer spreads publishes round-robin over a fixed nsqd address set,
// borrowing pooled connections per publish. Pool exhaustion is retried a few
// times with a delay before giving up; a broker that answers a publish with
// an error frame gets its connection discarded, since the stream state after
// an error is unknown.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time;

use crate::addr::ServerAddress;
use crate::config::{Config, DEFAULT_CONNECTION_RETRIES, POOL_RETRY_DELAY};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::wire::{BodyWriter, Command, Frame};

pub struct Producer {
    addresses: Mutex<Vec<ServerAddress>>,
    pool: Arc<ConnectionPool>,
    config: Config,
    next: AtomicUsize,
    started: AtomicBool,
}

impl Producer {
    pub fn new(config: Config) -> Self {
        let pool = ConnectionPool::new(config.clone(), config.pool_capacity);
        Self {
            addresses: Mutex::new(Vec::new()),
            pool,
            config,
            next: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Add an nsqd to publish to. Effective immediately, started or not.
    pub fn add_address(&self, addr: ServerAddress) -> &Self {
        let mut addresses = self.addresses();
        if !addresses.contains(&addr) {
            addresses.push(addr);
        }
        self
    }

    /// Stop routing new publishes to `addr`. Pooled connections to it are
    /// discarded as they come back unhealthy or the pool shuts down.
    pub fn remove_address(&self, addr: &ServerAddress) -> &Self {
        self.addresses().retain(|known| known != addr);
        self
    }

    pub fn start(&self) {
        self.pool.reopen();
        self.started.store(true, Ordering::SeqCst);
    }

    /// Publish one message and wait for the broker's acknowledgement.
    pub async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()> {
        self.exchange(Command::publish(topic, self.config.body_compress(), body))
            .await
    }

    /// Publish with a broker-side delivery delay.
    pub async fn publish_deferred(&self, topic: &str, defer_ms: u64, body: Vec<u8>) -> Result<()> {
        self.exchange(Command::publish_deferred(
            topic,
            self.config.body_compress(),
            defer_ms,
            body,
        ))
        .await
    }

    /// Deferred publish with a streamed body.
    pub async fn publish_deferred_writer(
        &self,
        topic: &str,
        defer_ms: u64,
        writer: BodyWriter,
    ) -> Result<()> {
        self.exchange(Command::publish_deferred_writer(
            topic,
            self.config.body_compress(),
            defer_ms,
            writer,
        ))
        .await
    }

    /// Publish a batch atomically. A single-element batch is sent as a plain
    /// publish.
    pub async fn publish_multi(&self, topic: &str, bodies: Vec<Vec<u8>>) -> Result<()> {
        self.exchange(Command::multi_publish(
            topic,
            self.config.body_compress(),
            bodies,
        ))
        .await
    }

    /// Publish a body streamed straight into the wire buffer.
    pub async fn publish_writer(&self, topic: &str, writer: BodyWriter) -> Result<()> {
        self.exchange(Command::publish_writer(
            topic,
            self.config.body_compress(),
            writer,
        ))
        .await
    }

    /// Batch form of [`Producer::publish_writer`].
    pub async fn publish_multi_writers(
        &self,
        topic: &str,
        writers: Vec<BodyWriter>,
    ) -> Result<()> {
        self.exchange(Command::multi_publish_writers(
            topic,
            self.config.body_compress(),
            writers,
        ))
        .await
    }

    /// Fire-and-forget publish: the returned future resolves once the bytes
    /// are flushed to the socket, without waiting for the broker's
    /// acknowledgement. Errors the broker reports afterwards are logged by
    /// the connection, not surfaced here.
    pub async fn publish_async(
        &self,
        topic: &str,
        body: Vec<u8>,
    ) -> Result<impl std::future::Future<Output = Result<()>>> {
        let command = Command::publish(topic, self.config.body_compress(), body);
        let conn = self.connection().await?;
        let written = conn.send_async(command).await?;
        // No response is correlated, so the connection goes back to the
        // pool before the write resolves.
        drop(conn);
        Ok(written)
    }

    /// Close pooled connections. Publishes borrowed at the time finish their
    /// exchange and are discarded on return.
    pub fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.pool.close_all();
    }

    async fn exchange(&self, command: Command) -> Result<()> {
        let conn = self.connection().await?;
        match conn.command_and_wait(command).await {
            Ok(Frame::Response(_)) => Ok(()),
            Ok(Frame::Error(text)) => {
                conn.close();
                Err(Error::from_error_frame(&text))
            }
            Ok(Frame::Message(_)) => {
                conn.close();
                Err(Error::Protocol("message frame on a producer connection".into()))
            }
            Err(err) => {
                conn.close();
                Err(err)
            }
        }
    }

    /// Borrow a connection to the next address in round-robin order,
    /// retrying through exhaustion and per-node failures.
    async fn connection(&self) -> Result<PooledConnection> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        let mut last_error = None;
        for attempt in 0..DEFAULT_CONNECTION_RETRIES {
            let addr = {
                let addresses = self.addresses();
                if addresses.is_empty() {
                    return Err(Error::NoAddresses);
                }
                let index = self.next.fetch_add(1, Ordering::Relaxed) % addresses.len();
                addresses[index].clone()
            };
            match self.pool.acquire(&addr).await {
                Ok(Some(conn)) => return Ok(conn),
                Ok(None) => {
                    tracing::debug!(addr = %addr, attempt, "connection pool exhausted; waiting");
                    time::sleep(POOL_RETRY_DELAY).await;
                }
                Err(err) => {
                    tracing::warn!(addr = %addr, error = %err, "could not reach nsqd");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(Error::NoConnections))
    }

    fn addresses(&self) -> MutexGuard<'_, Vec<ServerAddress>> {
        self.addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
