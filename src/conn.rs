// A single nsqd TCP connection.
//
// Each connection runs two tasks: a writer draining a bounded command queue
// and a reader decoding inbound frames. The protocol allows at most one
// unacknowledged command at a time, so request/response correlation is a
// single in-flight slot (a one-permit semaphore) plus a capacity-1 response
// channel. Heartbeats are answered inline by the reader and never surface.
//
// Any stalled exchange closes the connection: a write, a response wait, or
// the reader's hand-off to a waiting command exceeding its timeout all mean
// the peer or the local pipeline is wedged, and pools recover by dialing a
// fresh connection.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::time;

use crate::addr::ServerAddress;
use crate::config::{Config, HEARTBEAT_MAX_INTERVAL};
use crate::error::{Error, Result};
use crate::message::InboundMessage;
use crate::wire::frame::read_frame;
use crate::wire::{Command, Frame, MAGIC_V2};

const WRITE_QUEUE_DEPTH: usize = 64;

/// Invoked with the text of every Error frame the broker sends, solicited
/// or not, before normal correlation proceeds.
pub(crate) type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct WriteRequest {
    bytes: Bytes,
    done: oneshot::Sender<std::io::Result<()>>,
}

pub(crate) struct Connection {
    addr: ServerAddress,
    writer_tx: mpsc::Sender<WriteRequest>,
    /// One permit; holding it is the right to an unacknowledged command.
    in_flight: Semaphore,
    responses: Mutex<mpsc::Receiver<Frame>>,
    /// Set while a command holds the in-flight slot and expects a response.
    awaiting: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    started: Instant,
    /// Milliseconds since `started` at the last observed heartbeat.
    last_heartbeat_ms: AtomicU64,
    command_timeout: Duration,
    response_timeout: Duration,
}

impl Connection {
    /// Dial `addr`, perform the magic + IDENTIFY handshake, and spawn the
    /// reader and writer tasks. Message frames are forwarded to `incoming`
    /// when provided; producer connections pass `None`.
    pub(crate) async fn connect(
        addr: &ServerAddress,
        config: &Config,
        incoming: Option<mpsc::Sender<InboundMessage>>,
        on_error: Option<ErrorCallback>,
    ) -> Result<Arc<Connection>> {
        let connect = TcpStream::connect((addr.host(), addr.port()));
        let stream = time::timeout(config.command_timeout, connect)
            .await
            .map_err(|_| Error::timeout("connect"))?
            .map_err(|source| Error::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true).map_err(|source| Error::Connect {
            addr: addr.to_string(),
            source,
        })?;
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(MAGIC_V2).await?;

        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (response_tx, response_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);

        let conn = Arc::new(Connection {
            addr: addr.clone(),
            writer_tx,
            in_flight: Semaphore::new(1),
            responses: Mutex::new(response_rx),
            awaiting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
            // Biased into the past so `backdate_heartbeat` can express a
            // heartbeat older than the connection in u64 milliseconds.
            started: Instant::now()
                .checked_sub(HEARTBEAT_MAX_INTERVAL * 2)
                .unwrap_or_else(Instant::now),
            last_heartbeat_ms: AtomicU64::new(0),
            command_timeout: config.command_timeout,
            response_timeout: config.response_timeout,
        });
        conn.mark_heartbeat();

        tokio::spawn(writer_loop(
            write_half,
            writer_rx,
            conn.shutdown.subscribe(),
            Arc::downgrade(&conn),
        ));
        tokio::spawn(reader_loop(ReaderTask {
            read_half,
            conn: Arc::downgrade(&conn),
            response_tx,
            incoming,
            on_error,
            shutdown: conn.shutdown.subscribe(),
            max_frame_bytes: config.max_frame_bytes,
            offer_timeout: config.response_timeout,
        }));

        match conn
            .command_and_wait(Command::identify(config.identify_body()))
            .await
        {
            Ok(Frame::Response(_)) => Ok(conn),
            Ok(Frame::Error(text)) => {
                conn.close();
                Err(Error::from_error_frame(&text))
            }
            Ok(Frame::Message(_)) => {
                conn.close();
                Err(Error::Protocol("message frame during handshake".into()))
            }
            Err(err) => {
                conn.close();
                Err(err)
            }
        }
    }

    pub(crate) fn addr(&self) -> &ServerAddress {
        &self.addr
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Connected and heartbeating inside the liveness window.
    pub(crate) fn is_healthy(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last_ms = self.last_heartbeat_ms.load(Ordering::SeqCst);
        now_ms.saturating_sub(last_ms) < HEARTBEAT_MAX_INTERVAL.as_millis() as u64
    }

    /// Send a command and wait for the broker's acknowledgement frame.
    pub(crate) async fn command_and_wait(&self, command: Command) -> Result<Frame> {
        let permit = match time::timeout(self.command_timeout, self.in_flight.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => {
                self.close();
                return Err(Error::timeout("command slot"));
            }
        };
        {
            // Anything still queued belongs to a previous command that gave
            // up; it must not be handed to this one.
            let mut responses = self.responses.lock().await;
            while let Ok(stale) = responses.try_recv() {
                tracing::debug!(?stale, "discarding stale response");
            }
        }
        self.awaiting.store(true, Ordering::SeqCst);
        let result = self.exchange(command).await;
        self.awaiting.store(false, Ordering::SeqCst);
        drop(permit);
        if matches!(result, Err(Error::Timeout { .. })) {
            self.close();
        }
        result
    }

    async fn exchange(&self, command: Command) -> Result<Frame> {
        let done = self.enqueue(command).await?;
        match time::timeout(self.command_timeout, done).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => return Err(err.into()),
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => return Err(Error::timeout("command write")),
        }
        let mut responses = self.responses.lock().await;
        match time::timeout(self.command_timeout, responses.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(Error::Closed),
            Err(_) => Err(Error::timeout("broker response")),
        }
    }

    /// Send a command that expects no acknowledgement. Resolves once the
    /// bytes are flushed to the socket.
    pub(crate) async fn send(&self, command: Command) -> Result<()> {
        let done = self.enqueue(command).await?;
        match time::timeout(self.command_timeout, done).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(err.into()),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.close();
                Err(Error::timeout("command write"))
            }
        }
    }

    /// Queue a command and return a future that resolves when the bytes hit
    /// the socket. The split lets callers detach from write completion.
    pub(crate) async fn send_async(
        &self,
        command: Command,
    ) -> Result<impl std::future::Future<Output = Result<()>>> {
        let done = self.enqueue(command).await?;
        Ok(async move {
            match done.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.into()),
                Err(_) => Err(Error::Closed),
            }
        })
    }

    async fn enqueue(&self, command: Command) -> Result<oneshot::Receiver<std::io::Result<()>>> {
        if !self.is_connected() {
            return Err(Error::Closed);
        }
        let bytes = command.encode()?;
        let (done, done_rx) = oneshot::channel();
        self.writer_tx
            .send(WriteRequest { bytes, done })
            .await
            .map_err(|_| Error::Closed)?;
        Ok(done_rx)
    }

    /// Best-effort queueing for replies generated inside the reader.
    fn try_send_detached(&self, command: Command) {
        if let Ok(bytes) = command.encode() {
            let (done, _discard) = oneshot::channel();
            let _ = self.writer_tx.try_send(WriteRequest { bytes, done });
        }
    }

    /// Ask the broker to stop deliveries, then tear the connection down.
    pub(crate) async fn close_gracefully(&self) {
        let _ = self.send(Command::start_close()).await;
        self.close();
    }

    /// Idempotent teardown: wakes both tasks and fails queued commands.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        self.in_flight.close();
    }

    fn mark_heartbeat(&self) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        self.last_heartbeat_ms.store(now_ms, Ordering::SeqCst);
    }

    fn is_awaiting(&self) -> bool {
        self.awaiting.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn backdate_heartbeat(&self, age: Duration) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        self.last_heartbeat_ms
            .store(now_ms.saturating_sub(age.as_millis() as u64), Ordering::SeqCst);
    }
}

async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut requests: mpsc::Receiver<WriteRequest>,
    mut shutdown: watch::Receiver<bool>,
    conn: Weak<Connection>,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let result = write_all(&mut write_half, &request.bytes).await;
        let failed = result.is_err();
        if let Err(err) = &result {
            tracing::warn!(error = %err, "connection write failed");
        }
        let _ = request.done.send(result);
        if failed {
            break;
        }
    }
    let _ = write_half.shutdown().await;
    if let Some(conn) = conn.upgrade() {
        conn.close();
    }
}

async fn write_all(write_half: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    write_half.write_all(bytes).await?;
    write_half.flush().await
}

struct ReaderTask {
    read_half: OwnedReadHalf,
    conn: Weak<Connection>,
    response_tx: mpsc::Sender<Frame>,
    incoming: Option<mpsc::Sender<InboundMessage>>,
    on_error: Option<ErrorCallback>,
    shutdown: watch::Receiver<bool>,
    max_frame_bytes: usize,
    offer_timeout: Duration,
}

async fn reader_loop(mut task: ReaderTask) {
    let mut scratch = BytesMut::new();
    loop {
        let frame = tokio::select! {
            _ = task.shutdown.changed() => break,
            frame = read_frame(&mut task.read_half, &mut scratch, task.max_frame_bytes) => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if dispatch(&task, frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "connection read failed");
                break;
            }
        }
    }
    if let Some(conn) = task.conn.upgrade() {
        conn.close();
    }
}

/// Route one inbound frame. `Err` means the connection must come down.
async fn dispatch(task: &ReaderTask, frame: Frame) -> std::result::Result<(), ()> {
    if frame.is_heartbeat() {
        if let Some(conn) = task.conn.upgrade() {
            conn.mark_heartbeat();
            conn.try_send_detached(Command::nop());
        }
        return Ok(());
    }
    if let Frame::Error(text) = &frame {
        if let Some(on_error) = &task.on_error {
            on_error(text);
        }
    }
    match frame {
        Frame::Message(message) => {
            let Some(incoming) = &task.incoming else {
                tracing::warn!(id = %message.id, "dropping message frame on a producer connection");
                return Ok(());
            };
            let inbound = InboundMessage::new(message, task.conn.clone());
            let offer = incoming.send(inbound);
            match time::timeout(task.offer_timeout, offer).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(()),
                Err(_) => {
                    tracing::warn!("consumer queue full; closing connection");
                    Err(())
                }
            }
        }
        frame => {
            let awaiting = task
                .conn
                .upgrade()
                .map(|conn| conn.is_awaiting())
                .unwrap_or(false);
            if awaiting {
                match time::timeout(task.offer_timeout, task.response_tx.send(frame)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(()),
                    Err(_) => {
                        tracing::warn!("command abandoned its response; closing connection");
                        Err(())
                    }
                }
            } else {
                match &frame {
                    Frame::Error(text) => {
                        tracing::warn!(error = %text, "unsolicited error frame")
                    }
                    _ => tracing::debug!(?frame, "dropping unexpected frame"),
                }
                Ok(())
            }
        }
    }
}
