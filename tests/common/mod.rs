// In-process stand-ins for nsqd and nsqlookupd.
//
// The fake nsqd speaks just enough of the V2 TCP protocol for the client:
// handshake, SUB/RDY flow control, the publish family, and FIN/REQ/TOUCH
// acknowledgements. Published messages are queued per topic and delivered
// to subscribed connections as their RDY credit allows.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use nsq_client::ServerAddress;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

#[derive(Clone)]
struct Pending {
    topic: String,
    body: Vec<u8>,
    attempts: u16,
}

struct InFlight {
    since: Instant,
    pending: Pending,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, VecDeque<Pending>>,
    in_flight: HashMap<String, InFlight>,
    finished: Vec<String>,
    requeued: Vec<String>,
    next_id: u64,
}

struct ConnState {
    topic: Option<String>,
    rdy: usize,
}

pub struct FakeNsqd {
    pub addr: ServerAddress,
    state: Arc<Mutex<BrokerState>>,
}

/// Route client traces to the test output; `RUST_LOG`-free, fmt defaults.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

impl FakeNsqd {
    pub async fn start() -> Self {
        Self::start_with_msg_timeout(Duration::from_secs(30)).await
    }

    /// A broker that puts unacknowledged messages back on the queue once
    /// `msg_timeout` elapses, like the real in-flight timeout.
    pub async fn start_with_msg_timeout(msg_timeout: Duration) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind nsqd");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(Mutex::new(BrokerState::default()));
        tokio::spawn(expire_loop(state.clone(), msg_timeout));
        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(handle_conn(sock, accept_state.clone()));
            }
        });
        Self {
            addr: ServerAddress::new("127.0.0.1", port),
            state,
        }
    }

    pub fn finished(&self) -> Vec<String> {
        self.state().finished.clone()
    }

    pub fn requeued(&self) -> Vec<String> {
        self.state().requeued.clone()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state().in_flight.len()
    }

    pub fn queued_count(&self, topic: &str) -> usize {
        self.state()
            .topics
            .get(topic)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn response_frame(text: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(4 + text.len() as u32);
    buf.put_u32(0);
    buf.extend_from_slice(text);
    buf.to_vec()
}

fn message_frame(id: &str, attempts: u16, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(4 + 8 + 2 + 1 + 16 + body.len() as u32);
    buf.put_u32(2);
    buf.put_i64(1_700_000_000_000_000_000);
    buf.put_u16(attempts);
    buf.put_u8(0);
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(body);
    buf.to_vec()
}

async fn handle_conn(sock: TcpStream, state: Arc<Mutex<BrokerState>>) {
    let (read_half, write_half) = sock.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let conn = Arc::new(Mutex::new(ConnState {
        topic: None,
        rdy: 0,
    }));
    let pump = tokio::spawn(deliver_loop(writer.clone(), state.clone(), conn.clone()));
    let _ = serve_commands(read_half, writer, state, conn).await;
    pump.abort();
}

async fn serve_commands(
    read_half: OwnedReadHalf,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    state: Arc<Mutex<BrokerState>>,
    conn: Arc<Mutex<ConnState>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(read_half);
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    assert_eq!(&magic, b"  V2");

    loop {
        let line = match read_line(&mut reader).await? {
            Some(line) => line,
            None => return Ok(()),
        };
        let mut parts = line.split(' ');
        let verb = parts.next().unwrap_or("");
        match verb {
            "IDENTIFY" => {
                read_sized_body(&mut reader).await?;
                writer.lock().await.write_all(&response_frame(b"OK")).await?;
            }
            "SUB" => {
                let topic = parts.next().unwrap_or("").to_string();
                lock(&state).topics.entry(topic.clone()).or_default();
                lock(&conn).topic = Some(topic);
                writer.lock().await.write_all(&response_frame(b"OK")).await?;
            }
            "RDY" => {
                lock(&conn).rdy = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
            }
            "PUB" | "DPUB" => {
                let topic = parts.next().unwrap_or("").to_string();
                let body = read_sized_body(&mut reader).await?;
                publish(&state, &topic, body);
                writer.lock().await.write_all(&response_frame(b"OK")).await?;
            }
            "MPUB" => {
                let topic = parts.next().unwrap_or("").to_string();
                let outer = read_sized_body(&mut reader).await?;
                for body in parse_multi(&outer) {
                    publish(&state, &topic, body);
                }
                writer.lock().await.write_all(&response_frame(b"OK")).await?;
            }
            "FIN" => {
                let id = parts.next().unwrap_or("").to_string();
                let mut state = lock(&state);
                state.in_flight.remove(&id);
                state.finished.push(id);
            }
            "REQ" => {
                let id = parts.next().unwrap_or("").to_string();
                let mut state = lock(&state);
                if let Some(in_flight) = state.in_flight.remove(&id) {
                    state
                        .topics
                        .entry(in_flight.pending.topic.clone())
                        .or_default()
                        .push_back(in_flight.pending);
                }
                state.requeued.push(id);
            }
            "TOUCH" | "NOP" => {}
            "CLS" => {
                lock(&conn).rdy = 0;
                writer
                    .lock()
                    .await
                    .write_all(&response_frame(b"CLOSE_WAIT"))
                    .await?;
            }
            _ => return Ok(()),
        }
    }
}

fn publish(state: &Arc<Mutex<BrokerState>>, topic: &str, body: Vec<u8>) {
    lock(state)
        .topics
        .entry(topic.to_string())
        .or_default()
        .push_back(Pending {
            topic: topic.to_string(),
            body,
            attempts: 0,
        });
}

fn parse_multi(outer: &[u8]) -> Vec<Vec<u8>> {
    let mut bodies = Vec::new();
    let mut cursor = 0usize;
    let count = u32::from_be_bytes(outer[cursor..cursor + 4].try_into().expect("count")) as usize;
    cursor += 4;
    for _ in 0..count {
        let len =
            u32::from_be_bytes(outer[cursor..cursor + 4].try_into().expect("length")) as usize;
        cursor += 4;
        bodies.push(outer[cursor..cursor + len].to_vec());
        cursor += len;
    }
    bodies
}

async fn deliver_loop(
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    state: Arc<Mutex<BrokerState>>,
    conn: Arc<Mutex<ConnState>>,
) {
    loop {
        time::sleep(Duration::from_millis(10)).await;
        let frames = next_deliveries(&state, &conn);
        for frame in frames {
            if writer.lock().await.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}

fn next_deliveries(state: &Arc<Mutex<BrokerState>>, conn: &Arc<Mutex<ConnState>>) -> Vec<Vec<u8>> {
    let mut conn = lock(conn);
    let Some(topic) = conn.topic.clone() else {
        return Vec::new();
    };
    let mut state = lock(state);
    let mut frames = Vec::new();
    while conn.rdy > 0 {
        let Some(mut pending) = state.topics.entry(topic.clone()).or_default().pop_front() else {
            break;
        };
        pending.attempts += 1;
        state.next_id += 1;
        let id = format!("{:016}", state.next_id);
        frames.push(message_frame(&id, pending.attempts, &pending.body));
        state.in_flight.insert(
            id,
            InFlight {
                since: Instant::now(),
                pending,
            },
        );
        conn.rdy -= 1;
    }
    frames
}

// Sweep in-flight messages back onto their topic queue once they outlive
// the broker's message timeout.
async fn expire_loop(state: Arc<Mutex<BrokerState>>, msg_timeout: Duration) {
    loop {
        time::sleep(Duration::from_millis(50)).await;
        let mut state = lock(&state);
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.since.elapsed() >= msg_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(in_flight) = state.in_flight.remove(&id) {
                state
                    .topics
                    .entry(in_flight.pending.topic.clone())
                    .or_default()
                    .push_back(in_flight.pending);
            }
        }
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Option<String>> {
    let mut line = Vec::new();
    loop {
        match reader.read_u8().await {
            Ok(b'\n') => {
                return Ok(Some(String::from_utf8(line).expect("utf-8 command")));
            }
            Ok(byte) => line.push(byte),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }
    }
}

async fn read_sized_body(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

fn lock<T>(mutex: &Arc<Mutex<T>>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Minimal nsqlookupd: every topic resolves to the single registered nsqd.
pub struct FakeLookupd {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeLookupd {
    pub async fn start(nsqd: &ServerAddress) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind lookupd");
        let port = listener.local_addr().expect("local addr").port();
        let producers = format!(
            r#"{{"producers":[{{"broadcast_address":"{}","tcp_port":{},"http_port":0,"version":"1.2.1"}}]}}"#,
            nsqd.host(),
            nsqd.port(),
        );
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let body = producers.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let _ = serve_http(&mut sock, &body, &seen).await;
                });
            }
        });
        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            requests,
        }
    }

    /// Raw request targets, exactly as they arrived on the wire.
    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }
}

async fn serve_http(
    sock: &mut TcpStream,
    producers: &str,
    requests: &Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    // Read the request head; none of the endpoints take a body.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        sock.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    let path = head.split(' ').nth(1).unwrap_or("/").to_string();
    lock(requests).push(path.clone());
    let body = if path.starts_with("/lookup") || path.starts_with("/nodes") {
        producers
    } else {
        "{}"
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body,
    );
    sock.write_all(response.as_bytes()).await?;
    sock.flush().await
}

/// Poll `cond` for up to two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    false
}
