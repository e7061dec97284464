// Client defaults and the negotiated IDENTIFY payload.
use serde::Serialize;
use std::time::Duration;

use crate::wire::CompressType;

pub(crate) const DEFAULT_MESSAGES_PER_BATCH: usize = 200;
pub(crate) const DEFAULT_EXECUTOR_THREADS: usize = 4;
pub(crate) const DEFAULT_LOOKUP_PERIOD: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_CONNECTION_RETRIES: u32 = 5;
pub(crate) const POOL_RETRY_DELAY: Duration = Duration::from_secs(1);
pub(crate) const BACKOFF_STEP: Duration = Duration::from_millis(500);
pub(crate) const BACKOFF_CAP: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_POOL_CAPACITY: usize = 4;

/// How long a single command write may take, and how long we wait for the
/// broker's acknowledgement once the write completes. Brokers answer well
/// inside this window; exceeding it means the connection is wedged and is
/// treated as fatal for the connection.
pub(crate) const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// How long the reader may block handing a broker response to the waiting
/// command before giving up and closing the connection.
pub(crate) const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

/// A connection with no heartbeat inside this window is considered dead.
/// Brokers heartbeat every 30s by default, so one missed beat plus slack.
pub(crate) const HEARTBEAT_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Hard safety cap for any single inbound frame.
///
/// The frame reader sizes its buffer from the peer-advertised length; without
/// a cap a buggy or malicious broker could advertise an enormous length and
/// trigger OOM. Raise via `Config::max_frame_bytes` if you really publish
/// larger bodies.
pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Connection and negotiation settings shared by producers and consumers.
///
/// The broker echoes back what it actually granted during IDENTIFY; fields
/// left as `None` are omitted from the payload and keep the broker default.
#[derive(Clone, Debug)]
pub struct Config {
    pub client_id: Option<String>,
    pub hostname: String,
    pub user_agent: String,
    /// Body codec applied to published payloads and expected on consumed
    /// ones. Both sides of a topic must agree on it.
    pub compress: Option<CompressType>,
    pub heartbeat_interval_ms: Option<i64>,
    pub msg_timeout_ms: Option<i64>,
    pub sample_rate: Option<u8>,
    pub output_buffer_size: Option<i64>,
    pub output_buffer_timeout_ms: Option<i64>,
    pub tls_v1: bool,
    /// Level passed to the broker when the Deflate codec is negotiated.
    pub deflate_level: Option<u32>,
    pub pool_capacity: usize,
    /// RDY batch size per connection; also the refill watermark basis.
    pub messages_per_batch: usize,
    pub executor_threads: usize,
    pub lookup_period: Duration,
    pub max_frame_bytes: usize,
    pub command_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: None,
            hostname: default_hostname(),
            user_agent: concat!("nsq-client/", env!("CARGO_PKG_VERSION")).to_string(),
            compress: None,
            heartbeat_interval_ms: None,
            msg_timeout_ms: None,
            sample_rate: None,
            output_buffer_size: None,
            output_buffer_timeout_ms: None,
            tls_v1: false,
            deflate_level: None,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            messages_per_batch: DEFAULT_MESSAGES_PER_BATCH,
            executor_threads: DEFAULT_EXECUTOR_THREADS,
            lookup_period: DEFAULT_LOOKUP_PERIOD,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl Config {
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn compress(mut self, compress: CompressType) -> Self {
        self.compress = match compress {
            CompressType::None => None,
            other => Some(other),
        };
        self
    }

    pub fn messages_per_batch(mut self, count: usize) -> Self {
        self.messages_per_batch = count.max(1);
        self
    }

    pub fn lookup_period(mut self, period: Duration) -> Self {
        self.lookup_period = period;
        self
    }

    pub(crate) fn body_compress(&self) -> CompressType {
        self.compress.unwrap_or(CompressType::None)
    }

    /// Serialize the IDENTIFY payload sent right after the magic marker.
    /// The negotiated codec rides along both as the protocol's boolean
    /// flags and as the ordinal stamped on message frames.
    pub(crate) fn identify_body(&self) -> Vec<u8> {
        let compress = self.body_compress();
        let identify = Identify {
            client_id: self.client_id.as_deref(),
            hostname: &self.hostname,
            user_agent: &self.user_agent,
            feature_negotiation: true,
            heartbeat_interval: self.heartbeat_interval_ms,
            msg_timeout: self.msg_timeout_ms,
            sample_rate: self.sample_rate,
            output_buffer_size: self.output_buffer_size,
            output_buffer_timeout: self.output_buffer_timeout_ms,
            tls_v1: self.tls_v1.then_some(true),
            compress: compress.ordinal(),
            snappy: (compress == CompressType::Snappy).then_some(true),
            deflate: (compress == CompressType::Deflate).then_some(true),
            deflate_level: match compress {
                CompressType::Deflate => self.deflate_level,
                _ => None,
            },
        };
        // The field set is plain data; serialization cannot fail.
        serde_json::to_vec(&identify).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct Identify<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    hostname: &'a str,
    user_agent: &'a str,
    feature_negotiation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    heartbeat_interval: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg_timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_rate: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_buffer_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_buffer_timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_v1: Option<bool>,
    compress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    snappy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deflate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deflate_level: Option<u32>,
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
