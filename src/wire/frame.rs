// Inbound frame parsing for the nsqd TCP protocol.
//
// Every frame is preceded by a 4-byte big-endian total length; the first
// 4 bytes of the payload are a big-endian type code (0 = response,
// 1 = error, 2 = message).
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::wire::compress::CompressType;

/// Protocol version marker written once, immediately after connecting.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Response text of the broker's periodic keep-alive frame.
pub const HEARTBEAT: &str = "_heartbeat_";

pub const FRAME_TYPE_RESPONSE: u32 = 0;
pub const FRAME_TYPE_ERROR: u32 = 1;
pub const FRAME_TYPE_MESSAGE: u32 = 2;

const MESSAGE_ID_LEN: usize = 16;
// Timestamp (8) + attempts (2) + compression ordinal (1) + id (16).
const MESSAGE_HEADER_LEN: usize = 8 + 2 + 1 + MESSAGE_ID_LEN;

/// Opaque 16-byte message token, echoed back in FIN/REQ/TOUCH commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Ids are ASCII on the wire; replace anything else rather than fail.
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(String),
    Error(String),
    Message(MessageFrame),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    /// Broker-assigned nanosecond epoch timestamp.
    pub timestamp: i64,
    /// Count of prior delivery attempts.
    pub attempts: u16,
    /// Per-message codec, negotiated at IDENTIFY time.
    pub compress: CompressType,
    pub id: MessageId,
    /// Opaque body; decompression is deferred to whoever consumes it.
    pub body: Bytes,
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(text) if text == HEARTBEAT)
    }

    /// Decode a frame payload (everything after the 4-byte size prefix).
    pub fn decode(mut payload: Bytes) -> Result<Frame> {
        if payload.remaining() < 4 {
            return Err(Error::Protocol("frame shorter than its type tag".into()));
        }
        let frame_type = payload.get_u32();
        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Frame::Response(read_text(payload)?)),
            FRAME_TYPE_ERROR => Ok(Frame::Error(read_text(payload)?)),
            FRAME_TYPE_MESSAGE => {
                if payload.remaining() < MESSAGE_HEADER_LEN {
                    return Err(Error::Protocol("truncated message frame".into()));
                }
                let timestamp = payload.get_i64();
                let attempts = payload.get_u16();
                let compress = CompressType::from_ordinal(payload.get_u8());
                let mut id = [0u8; MESSAGE_ID_LEN];
                payload.copy_to_slice(&mut id);
                Ok(Frame::Message(MessageFrame {
                    timestamp,
                    attempts,
                    compress,
                    id: MessageId(id),
                    body: payload,
                }))
            }
            other => Err(Error::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

fn read_text(payload: Bytes) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| Error::Protocol("frame text is not valid utf-8".into()))
}

/// Read one length-prefixed frame from the stream, reusing `scratch` to
/// avoid per-frame allocations. Returns `None` on a clean end of stream.
///
/// The declared length is checked against `max_frame_bytes` before any
/// allocation so a buggy or hostile peer cannot trigger unbounded growth.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut size_bytes = [0u8; 4];
    match reader.read_exact(&mut size_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let size = u32::from_be_bytes(size_bytes) as usize;
    if size < 4 {
        return Err(Error::Protocol(format!("frame length {size} too small")));
    }
    if size > max_frame_bytes {
        return Err(Error::Protocol(format!(
            "frame too large: {size} bytes (cap {max_frame_bytes}); refusing"
        )));
    }
    scratch.clear();
    scratch.resize(size, 0u8);
    reader.read_exact(&mut scratch[..]).await?;
    Frame::decode(scratch.split().freeze()).map(Some)
}
