// Outbound command construction and encoding.
//
// A command is a UTF-8 text line, newline terminated, optionally followed by
// a binary body. Bodies are compressed with the connection's negotiated
// codec before framing. Encoding consumes the command, so every command is
// rendered exactly once; on failure the partial buffer is dropped and a
// single encode-error kind surfaces.
use std::io::{self, Write};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::wire::compress::{write_through, CompressType};
use crate::wire::frame::MessageId;

/// Caller-supplied body writer for the streaming publish paths. The writer
/// sees the (possibly compressing) output stream directly.
pub type BodyWriter = Box<dyn FnOnce(&mut dyn Write) -> io::Result<()> + Send>;

pub struct Command {
    line: String,
    compress: CompressType,
    body: Body,
}

enum Body {
    None,
    Bytes(Vec<u8>),
    /// Multi-publish elements; a single-element collection is re-framed as a
    /// plain body, since MPUB framing is invalid for one message.
    Multi(Vec<Vec<u8>>),
    Writer(BodyWriter),
    Writers(Vec<BodyWriter>),
}

impl Command {
    fn new(line: String, compress: CompressType, body: Body) -> Self {
        Self {
            line,
            compress,
            body,
        }
    }

    /// IDENTIFY with a pre-serialized configuration payload. Generally the
    /// first command sent after the magic marker.
    pub fn identify(body: Vec<u8>) -> Self {
        Self::new("IDENTIFY".into(), CompressType::None, Body::Bytes(body))
    }

    /// IDENTIFY with a streamed payload.
    pub fn identify_writer(writer: BodyWriter) -> Self {
        Self::new("IDENTIFY".into(), CompressType::None, Body::Writer(writer))
    }

    /// SUB to a topic/channel pair.
    pub fn subscribe(topic: &str, channel: &str) -> Self {
        Self::new(format!("SUB {topic} {channel}"), CompressType::None, Body::None)
    }

    /// RDY: advertise how many messages the broker may send before pausing.
    pub fn ready(count: usize) -> Self {
        Self::new(format!("RDY {count}"), CompressType::None, Body::None)
    }

    /// FIN: the message has been processed successfully.
    pub fn finish(id: MessageId) -> Self {
        Self::new(format!("FIN {id}"), CompressType::None, Body::None)
    }

    /// REQ: put the message back on the queue after `timeout_ms`.
    pub fn requeue(id: MessageId, timeout_ms: u64) -> Self {
        Self::new(format!("REQ {id} {timeout_ms}"), CompressType::None, Body::None)
    }

    /// TOUCH: reset the in-flight timeout for the message.
    pub fn touch(id: MessageId) -> Self {
        Self::new(format!("TOUCH {id}"), CompressType::None, Body::None)
    }

    /// NOP, commonly sent in response to heartbeats.
    pub fn nop() -> Self {
        Self::new("NOP".into(), CompressType::None, Body::None)
    }

    /// CLS: begin a graceful close; the broker stops delivering messages.
    pub fn start_close() -> Self {
        Self::new("CLS".into(), CompressType::None, Body::None)
    }

    pub fn publish(topic: &str, compress: CompressType, body: Vec<u8>) -> Self {
        Self::new(format!("PUB {topic}"), compress, Body::Bytes(body))
    }

    pub fn publish_writer(topic: &str, compress: CompressType, writer: BodyWriter) -> Self {
        Self::new(format!("PUB {topic}"), compress, Body::Writer(writer))
    }

    pub fn publish_deferred(
        topic: &str,
        compress: CompressType,
        defer_ms: u64,
        body: Vec<u8>,
    ) -> Self {
        Self::new(format!("DPUB {topic} {defer_ms}"), compress, Body::Bytes(body))
    }

    pub fn publish_deferred_writer(
        topic: &str,
        compress: CompressType,
        defer_ms: u64,
        writer: BodyWriter,
    ) -> Self {
        Self::new(format!("DPUB {topic} {defer_ms}"), compress, Body::Writer(writer))
    }

    /// MPUB over in-memory bodies. Only meaningful with more than one body;
    /// a single element is encoded with the plain publish framing.
    pub fn multi_publish(topic: &str, compress: CompressType, bodies: Vec<Vec<u8>>) -> Self {
        Self::new(format!("MPUB {topic}"), compress, Body::Multi(bodies))
    }

    /// MPUB over streaming body writers.
    pub fn multi_publish_writers(
        topic: &str,
        compress: CompressType,
        writers: Vec<BodyWriter>,
    ) -> Self {
        Self::new(format!("MPUB {topic}"), compress, Body::Writers(writers))
    }

    /// The command verb and arguments, used for diagnostics.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Render the command to wire bytes. Consumes the command: the buffer is
    /// built exactly once.
    pub fn encode(self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.line.len() + 1);
        buf.extend_from_slice(self.line.as_bytes());
        if !self.line.ends_with('\n') {
            buf.put_u8(b'\n');
        }
        match self.body {
            Body::None => {}
            Body::Bytes(data) => encode_single(&mut buf, self.compress, &data)?,
            Body::Multi(mut bodies) => {
                if bodies.len() == 1 {
                    let only = bodies.pop().unwrap_or_default();
                    encode_single(&mut buf, self.compress, &only)?;
                } else {
                    encode_multi(&mut buf, self.compress, &bodies)?;
                }
            }
            Body::Writer(writer) => {
                // Reserve the length, stream the body, then backpatch.
                let at = buf.len();
                buf.put_u32(0);
                let written =
                    write_through(&mut buf, self.compress, writer).map_err(Error::Encode)?;
                patch_u32(&mut buf, at, written as u32);
            }
            Body::Writers(writers) => {
                // Outer total-length and count are backpatched once every
                // per-message placeholder has been filled in.
                let outer = buf.len();
                buf.put_u32(0);
                buf.put_u32(0);
                let mut total: u32 = 4;
                let count = writers.len() as u32;
                for writer in writers {
                    let at = buf.len();
                    buf.put_u32(0);
                    let written =
                        write_through(&mut buf, self.compress, writer).map_err(Error::Encode)?;
                    patch_u32(&mut buf, at, written as u32);
                    total += 4 + written as u32;
                }
                patch_u32(&mut buf, outer, total);
                patch_u32(&mut buf, outer + 4, count);
            }
        }
        Ok(buf.freeze())
    }
}

fn encode_single(buf: &mut BytesMut, compress: CompressType, data: &[u8]) -> Result<()> {
    let compressed = compress.compress(data).map_err(Error::Encode)?;
    buf.put_u32(compressed.len() as u32);
    buf.extend_from_slice(&compressed);
    Ok(())
}

fn encode_multi(buf: &mut BytesMut, compress: CompressType, bodies: &[Vec<u8>]) -> Result<()> {
    let mut compressed = Vec::with_capacity(bodies.len());
    for body in bodies {
        compressed.push(compress.compress(body).map_err(Error::Encode)?);
    }
    // Total body length covers the count field plus each size-prefixed body.
    let mut body_size: u32 = 4;
    for body in &compressed {
        body_size += 4 + body.len() as u32;
    }
    buf.put_u32(body_size);
    buf.put_u32(compressed.len() as u32);
    for body in &compressed {
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(body);
    }
    Ok(())
}

fn patch_u32(buf: &mut BytesMut, at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}
