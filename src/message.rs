// In-flight message handles.
//
// The connection reader hands raw message frames to the consumer as
// `InboundMessage`; the consumer decodes the body and wraps the result in
// the public `Message<T>` passed to the application callback. Terminal
// acknowledgements consume the handle, so a message is finished or requeued
// at most once.
use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::wire::frame::MessageFrame;
use crate::wire::{Command, CompressType, MessageId};

/// A raw message frame still bound to the connection it arrived on.
pub(crate) struct InboundMessage {
    pub(crate) frame: MessageFrame,
    pub(crate) conn: Weak<Connection>,
}

impl InboundMessage {
    pub(crate) fn new(frame: MessageFrame, conn: Weak<Connection>) -> Self {
        Self { frame, conn }
    }

    /// Decompress the body using the codec stamped on the frame.
    pub(crate) fn decompressed_body(&self) -> std::io::Result<Vec<u8>> {
        match self.frame.compress {
            CompressType::None => Ok(self.frame.body.to_vec()),
            codec => codec.decompress(&self.frame.body),
        }
    }
}

/// A decoded message delivered to the application callback.
///
/// Dropping the handle without calling [`Message::finish`] or
/// [`Message::requeue`] leaves the message in flight on the broker; it will
/// redeliver after the configured message timeout.
pub struct Message<T> {
    id: MessageId,
    attempts: u16,
    timestamp: i64,
    body: T,
    raw_body: Bytes,
    conn: Weak<Connection>,
}

impl<T> Message<T> {
    pub(crate) fn new(inbound: &InboundMessage, body: T) -> Self {
        Self {
            id: inbound.frame.id,
            attempts: inbound.frame.attempts,
            timestamp: inbound.frame.timestamp,
            body,
            raw_body: inbound.frame.body.clone(),
            conn: inbound.conn.clone(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Delivery attempt counter, starting at 1.
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    /// Broker-assigned enqueue time, nanoseconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }

    /// The wire body before decoding, useful for dead-lettering.
    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    /// Acknowledge successful processing.
    pub async fn finish(self) -> Result<()> {
        self.send(Command::finish(self.id)).await
    }

    /// Hand the message back to the broker for redelivery after `delay_ms`.
    pub async fn requeue(self, delay_ms: u64) -> Result<()> {
        self.send(Command::requeue(self.id, delay_ms)).await
    }

    /// Reset the broker's in-flight timer while processing continues.
    pub async fn touch(&self) -> Result<()> {
        self.send(Command::touch(self.id)).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        let conn = self.connection()?;
        conn.send(command).await
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.conn.upgrade().ok_or(Error::Closed)
    }
}
