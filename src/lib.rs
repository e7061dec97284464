//! Asynchronous NSQ client library.
//!
//! The crate speaks the nsqd V2 TCP protocol and the nsqlookupd HTTP API.
//! [`Producer`] publishes to a fixed set of nsqd nodes over pooled
//! connections; [`Consumer`] discovers the nodes for a topic through
//! lookupd, subscribes a channel on each, and drives a callback with
//! decoded [`Message`]s under RDY-credit flow control. Message bodies can
//! be transparently compressed with Snappy or zlib as long as producers and
//! consumers of a topic agree on the codec via [`Config::compress`].
//!
//! ```no_run
//! use nsq_client::{Config, Producer, ServerAddress};
//!
//! # async fn run() -> nsq_client::Result<()> {
//! let producer = Producer::new(Config::default());
//! producer.add_address(ServerAddress::new("127.0.0.1", 4150));
//! producer.start();
//! producer.publish("events", b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod config;
mod conn;
pub mod consumer;
pub mod error;
pub mod lookup;
pub mod message;
mod pool;
pub mod producer;
pub mod wire;

pub use addr::ServerAddress;
pub use config::Config;
pub use consumer::Consumer;
pub use error::{Error, Result};
pub use lookup::LookupClient;
pub use message::Message;
pub use producer::Producer;
pub use wire::{BodyWriter, CompressType, MessageId};
