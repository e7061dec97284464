//! Wire-level protocol pieces shared by the connection, producer and
//! consumer: the frame reader, command encoder and body codecs.

pub mod command;
pub mod compress;
pub mod frame;

pub use command::{BodyWriter, Command};
pub use compress::CompressType;
pub use frame::{Frame, MessageFrame, MessageId, FRAME_TYPE_ERROR, FRAME_TYPE_MESSAGE, FRAME_TYPE_RESPONSE, HEARTBEAT, MAGIC_V2};
