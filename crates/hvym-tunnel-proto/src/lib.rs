//! HVYM tunnel wire protocol.
//!
//! The tunnel speaks JSON messages over WebSocket text frames, one message
//! per frame, tagged by a `type` discriminator. This crate holds the typed
//! message union and the frame codec shared by client and tests.

pub mod codec;
pub mod message;

pub use codec::{CodecError, decode, encode, decode_body, encode_body};
pub use message::Message;
