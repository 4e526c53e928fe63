//! Control channel transport for camlink
//!
//! Binary envelope codec plus the WebSocket that carries it.

pub mod wire;
pub mod message;
pub mod codec;
pub mod channel;

pub use channel::{ChannelEvent, ChannelHandle, ChannelOptions};
pub use codec::{decode_envelope, encode_envelope, WireMessage};
pub use message::{Envelope, Payload};
pub use wire::CodecError;
