//! Portway control channel protocol
//!
//! Message envelope shared by the relay and tunnel clients, and the
//! length-prefixed framing used to carry it over a byte stream.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, Frame, TunnelCodec};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;
