//! # tap-protocol
//!
//! Envelope and wire format for the tapline message bus.
//!
//! Every bus message is a [`Packet`]. Packets travel either as JSON text
//! frames or as length-prefixed MessagePack binary frames.
//!
//! ## Example
//!
//! ```rust
//! use tap_protocol::{codec, Packet};
//!
//! // Ask the transport for a metrics snapshot
//! let packet = Packet::request("i:1", "metrics", "getAll");
//!
//! // Encode and decode
//! let encoded = codec::encode(&packet).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert!(decoded.is_transport_bound());
//! ```

pub mod codec;
pub mod packet;
pub mod version;

pub use codec::{decode, encode, PacketCodec, ProtocolError};
pub use packet::{
    normalize, now_millis, MsgId, Packet, RESPONSE_CHANGED, RESPONSE_OK, TRANSPORT_ADDRESS,
};
pub use version::{Version, PROTOCOL_VERSION};
