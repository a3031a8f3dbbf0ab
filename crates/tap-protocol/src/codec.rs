//! Codec for encoding and decoding bus packets.
//!
//! Binary frames are MessagePack with a length prefix. Text frames are plain
//! JSON, one packet per frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::packet::Packet;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON text frame error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a packet to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded packet
///
/// # Errors
///
/// Returns an error if the packet is too large or encoding fails.
pub fn encode(packet: &Packet) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a packet into an existing buffer.
///
/// # Errors
///
/// Returns an error if the packet is too large or encoding fails.
pub fn encode_into(packet: &Packet, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(packet)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a packet from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let packet = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(packet)
}

/// Try to decode a packet from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(packet))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let packet = rmp_serde::from_slice(&payload)?;

    Ok(Some(packet))
}

/// Decode a packet from a JSON text frame.
///
/// # Errors
///
/// Returns an error if the text is too large or not a packet.
pub fn decode_json(text: &str) -> Result<Packet, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Encode a packet as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json(packet: &Packet) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(packet)?)
}

/// Codec for streaming packet encoding/decoding.
#[derive(Debug, Default)]
pub struct PacketCodec {
    buffer: BytesMut,
}

impl PacketCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a packet to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, packet: &Packet) -> Result<Bytes, ProtocolError> {
        encode(packet)
    }

    /// Append received bytes and decode every complete packet.
    ///
    /// Partial trailing frames stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is invalid.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Packet>, ProtocolError> {
        self.buffer.extend_from_slice(data);
        let mut packets = Vec::new();
        while let Some(packet) = decode_from(&mut self.buffer)? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Number of buffered bytes not yet decoded.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_preserves_entity() {
        let packet =
            Packet::request("i:1", "traffic", "stop").with_entity(json!({"msgId": "i:0"}));

        let decoded = decode(&encode(&packet).unwrap()).unwrap();
        assert_eq!(decoded.entity, packet.entity);
        assert_eq!(decoded.msg_id, packet.msg_id);
    }

    #[test]
    fn test_decode_incomplete() {
        let packet = Packet::request("i:1", "metrics", "getAll");
        let encoded = encode(&packet).unwrap();

        match decode(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        match decode_from(&mut buf) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_codec_feed_across_chunks() {
        let first = Packet::request("i:1", "traffic", "start");
        let second = Packet::request("i:2", "apis", "getEndpoints");

        let mut bytes = BytesMut::new();
        encode_into(&first, &mut bytes).unwrap();
        encode_into(&second, &mut bytes).unwrap();

        let mut codec = PacketCodec::new();
        let split = bytes.len() - 3;
        let decoded = codec.feed(&bytes[..split]).unwrap();
        assert_eq!(decoded, vec![first]);
        assert_eq!(codec.pending(), split - encode(&decoded[0]).unwrap().len());

        let decoded = codec.feed(&bytes[split..]).unwrap();
        assert_eq!(decoded, vec![second]);
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_json_text_frame() {
        let packet = decode_json(r#"{"dst":"$transport","resource":"TRAFFIC","action":" Start ","msgId":"i:5"}"#)
            .unwrap();
        assert!(packet.is_transport_bound());
        assert_eq!(packet.resource.as_deref(), Some("TRAFFIC"));

        let text = encode_json(&packet).unwrap();
        assert!(text.contains("\"msgId\":\"i:5\""));
    }
}
