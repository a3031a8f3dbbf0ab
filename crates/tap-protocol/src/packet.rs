//! Bus envelope types.
//!
//! Every message on the bus is a [`Packet`]. Administrative packets are
//! ordinary packets addressed to [`TRANSPORT_ADDRESS`] that carry a
//! `resource`/`action` pair instead of application data.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::version::PROTOCOL_VERSION;

/// Reserved destination (and default sender identity) of the transport.
pub const TRANSPORT_ADDRESS: &str = "$transport";

/// Default response token.
pub const RESPONSE_OK: &str = "ok";

/// Response token used for watch notifications.
pub const RESPONSE_CHANGED: &str = "changed";

/// Opaque request correlation identifier.
///
/// On the wire this is usually a string, but integer ids are accepted and
/// kept in their decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MsgId(String);

impl MsgId {
    /// Create a new message id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MsgId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MsgId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for MsgId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

struct MsgIdVisitor;

impl<'de> Visitor<'de> for MsgIdVisitor {
    type Value = MsgId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string or integer message id")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<MsgId, E> {
        Ok(MsgId::from(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<MsgId, E> {
        Ok(MsgId(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<MsgId, E> {
        Ok(MsgId::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<MsgId, E> {
        Ok(MsgId(v.to_string()))
    }
}

impl<'de> Deserialize<'de> for MsgId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MsgIdVisitor)
    }
}

/// Decode a field that is only meaningful as a string; any other JSON value
/// decodes as absent.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        _ => None,
    })
}

/// A bus envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Protocol major version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<u8>,
    /// Sender address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Destination address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    /// Request correlation id of this packet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<MsgId>,
    /// Id of the request this packet answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MsgId>,
    /// Creation time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    /// Addressed resource.
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub resource: Option<String>,
    /// Requested action.
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub action: Option<String>,
    /// Response status token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Value>,
    /// Fields this crate does not interpret, kept for forwarding.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Packet {
    /// Create an administrative request addressed to the transport.
    #[must_use]
    pub fn request(
        msg_id: impl Into<MsgId>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            dst: Some(TRANSPORT_ADDRESS.to_string()),
            msg_id: Some(msg_id.into()),
            resource: Some(resource.into()),
            action: Some(action.into()),
            ..Self::default()
        }
    }

    /// Create a response packet.
    ///
    /// A missing `response` token defaults to [`RESPONSE_OK`].
    #[must_use]
    pub fn reply(reply_to: Option<MsgId>, response: Option<&str>, entity: Option<Value>) -> Self {
        Self {
            reply_to,
            response: Some(response.unwrap_or(RESPONSE_OK).to_string()),
            entity,
            ..Self::default()
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_entity(mut self, entity: Value) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Attach a destination.
    #[must_use]
    pub fn with_dst(mut self, dst: impl Into<String>) -> Self {
        self.dst = Some(dst.into());
        self
    }

    /// Check whether this packet is addressed to the transport.
    #[must_use]
    pub fn is_transport_bound(&self) -> bool {
        self.dst.as_deref() == Some(TRANSPORT_ADDRESS)
    }

    /// The `msgId` nested inside `entity`, if any.
    ///
    /// Cancellation requests name the subscription they cancel this way.
    #[must_use]
    pub fn entity_msg_id(&self) -> Option<MsgId> {
        match self.entity.as_ref()?.get("msgId")? {
            Value::String(s) => Some(MsgId::from(s.as_str())),
            Value::Number(n) => Some(MsgId::new(n.to_string())),
            _ => None,
        }
    }
}

/// Current time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Fill in the envelope fields a sender is responsible for.
///
/// Only absent fields are set; anything already present is kept.
#[must_use]
pub fn normalize(mut packet: Packet, src: &str, msg_id: impl FnOnce() -> MsgId) -> Packet {
    packet.ver.get_or_insert(PROTOCOL_VERSION.major);
    packet.time.get_or_insert_with(now_millis);
    packet.src.get_or_insert_with(|| src.to_string());
    packet.msg_id.get_or_insert_with(msg_id);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_packet_wire_names() {
        let packet = Packet::request("i:1", "traffic", "start");
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["msgId"], "i:1");
        assert_eq!(value["dst"], "$transport");
        assert!(value.get("replyTo").is_none());
    }

    #[test]
    fn test_non_string_resource_decodes_as_absent() {
        let packet: Packet =
            serde_json::from_value(json!({"resource": 42, "action": "start", "msgId": 7}))
                .unwrap();
        assert!(packet.resource.is_none());
        assert_eq!(packet.action.as_deref(), Some("start"));
        assert_eq!(packet.msg_id, Some(MsgId::from("7")));
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let packet: Packet =
            serde_json::from_value(json!({"dst": "x", "permissions": {"a": 1}})).unwrap();
        assert_eq!(packet.extra["permissions"], json!({"a": 1}));

        let back = serde_json::to_value(&packet).unwrap();
        assert_eq!(back["permissions"], json!({"a": 1}));
    }

    #[test]
    fn test_reply_defaults_to_ok() {
        let reply = Packet::reply(Some("i:9".into()), None, None);
        assert_eq!(reply.response.as_deref(), Some(RESPONSE_OK));
        assert_eq!(reply.reply_to, Some(MsgId::from("i:9")));
    }

    #[test]
    fn test_entity_msg_id() {
        let packet = Packet::request("i:2", "traffic", "stop").with_entity(json!({"msgId": "i:1"}));
        assert_eq!(packet.entity_msg_id(), Some(MsgId::from("i:1")));

        let bare = Packet::request("i:3", "traffic", "stop");
        assert!(bare.entity_msg_id().is_none());
    }

    #[test]
    fn test_normalize_keeps_existing_fields() {
        let mut packet = Packet::reply(None, None, None);
        packet.src = Some("$transport".to_string());

        let fixed = normalize(packet, "conn_1", || MsgId::from("i:100"));
        assert_eq!(fixed.src.as_deref(), Some("$transport"));
        assert_eq!(fixed.msg_id, Some(MsgId::from("i:100")));
        assert_eq!(fixed.ver, Some(PROTOCOL_VERSION.major));
        assert!(fixed.time.is_some());
    }
}
