//! KDE Connect Network Packet
//!
//! Packets are JSON objects terminated by a single newline.
//!
//! ## Packet Structure
//!
//! - `id`: UNIX epoch timestamp in milliseconds
//! - `type`: packet type in the form `kdeconnect.<plugin>[.<action>]`
//! - `body`: object of plugin-specific fields
//! - `payloadSize`: (optional) size of the payload in bytes, `-1` if unbounded
//! - `payloadTransferInfo`: (optional) object describing the side transfer
//!
//! A payload is never inlined in the body. `payloadTransferInfo` is carried
//! verbatim for the transport layer and not interpreted here.
//!
//! ## References
//! - [Valent Protocol Reference](https://valent.andyholmes.ca/documentation/protocol.html)

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity exchange packet type
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";

/// Pairing packet type
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

/// Maximum length of a single serialized packet (8 MiB)
pub const MAX_PACKET_SIZE: usize = 8 * 1024 * 1024;

/// A KDE Connect network packet
///
/// # Examples
///
/// ```
/// use kdeconnect_session::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new("kdeconnect.ping", json!({ "message": "hi" }));
/// let bytes = packet.to_bytes().unwrap();
///
/// let parsed = Packet::from_bytes(&bytes).unwrap();
/// assert_eq!(parsed.packet_type, "kdeconnect.ping");
/// assert_eq!(parsed.body["message"], "hi");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// UNIX timestamp in milliseconds
    /// Some clients send this as a string
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        serialize_with = "serialize_id"
    )]
    pub id: i64,

    /// Packet type
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Plugin-specific parameters
    pub body: Value,

    /// Payload size in bytes (-1 for indefinite streams)
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Payload transfer negotiation info
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<Map<String, Value>>,
}

impl Packet {
    /// Create a packet stamped with the current time
    ///
    /// A non-object `body` is replaced with an empty object.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self::with_id(current_timestamp(), packet_type, body)
    }

    /// Create a packet with an explicit id
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        let body = if body.is_object() {
            body
        } else {
            Value::Object(Map::new())
        };

        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Build a packet from an already-parsed JSON document
    ///
    /// The document must be an object with a string `type` and an object
    /// `body`. `payloadSize`, if present, must be an integer and
    /// `payloadTransferInfo`, if present, must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        let root = value.as_object().ok_or_else(|| {
            ProtocolError::InvalidPacket("expected the root element to be an object".to_string())
        })?;

        match root.get("type") {
            Some(Value::String(_)) => {}
            _ => {
                return Err(ProtocolError::InvalidPacket(
                    "expected \"type\" field holding a string".to_string(),
                ))
            }
        }

        match root.get("body") {
            Some(Value::Object(_)) => {}
            _ => {
                return Err(ProtocolError::InvalidPacket(
                    "expected \"body\" field holding an object".to_string(),
                ))
            }
        }

        if let Some(size) = root.get("payloadSize") {
            if size.as_i64().is_none() {
                return Err(ProtocolError::InvalidPacket(
                    "expected \"payloadSize\" field to hold an integer".to_string(),
                ));
            }
        }

        if let Some(info) = root.get("payloadTransferInfo") {
            if !info.is_object() {
                return Err(ProtocolError::InvalidPacket(
                    "expected \"payloadTransferInfo\" field to hold an object".to_string(),
                ));
            }
        }

        serde_json::from_value(value).map_err(|e| {
            ProtocolError::InvalidPacket(format!("Failed to deserialize packet: {}", e))
        })
    }

    /// Serialize to bytes with the newline terminator
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self)?;
        let mut bytes = json.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize and validate a packet
    ///
    /// Accepts `\n`, `\r\n` or no terminator.
    ///
    /// # Examples
    ///
    /// ```
    /// use kdeconnect_session::Packet;
    ///
    /// let data = br#"{"id":"1234","type":"kdeconnect.ping","body":{}}"#;
    /// let packet = Packet::from_bytes(data).unwrap();
    /// assert_eq!(packet.id, 1234);
    ///
    /// assert!(Packet::from_bytes(br#"{"type":"kdeconnect.ping"}"#).is_err());
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(
                data.len(),
                MAX_PACKET_SIZE,
            ));
        }

        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        let value: Value = serde_json::from_slice(trimmed).map_err(|e| {
            ProtocolError::InvalidPacket(format!("Failed to parse packet: {}", e))
        })?;

        Self::from_value(value)
    }

    /// Builder pattern: set the payload size
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Builder pattern: set the payload transfer info
    pub fn with_payload_transfer_info(mut self, info: Map<String, Value>) -> Self {
        self.payload_transfer_info = Some(info);
        self
    }

    /// Builder pattern: add a field to the body
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Check the packet type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Whether the packet announces a payload
    pub fn has_payload(&self) -> bool {
        self.payload_transfer_info.is_some()
    }

    /// Get a body field as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Get a boolean body field, `None` if missing or not a boolean
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }

    /// Get a string body field, `None` if missing or not a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Get a string-array body field
    ///
    /// Non-string elements are skipped.
    pub fn get_strv(&self, key: &str) -> Option<Vec<String>> {
        self.body.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_packet() {
        let packet = Packet::new("kdeconnect.ping", json!({}));
        assert_eq!(packet.packet_type, "kdeconnect.ping");
        assert!(packet.body.is_object());
        assert!(packet.id > 0);
    }

    #[test]
    fn test_non_object_body_is_replaced() {
        let packet = Packet::new("kdeconnect.ping", json!(null));
        assert_eq!(packet.body, json!({}));
    }

    #[test]
    fn test_packet_ends_with_newline() {
        let packet = Packet::new("kdeconnect.pair", json!({ "pair": true }));
        let bytes = packet.to_bytes().unwrap();

        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_string_id_accepted() {
        let data = br#"{"id":"1700000000000","type":"kdeconnect.ping","body":{}}"#;
        let packet = Packet::from_bytes(data).unwrap();
        assert_eq!(packet.id, 1_700_000_000_000);
    }

    #[test]
    fn test_crlf_terminator() {
        let data = b"{\"id\":1,\"type\":\"kdeconnect.ping\",\"body\":{}}\r\n";
        assert!(Packet::from_bytes(data).is_ok());
    }

    #[test]
    fn test_missing_body_rejected() {
        let err = Packet::from_bytes(br#"{"id":1,"type":"kdeconnect.ping"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPacket(_)));
    }

    #[test]
    fn test_non_string_type_rejected() {
        let err = Packet::from_bytes(br#"{"id":1,"type":7,"body":{}}"#).unwrap_err();
        assert!(err.to_string().contains("\"type\""));
    }

    #[test]
    fn test_array_body_rejected() {
        let err = Packet::from_bytes(br#"{"id":1,"type":"a.b","body":[]}"#).unwrap_err();
        assert!(err.to_string().contains("\"body\""));
    }

    #[test]
    fn test_payload_fields_validated() {
        let bad_size = br#"{"id":1,"type":"a.b","body":{},"payloadSize":"12"}"#;
        assert!(Packet::from_bytes(bad_size).is_err());

        let bad_info = br#"{"id":1,"type":"a.b","body":{},"payloadTransferInfo":5}"#;
        assert!(Packet::from_bytes(bad_info).is_err());

        let good = br#"{"id":1,"type":"kdeconnect.share.request","body":{},"payloadSize":-1,"payloadTransferInfo":{"port":1739}}"#;
        let packet = Packet::from_bytes(good).unwrap();
        assert_eq!(packet.payload_size, Some(-1));
        assert!(packet.has_payload());
    }

    #[test]
    fn test_not_json_rejected() {
        let err = Packet::from_bytes(b"not json\n").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPacket(_)));
    }

    #[test]
    fn test_oversized_rejected() {
        let data = vec![b' '; MAX_PACKET_SIZE + 1];
        let err = Packet::from_bytes(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::PacketSizeExceeded(_, MAX_PACKET_SIZE)));
    }

    #[test]
    fn test_body_accessors() {
        let packet = Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceName": "Pixel",
                "pair": true,
                "incomingCapabilities": ["kdeconnect.ping", 3, "kdeconnect.battery"],
            }),
        );

        assert_eq!(packet.get_str("deviceName"), Some("Pixel"));
        assert_eq!(packet.get_bool("pair"), Some(true));
        assert_eq!(packet.get_bool("deviceName"), None);
        assert_eq!(
            packet.get_strv("incomingCapabilities"),
            Some(vec![
                "kdeconnect.ping".to_string(),
                "kdeconnect.battery".to_string()
            ])
        );
        assert_eq!(packet.get_body_field::<String>("missing"), None);
    }

    #[test]
    fn test_builder_fields() {
        let mut info = Map::new();
        info.insert("port".to_string(), json!(1739));

        let packet = Packet::new("kdeconnect.share.request", json!({}))
            .with_body_field("filename", "photo.jpg")
            .with_payload_size(2048)
            .with_payload_transfer_info(info);

        assert_eq!(packet.get_str("filename"), Some("photo.jpg"));
        assert_eq!(packet.payload_size, Some(2048));
        assert!(packet.is_type("kdeconnect.share.request"));
    }
}
