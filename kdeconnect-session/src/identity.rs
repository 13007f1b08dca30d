//! Device Identity
//!
//! Every channel starts with an identity exchange. The identity packet
//! (`kdeconnect.identity`) carries:
//! - `deviceId`: stable identifier, see [`validate_device_id`]
//! - `deviceName`: human-readable name
//! - `deviceType`: desktop, laptop, phone, tablet, or tv
//! - `protocolVersion`: protocol version (currently 7)
//! - `incomingCapabilities`: packet types the device can receive
//! - `outgoingCapabilities`: packet types the device can send
//!
//! Identities are never edited in place. A re-identify replaces the whole
//! value.

use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Name used when a peer does not announce one
pub const DEFAULT_DEVICE_NAME: &str = "Unnamed";

/// Device form factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    /// Wire name of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }

    /// Parse a wire name, falling back to desktop for unknown values
    pub fn from_wire(value: &str) -> Self {
        match value {
            "laptop" => DeviceType::Laptop,
            "phone" | "smartphone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            _ => DeviceType::Desktop,
        }
    }

    /// Symbolic icon name for this form factor
    pub fn icon_name(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "computer-symbolic",
            DeviceType::Laptop => "laptop-symbolic",
            DeviceType::Phone => "phone-symbolic",
            DeviceType::Tablet => "tablet-symbolic",
            DeviceType::Tv => "tv-symbolic",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity a device declares during the identity exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Stable device identifier
    pub device_id: String,

    /// Human-readable device name
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Type of device
    #[serde(default)]
    pub device_type: DeviceType,

    /// Protocol version
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,

    /// Packet types this device can receive
    #[serde(default)]
    pub incoming_capabilities: BTreeSet<String>,

    /// Packet types this device can send
    #[serde(default)]
    pub outgoing_capabilities: BTreeSet<String>,
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

impl DeviceIdentity {
    /// Create an identity with a freshly generated id
    ///
    /// # Examples
    ///
    /// ```
    /// use kdeconnect_session::{validate_device_id, DeviceIdentity, DeviceType};
    ///
    /// let identity = DeviceIdentity::new("Workstation", DeviceType::Desktop);
    /// assert!(validate_device_id(&identity.device_id));
    /// ```
    pub fn new(device_name: impl Into<String>, device_type: DeviceType) -> Self {
        Self::with_id(generate_device_id(), device_name, device_type)
    }

    /// Create an identity with an explicit id
    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: BTreeSet::new(),
            outgoing_capabilities: BTreeSet::new(),
        }
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.insert(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.insert(capability.into());
        self
    }

    /// Set all capabilities at once
    pub fn with_capabilities<I, O>(mut self, incoming: I, outgoing: O) -> Self
    where
        I: IntoIterator<Item = String>,
        O: IntoIterator<Item = String>,
    {
        self.incoming_capabilities = incoming.into_iter().collect();
        self.outgoing_capabilities = outgoing.into_iter().collect();
        self
    }

    /// Parse an identity packet
    ///
    /// `deviceId` is required. Missing names and types fall back to
    /// `"Unnamed"` and desktop. The id is not format-checked here; the
    /// manager does that before accepting a channel.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::InvalidPacket(format!(
                "expected {} packet, got {}",
                PACKET_TYPE_IDENTITY, packet.packet_type
            )));
        }

        let device_id = packet.get_str("deviceId").ok_or_else(|| {
            ProtocolError::InvalidPacket("expected \"deviceId\" field holding a string".to_string())
        })?;

        let device_name = packet
            .get_str("deviceName")
            .unwrap_or(DEFAULT_DEVICE_NAME)
            .to_string();

        let device_type = packet
            .get_str("deviceType")
            .map(DeviceType::from_wire)
            .unwrap_or_default();

        let protocol_version = packet
            .body
            .get("protocolVersion")
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(PROTOCOL_VERSION);

        Ok(Self {
            device_id: device_id.to_string(),
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities: packet
                .get_strv("incomingCapabilities")
                .unwrap_or_default()
                .into_iter()
                .collect(),
            outgoing_capabilities: packet
                .get_strv("outgoingCapabilities")
                .unwrap_or_default()
                .into_iter()
                .collect(),
        })
    }

    /// Build the identity packet announcing this identity
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_str(),
                "protocolVersion": self.protocol_version,
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
            }),
        )
    }

    /// Symbolic icon name for the device type
    pub fn icon_name(&self) -> &'static str {
        self.device_type.icon_name()
    }

    /// Check if the device can receive a packet type
    pub fn has_incoming_capability(&self, capability: &str) -> bool {
        self.incoming_capabilities.contains(capability)
    }

    /// Check if the device can send a packet type
    pub fn has_outgoing_capability(&self, capability: &str) -> bool {
        self.outgoing_capabilities.contains(capability)
    }
}

/// Generate a UUIDv4 device id with underscores instead of hyphens
pub fn generate_device_id() -> String {
    Uuid::new_v4().to_string().replace('-', "_")
}

/// Check a device id against the accepted formats
///
/// Accepted:
/// - 32 hexadecimal characters
/// - 32 to 38 ASCII alphanumeric characters
/// - a UUID of 36 characters in 8-4-4-4-12 groups separated by `-` or `_`
/// - the same UUID wrapped in a leading and trailing `_` (38 characters)
///
/// # Examples
///
/// ```
/// use kdeconnect_session::validate_device_id;
///
/// assert!(validate_device_id("27456e3cfe5c420896a7c0caeec5e5a0"));
/// assert!(validate_device_id("27456e3c-fe5c-4208-96a7-c0caeec5e5a0"));
/// assert!(validate_device_id("_27456e3c_fe5c_4208_96a7_c0caeec5e5a0_"));
/// assert!(!validate_device_id(""));
/// assert!(!validate_device_id("../etc/passwd"));
/// ```
pub fn validate_device_id(device_id: &str) -> bool {
    let len = device_id.len();

    if len == 32 && device_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return true;
    }

    if (32..=38).contains(&len) && device_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return true;
    }

    match len {
        36 => is_uuid_like(device_id),
        38 => device_id
            .strip_prefix('_')
            .and_then(|rest| rest.strip_suffix('_'))
            .is_some_and(is_uuid_like),
        _ => false,
    }
}

fn is_uuid_like(value: &str) -> bool {
    const SEPARATORS: [usize; 4] = [8, 13, 18, 23];

    let bytes = value.as_bytes();
    if bytes.len() != 36 {
        return false;
    }

    let separator = bytes[SEPARATORS[0]];
    if separator != b'-' && separator != b'_' {
        return false;
    }

    bytes.iter().enumerate().all(|(i, b)| {
        if SEPARATORS.contains(&i) {
            *b == separator
        } else {
            b.is_ascii_hexdigit()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_hex_id() {
        assert!(validate_device_id("27456e3cfe5c420896a7c0caeec5e5a0"));
        assert!(validate_device_id("27456E3CFE5C420896A7C0CAEEC5E5A0"));
    }

    #[test]
    fn test_validate_uuid_ids() {
        assert!(validate_device_id("27456e3c-fe5c-4208-96a7-c0caeec5e5a0"));
        assert!(validate_device_id("27456e3c_fe5c_4208_96a7_c0caeec5e5a0"));
        assert!(validate_device_id("_27456e3c_fe5c_4208_96a7_c0caeec5e5a0_"));
    }

    #[test]
    fn test_validate_alphanumeric_ids() {
        assert!(validate_device_id("a1b2c3d4e5f6g7h8i9j0k1l2m3n4o5p6"));
        assert!(validate_device_id("ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789ab"));
    }

    #[test]
    fn test_reject_invalid_ids() {
        assert!(!validate_device_id(""));
        assert!(!validate_device_id("123456789012345678901234567890123456789"));
        assert!(!validate_device_id("27456e3c-fe5c-4208-96a7_c0caeec5e5a0"));
        assert!(!validate_device_id("27456e3c-fe5c-4208-96a7-c0caeec5e5ag"));
        assert!(!validate_device_id("-27456e3c-fe5c-4208-96a7-c0caeec5e5a0-"));
        assert!(!validate_device_id("short"));
        assert!(!validate_device_id("27456e3c fe5c 4208 96a7 c0caeec5e5a0"));
    }

    #[test]
    fn test_generated_id_is_valid() {
        for _ in 0..16 {
            assert!(validate_device_id(&generate_device_id()));
        }
    }

    #[test]
    fn test_identity_packet_round_trip() {
        let identity = DeviceIdentity::new("Workstation", DeviceType::Laptop)
            .with_incoming_capability("kdeconnect.ping")
            .with_outgoing_capability("kdeconnect.battery");

        let parsed = DeviceIdentity::from_packet(&identity.to_packet()).unwrap();
        assert_eq!(parsed, identity);
    }

    #[test]
    fn test_identity_defaults() {
        let packet = Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({ "deviceId": "27456e3cfe5c420896a7c0caeec5e5a0" }),
        );
        let identity = DeviceIdentity::from_packet(&packet).unwrap();

        assert_eq!(identity.device_name, DEFAULT_DEVICE_NAME);
        assert_eq!(identity.device_type, DeviceType::Desktop);
        assert_eq!(identity.protocol_version, PROTOCOL_VERSION);
        assert!(identity.incoming_capabilities.is_empty());
        assert_eq!(identity.icon_name(), "computer-symbolic");
    }

    #[test]
    fn test_identity_requires_device_id() {
        let packet = Packet::new(PACKET_TYPE_IDENTITY, json!({ "deviceName": "Pixel" }));
        assert!(DeviceIdentity::from_packet(&packet).is_err());

        let packet = Packet::new("kdeconnect.ping", json!({ "deviceId": "abc" }));
        assert!(DeviceIdentity::from_packet(&packet).is_err());
    }

    #[test]
    fn test_device_type_icons() {
        assert_eq!(DeviceType::from_wire("phone").icon_name(), "phone-symbolic");
        assert_eq!(DeviceType::from_wire("tablet").icon_name(), "tablet-symbolic");
        assert_eq!(DeviceType::from_wire("tv").icon_name(), "tv-symbolic");
        assert_eq!(DeviceType::from_wire("toaster"), DeviceType::Desktop);
    }
}
