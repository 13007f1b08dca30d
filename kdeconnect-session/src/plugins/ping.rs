//! Ping Plugin
//!
//! Simple connectivity testing plugin that sends and receives ping packets.
//!
//! ## Protocol
//!
//! **Packet Type**: `kdeconnect.ping`
//!
//! **Capabilities**:
//! - Incoming: `kdeconnect.ping` - Can receive pings
//! - Outgoing: `kdeconnect.ping` - Can send pings
//!
//! ## Packet Format
//!
//! ```json
//! {
//!     "id": 1234567890,
//!     "type": "kdeconnect.ping",
//!     "body": {
//!         "message": "Optional message"
//!     }
//! }
//! ```
//!
//! The `message` field is optional. If omitted, the packet body is empty.
//!
//! ## Actions
//!
//! - `ping.ping`: send a ping; a string parameter becomes the message
//!
//! ## References
//!
//! - [Valent Protocol - Ping](https://valent.andyholmes.ca/documentation/protocol.html)

use super::{Plugin, PluginDescriptor, PluginFactory};
use crate::{DeviceHandle, Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Plugin name
pub const PLUGIN_NAME: &str = "ping";

/// Ping packet type
pub const PACKET_TYPE_PING: &str = "kdeconnect.ping";

/// Action sending a ping
pub const ACTION_PING: &str = "ping";

/// Ping counters shared by every instance created by one factory
#[derive(Debug, Default)]
pub struct PingStats {
    received: AtomicU64,
    sent: AtomicU64,
}

impl PingStats {
    /// Get the number of pings received
    pub fn pings_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Get the number of pings sent
    pub fn pings_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// Create a ping packet with an optional message
///
/// # Example
///
/// ```rust
/// use kdeconnect_session::plugins::ping::create_ping;
///
/// let packet = create_ping(Some("Hello!"));
/// assert_eq!(packet.packet_type, "kdeconnect.ping");
/// assert_eq!(packet.get_str("message"), Some("Hello!"));
///
/// let packet = create_ping(None);
/// assert!(packet.get_str("message").is_none());
/// ```
pub fn create_ping(message: Option<&str>) -> Packet {
    let body = match message {
        Some(message) => json!({ "message": message }),
        None => json!({}),
    };

    Packet::new(PACKET_TYPE_PING, body)
}

/// Ping plugin for one device
#[derive(Debug)]
pub struct PingPlugin {
    stats: Arc<PingStats>,
}

impl PingPlugin {
    fn handle_ping(&self, device: &DeviceHandle, packet: &Packet) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        match packet.get_str("message") {
            Some(message) => info!("Received ping from {}: {}", device.id(), message),
            None => info!("Received ping from {}", device.id()),
        }
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    async fn handle_packet(&mut self, device: &DeviceHandle, packet: &Packet) -> Result<()> {
        if packet.is_type(PACKET_TYPE_PING) {
            self.handle_ping(device, packet);
        } else {
            debug!("Ping plugin ignoring {}", packet.packet_type);
        }
        Ok(())
    }

    async fn activate_action(
        &mut self,
        device: &DeviceHandle,
        action: &str,
        parameter: Option<Value>,
    ) -> Result<()> {
        if action != ACTION_PING {
            return Err(ProtocolError::ActionNotFound(format!(
                "{}.{}",
                PLUGIN_NAME, action
            )));
        }

        let message = parameter.as_ref().and_then(Value::as_str);
        device.send_packet(&create_ping(message)).await?;
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        debug!("Sent ping to {}", device.id());
        Ok(())
    }
}

/// Factory for [`PingPlugin`]
#[derive(Debug)]
pub struct PingPluginFactory {
    descriptor: PluginDescriptor,
    stats: Arc<PingStats>,
}

impl PingPluginFactory {
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new(PLUGIN_NAME)
                .with_incoming(PACKET_TYPE_PING)
                .with_outgoing(PACKET_TYPE_PING)
                .with_action(ACTION_PING),
            stats: Arc::new(PingStats::default()),
        }
    }

    /// Counters across all devices
    pub fn stats(&self) -> Arc<PingStats> {
        self.stats.clone()
    }
}

impl Default for PingPluginFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginFactory for PingPluginFactory {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PingPlugin {
            stats: self.stats.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor() {
        let factory = PingPluginFactory::new();
        let descriptor = factory.descriptor();

        assert_eq!(descriptor.name, PLUGIN_NAME);
        assert!(descriptor.incoming.contains(PACKET_TYPE_PING));
        assert!(descriptor.outgoing.contains(PACKET_TYPE_PING));
        assert_eq!(descriptor.action_names().collect::<Vec<_>>(), vec!["ping.ping"]);
    }

    #[tokio::test]
    async fn test_handle_ping_counts() {
        let factory = PingPluginFactory::new();
        let mut plugin = factory.create();
        let device = DeviceHandle::detached("27456e3cfe5c420896a7c0caeec5e5a0");

        plugin
            .handle_packet(&device, &create_ping(Some("hello")))
            .await
            .unwrap();
        plugin.handle_packet(&device, &create_ping(None)).await.unwrap();

        assert_eq!(factory.stats().pings_received(), 2);
        assert_eq!(factory.stats().pings_sent(), 0);
    }

    #[tokio::test]
    async fn test_ping_action_without_device_fails() {
        let factory = PingPluginFactory::new();
        let mut plugin = factory.create();
        let device = DeviceHandle::detached("27456e3cfe5c420896a7c0caeec5e5a0");

        let err = plugin
            .activate_action(&device, ACTION_PING, None)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(factory.stats().pings_sent(), 0);

        let err = plugin
            .activate_action(&device, "pong", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ActionNotFound(_)));
    }
}
