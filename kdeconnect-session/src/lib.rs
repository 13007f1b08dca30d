//! KDE Connect Device Sessions
//!
//! Device-to-device session management for the KDE Connect protocol:
//! the pairing handshake, a packet channel abstraction, and capability-based
//! routing of packets to per-device plugins.
//!
//! ## Overview
//!
//! ```text
//! ChannelService ──channel──► DeviceManager ──attach──► Device ──packets──► plugins
//!                                   │                     │
//!                             IdentityStore         PluginRegistry
//! ```
//!
//! - [`channel`]: the [`Channel`](channel::Channel) contract, a stream
//!   implementation and the TLS-over-TCP service
//! - [`certificate`]: the self-signed device certificate
//! - [`Device`]: pairing and connection state for one peer
//! - [`DeviceManager`]: owns devices, persists paired identities
//! - [`plugins`]: plugin traits, registry and the built-in ping plugin
//!
//! ## Example
//!
//! ```rust,no_run
//! use kdeconnect_session::channel::TcpChannelService;
//! use kdeconnect_session::plugins::PluginRegistry;
//! use kdeconnect_session::{
//!     CertificateInfo, DeviceIdentity, DeviceManager, DeviceType, IdentityStore,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> kdeconnect_session::Result<()> {
//! let registry = Arc::new(PluginRegistry::with_builtin());
//! let identity = registry.apply_capabilities(DeviceIdentity::new("Workstation", DeviceType::Desktop));
//! let certificate = CertificateInfo::load_or_generate(&identity.device_id, "/tmp/certs")?;
//!
//! let manager = DeviceManager::new(registry, IdentityStore::open("/tmp/devices.json")?);
//! let service = TcpChannelService::new(identity, &certificate, "0.0.0.0:1716".parse().unwrap())?;
//! manager.add_service(Arc::new(service)).await?;
//! manager.start().await?;
//! manager.identify(Some("tcp://192.168.1.20:1716")).await?;
//! # Ok(())
//! # }
//! ```

pub mod certificate;
pub mod channel;
pub mod device;
pub mod identity;
pub mod manager;
pub mod packet;
pub mod plugins;
pub mod store;

mod error;

pub use certificate::CertificateInfo;
pub use device::{Device, DeviceEvent, DeviceHandle, DeviceState};
pub use error::{ProtocolError, Result};
pub use identity::{generate_device_id, validate_device_id, DeviceIdentity, DeviceType};
pub use manager::{DeviceManager, ManagerEvent};
pub use packet::{current_timestamp, Packet};
pub use store::IdentityStore;

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 7;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 7);
        assert_eq!(
            DeviceIdentity::new("Desk", DeviceType::Desktop).protocol_version,
            PROTOCOL_VERSION
        );
    }
}
