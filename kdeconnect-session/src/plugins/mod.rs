//! KDE Connect Plugin Architecture
//!
//! Plugins extend a [`Device`](crate::Device) with features such as ping,
//! battery or clipboard sync. KDE Connect uses a **capability-based plugin
//! system**: devices advertise the packet types they send and receive in
//! their identity packet, and a plugin is only instantiated for a device
//! whose capabilities overlap with its own.
//!
//! ## Descriptors and Factories
//!
//! A [`PluginFactory`] carries a static [`PluginDescriptor`] and creates one
//! [`Plugin`] instance per device. Factories are installed in a
//! [`PluginRegistry`] which is shared by every device of a manager.
//!
//! ### Packet Types
//!
//! Plugin packet types follow the pattern `kdeconnect.<plugin>[.<action>]`:
//! - `kdeconnect.ping` - Ping with an optional message
//! - `kdeconnect.battery` - Battery status broadcast
//! - `kdeconnect.battery.request` - Request battery status
//!
//! ## Eligibility
//!
//! For a descriptor with incoming types `Pin` and outgoing types `Pout`, and a
//! device identity that receives `Din` and sends `Dout`, the plugin is
//! eligible when it declares no capabilities at all, or when
//! `Pout ∩ Din` or `Pin ∩ Dout` is non-empty. Before a device has announced
//! an identity only capability-less plugins are eligible.
//!
//! ## Plugin Lifecycle
//!
//! ```text
//! Loaded → Enabled ⇄ Disabled → Unloaded
//! ```
//!
//! - **Loaded**: instance created when the device identity makes it eligible
//! - **Enabled**: the device is connected, paired and the plugin is not
//!   disabled in settings; the plugin receives packets and exposes actions
//! - **Disabled**: any of the above stopped being true
//! - **Unloaded**: the factory was removed or the plugin is no longer eligible
//!
//! All lifecycle calls and packets for one device run sequentially on that
//! device's plugin task, so a plugin is never called concurrently.
//!
//! ## Example Plugin
//!
//! ```rust
//! use kdeconnect_session::plugins::{Plugin, PluginDescriptor, PluginFactory};
//! use kdeconnect_session::{DeviceHandle, Packet, Result};
//! use async_trait::async_trait;
//! use tracing::info;
//!
//! struct EchoPlugin;
//!
//! #[async_trait]
//! impl Plugin for EchoPlugin {
//!     async fn handle_packet(&mut self, device: &DeviceHandle, packet: &Packet) -> Result<()> {
//!         info!("Echoing {} back to {}", packet.packet_type, device.id());
//!         device.send_packet(packet).await
//!     }
//! }
//!
//! struct EchoPluginFactory {
//!     descriptor: PluginDescriptor,
//! }
//!
//! impl PluginFactory for EchoPluginFactory {
//!     fn descriptor(&self) -> &PluginDescriptor {
//!         &self.descriptor
//!     }
//!
//!     fn create(&self) -> Box<dyn Plugin> {
//!         Box::new(EchoPlugin)
//!     }
//! }
//!
//! let factory = EchoPluginFactory {
//!     descriptor: PluginDescriptor::new("echo")
//!         .with_incoming("kdeconnect.mock.echo")
//!         .with_outgoing("kdeconnect.mock.echo"),
//! };
//! assert_eq!(factory.descriptor().name, "echo");
//! ```
//!
//! ## References
//!
//! - [Valent Protocol Reference](https://valent.andyholmes.ca/documentation/protocol.html)
//! - [KDE Connect Community Wiki](https://community.kde.org/KDEConnect)

pub mod ping;

use crate::{DeviceHandle, DeviceIdentity, DeviceState, Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the registry event channel
const REGISTRY_EVENT_CAPACITY: usize = 64;

/// Static declaration of a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    /// Unique plugin name, such as `"ping"`
    pub name: String,

    /// Packet types the plugin handles
    pub incoming: BTreeSet<String>,

    /// Packet types the plugin sends
    pub outgoing: BTreeSet<String>,

    /// Actions contributed to the device, exposed as `"<name>.<action>"`
    pub actions: Vec<String>,
}

impl PluginDescriptor {
    /// Create a descriptor without capabilities or actions
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            incoming: BTreeSet::new(),
            outgoing: BTreeSet::new(),
            actions: Vec::new(),
        }
    }

    /// Builder pattern: add a handled packet type
    pub fn with_incoming(mut self, packet_type: impl Into<String>) -> Self {
        self.incoming.insert(packet_type.into());
        self
    }

    /// Builder pattern: add a sent packet type
    pub fn with_outgoing(mut self, packet_type: impl Into<String>) -> Self {
        self.outgoing.insert(packet_type.into());
        self
    }

    /// Builder pattern: add an action
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }

    /// Fully qualified names of the actions this plugin contributes
    pub fn action_names(&self) -> impl Iterator<Item = String> + '_ {
        self.actions
            .iter()
            .map(move |action| format!("{}.{}", self.name, action))
    }

    /// Whether the plugin should be instantiated for a device
    ///
    /// # Examples
    ///
    /// ```
    /// use kdeconnect_session::plugins::PluginDescriptor;
    /// use kdeconnect_session::{DeviceIdentity, DeviceType};
    ///
    /// let ping = PluginDescriptor::new("ping")
    ///     .with_incoming("kdeconnect.ping")
    ///     .with_outgoing("kdeconnect.ping");
    ///
    /// let phone = DeviceIdentity::new("Pixel", DeviceType::Phone)
    ///     .with_incoming_capability("kdeconnect.ping");
    /// let tv = DeviceIdentity::new("TV", DeviceType::Tv)
    ///     .with_incoming_capability("kdeconnect.mpris");
    ///
    /// assert!(ping.supports(Some(&phone)));
    /// assert!(!ping.supports(Some(&tv)));
    /// assert!(!ping.supports(None));
    /// ```
    pub fn supports(&self, identity: Option<&DeviceIdentity>) -> bool {
        if self.incoming.is_empty() && self.outgoing.is_empty() {
            return true;
        }

        let Some(identity) = identity else {
            return false;
        };

        self.outgoing
            .iter()
            .any(|t| identity.incoming_capabilities.contains(t))
            || self
                .incoming
                .iter()
                .any(|t| identity.outgoing_capabilities.contains(t))
    }
}

/// Factory creating per-device plugin instances
pub trait PluginFactory: Send + Sync {
    /// Static declaration of the plugin
    fn descriptor(&self) -> &PluginDescriptor;

    /// Create a new plugin instance for one device
    fn create(&self) -> Box<dyn Plugin>;
}

/// Per-device plugin instance
///
/// Only [`handle_packet`](Plugin::handle_packet) is required. Errors returned
/// from any method are logged by the device and never propagated to the peer.
#[async_trait]
pub trait Plugin: Send {
    /// Called when the plugin becomes enabled
    async fn enable(&mut self, _device: &DeviceHandle) -> Result<()> {
        Ok(())
    }

    /// Called when the plugin stops being enabled
    async fn disable(&mut self, _device: &DeviceHandle) -> Result<()> {
        Ok(())
    }

    /// Called on every device state change while loaded
    async fn update_state(&mut self, _device: &DeviceHandle, _state: DeviceState) -> Result<()> {
        Ok(())
    }

    /// Handle an incoming packet of one of the declared incoming types
    ///
    /// Only called while enabled. Handlers should tolerate repeated and
    /// unexpected packets.
    async fn handle_packet(&mut self, device: &DeviceHandle, packet: &Packet) -> Result<()>;

    /// Run one of the declared actions
    ///
    /// `action` is the bare action name, without the plugin prefix.
    async fn activate_action(
        &mut self,
        _device: &DeviceHandle,
        action: &str,
        _parameter: Option<Value>,
    ) -> Result<()> {
        Err(ProtocolError::ActionNotFound(action.to_string()))
    }
}

/// Change in the set of installed plugins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A factory was registered under this name
    Added(String),
    /// The factory with this name was withdrawn
    Removed(String),
}

/// Installed plugin factories
///
/// One registry is shared by all devices of a
/// [`DeviceManager`](crate::DeviceManager). Devices subscribe to it and load
/// or unload instances as factories come and go.
pub struct PluginRegistry {
    factories: RwLock<BTreeMap<String, Arc<dyn PluginFactory>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(REGISTRY_EVENT_CAPACITY);
        Self {
            factories: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Create a registry with the built-in plugins installed
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry
            .factories_mut()
            .insert(ping::PLUGIN_NAME.to_string(), Arc::new(ping::PingPluginFactory::new()));
        registry
    }

    fn factories(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<dyn PluginFactory>>> {
        self.factories.read().unwrap_or_else(|e| e.into_inner())
    }

    fn factories_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<dyn PluginFactory>>> {
        self.factories.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a factory
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Plugin`] if a factory with the same name is
    /// already registered.
    pub fn register(&self, factory: Arc<dyn PluginFactory>) -> Result<()> {
        let name = factory.descriptor().name.clone();

        {
            let mut factories = self.factories_mut();
            if factories.contains_key(&name) {
                return Err(ProtocolError::Plugin(format!(
                    "Plugin factory '{}' is already registered",
                    name
                )));
            }
            factories.insert(name.clone(), factory);
        }

        info!("Registered plugin factory: {}", name);
        let _ = self.events.send(RegistryEvent::Added(name));
        Ok(())
    }

    /// Withdraw a factory
    ///
    /// Devices unload their instances of it.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn PluginFactory>> {
        let factory = self.factories_mut().remove(name);

        if factory.is_some() {
            info!("Unregistered plugin factory: {}", name);
            let _ = self.events.send(RegistryEvent::Removed(name.to_string()));
        }
        factory
    }

    /// Look up a factory by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories().get(name).cloned()
    }

    /// Descriptors of all installed factories, sorted by name
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.factories()
            .values()
            .map(|factory| factory.descriptor().clone())
            .collect()
    }

    /// Names of all installed factories, sorted
    pub fn names(&self) -> Vec<String> {
        self.factories().keys().cloned().collect()
    }

    /// Number of installed factories
    pub fn len(&self) -> usize {
        self.factories().len()
    }

    /// Whether no factories are installed
    pub fn is_empty(&self) -> bool {
        self.factories().is_empty()
    }

    /// Factories eligible for a device identity
    pub fn eligible(
        &self,
        identity: Option<&DeviceIdentity>,
    ) -> BTreeMap<String, Arc<dyn PluginFactory>> {
        self.factories()
            .iter()
            .filter(|(_, factory)| factory.descriptor().supports(identity))
            .map(|(name, factory)| (name.clone(), factory.clone()))
            .collect()
    }

    /// Union of all incoming packet types, sorted
    pub fn incoming_capabilities(&self) -> Vec<String> {
        let capabilities: BTreeSet<String> = self
            .factories()
            .values()
            .flat_map(|factory| factory.descriptor().incoming.iter().cloned())
            .collect();
        capabilities.into_iter().collect()
    }

    /// Union of all outgoing packet types, sorted
    pub fn outgoing_capabilities(&self) -> Vec<String> {
        let capabilities: BTreeSet<String> = self
            .factories()
            .values()
            .flat_map(|factory| factory.descriptor().outgoing.iter().cloned())
            .collect();
        capabilities.into_iter().collect()
    }

    /// Announce the registry's capabilities on a local identity
    pub fn apply_capabilities(&self, identity: DeviceIdentity) -> DeviceIdentity {
        identity.with_capabilities(self.incoming_capabilities(), self.outgoing_capabilities())
    }

    /// Subscribe to factory additions and removals
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        debug!("New plugin registry subscriber");
        self.events.subscribe()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("factories", &self.names())
            .finish()
    }
}
