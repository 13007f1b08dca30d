//! Device Manager
//!
//! Owns every known [`Device`], receives channels from the registered
//! [`ChannelService`]s and keeps the [`IdentityStore`] in sync.
//!
//! ## Lifecycle of a Device
//!
//! 1. A service pushes a channel; the peer id is validated
//! 2. The matching device is looked up or created, then the channel is attached
//! 3. While connected and paired, the device identity is persisted
//! 4. Once unpaired, the stored identity is erased
//! 5. Once both disconnected and unpaired, the device is dropped
//!
//! On [`start`](DeviceManager::start) every stored identity becomes a paired,
//! disconnected device so it can reconnect later.
//!
//! ## Locking
//!
//! The device map is one critical section. Code holding it may take a device
//! lock, never the other way round: device observers run after the device
//! lock is released.

use crate::channel::{Channel, ChannelSender, ChannelService};
use crate::device::{Device, DeviceEvent, DeviceState};
use crate::plugins::PluginRegistry;
use crate::store::IdentityStore;
use crate::{validate_device_id, ProtocolError, Result};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Maximum number of unpaired devices tracked at once
pub const MAX_UNPAIRED_DEVICES: usize = 10;

/// Capacity of the manager event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Change in the set of known devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    DeviceAdded(String),
    DeviceRemoved(String),
}

struct ManagerShared {
    registry: Arc<PluginRegistry>,
    devices: Mutex<HashMap<String, Device>>,
    store: Mutex<IdentityStore>,
    services: Mutex<Vec<Arc<dyn ChannelService>>>,
    disabled_plugins: Mutex<BTreeSet<String>>,
    channels: Mutex<Option<ChannelSender>>,
    intake: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ManagerEvent>,
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        let intake = self.intake.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = intake.take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registry of known devices
///
/// Cloning is cheap; clones share the same manager.
#[derive(Clone)]
pub struct DeviceManager {
    shared: Arc<ManagerShared>,
}

impl DeviceManager {
    /// Create a manager over a plugin registry and identity store
    pub fn new(registry: Arc<PluginRegistry>, store: IdentityStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(ManagerShared {
                registry,
                devices: Mutex::new(HashMap::new()),
                store: Mutex::new(store),
                services: Mutex::new(Vec::new()),
                disabled_plugins: Mutex::new(BTreeSet::new()),
                channels: Mutex::new(None),
                intake: Mutex::new(None),
                events,
            }),
        }
    }

    /// Builder pattern: plugins disabled on every device
    pub fn with_disabled_plugins<I>(self, plugins: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        lock(&self.shared.disabled_plugins).extend(plugins);
        self
    }

    /// Shared plugin registry
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.shared.registry
    }

    /// Subscribe to device additions and removals
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.shared.events.send(event);
    }

    /// Register a channel service, starting it if the manager is running
    pub async fn add_service(&self, service: Arc<dyn ChannelService>) -> Result<()> {
        lock(&self.shared.services).push(service.clone());
        info!("Added channel service: {}", service.scheme());

        let channels = lock(&self.shared.channels).clone();
        if let Some(channels) = channels {
            service.start(channels).await?;
        }
        Ok(())
    }

    fn services(&self) -> Vec<Arc<dyn ChannelService>> {
        lock(&self.shared.services).clone()
    }

    /// Load stored devices, start every service and look for peers
    pub async fn start(&self) -> Result<()> {
        self.load_devices();

        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<dyn Channel>>();
        let weak = Arc::downgrade(&self.shared);
        let intake = tokio::spawn(async move {
            while let Some(channel) = receiver.recv().await {
                let Some(manager) = upgrade(&weak) else {
                    break;
                };
                if let Err(e) = manager.on_channel_discovered(channel) {
                    warn!("Rejected channel: {}", e);
                }
            }
        });

        if let Some(previous) = lock(&self.shared.intake).replace(intake) {
            previous.abort();
        }
        *lock(&self.shared.channels) = Some(sender.clone());

        for service in self.services() {
            if let Err(e) = service.start(sender.clone()).await {
                error!("Failed to start {} channel service: {}", service.scheme(), e);
            }
        }

        self.identify(None).await?;
        info!("Device manager started");
        Ok(())
    }

    /// Stop services and shut down every device
    pub async fn shutdown(&self) {
        for service in self.services() {
            if let Err(e) = service.stop().await {
                warn!("Failed to stop {} channel service: {}", service.scheme(), e);
            }
        }

        lock(&self.shared.channels).take();
        if let Some(intake) = lock(&self.shared.intake).take() {
            intake.abort();
        }

        let devices: Vec<Device> = lock(&self.shared.devices)
            .drain()
            .map(|(_, device)| device)
            .collect();

        for device in devices {
            device.shutdown();
            self.emit(ManagerEvent::DeviceRemoved(device.id().to_string()));
        }

        info!("Device manager stopped");
    }

    /// Ask channel services to look for peers
    ///
    /// With a URI such as `tcp://192.168.1.20:1716` only the service owning
    /// the scheme is asked. Without one, every service is asked and failures
    /// are logged.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Configuration`] if the URI has no scheme or
    /// no service handles it.
    pub async fn identify(&self, uri: Option<&str>) -> Result<()> {
        let services = self.services();

        let Some(uri) = uri else {
            let results = join_all(services.iter().map(|service| service.identify(None))).await;
            for (service, result) in services.iter().zip(results) {
                if let Err(e) = result {
                    warn!("Identify on {} failed: {}", service.scheme(), e);
                }
            }
            return Ok(());
        };

        let (scheme, _) = uri
            .split_once("://")
            .ok_or_else(|| ProtocolError::Configuration(format!("missing scheme in {}", uri)))?;

        let service = services
            .iter()
            .find(|service| service.scheme() == scheme)
            .ok_or_else(|| {
                ProtocolError::Configuration(format!("no channel service for {}://", scheme))
            })?;

        debug!("Identifying {} via {} service", uri, scheme);
        service.identify(Some(uri)).await
    }

    fn load_devices(&self) {
        let identities: Vec<_> = lock(&self.shared.store).identities().cloned().collect();

        for identity in identities {
            let id = identity.device_id.clone();
            let added = {
                let mut devices = lock(&self.shared.devices);
                if devices.contains_key(&id) {
                    false
                } else {
                    let device = self.prepare(Device::restore(identity, self.shared.registry.clone()));
                    devices.insert(id.clone(), device);
                    true
                }
            };

            if added {
                debug!("Restored paired device {}", id);
                self.emit(ManagerEvent::DeviceAdded(id));
            }
        }
    }

    /// Apply manager settings and start observing a new device
    fn prepare(&self, device: Device) -> Device {
        for name in lock(&self.shared.disabled_plugins).iter() {
            device.set_plugin_enabled(name, false);
        }

        let weak = Arc::downgrade(&self.shared);
        device.subscribe(move |device, event| {
            if let Some(manager) = upgrade(&weak) {
                manager.on_device_event(device, event);
            }
        });
        device
    }

    /// Accept a channel from a service
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InvalidDeviceId`] if the peer id fails validation
    /// - [`ProtocolError::ResourceExhausted`] if the peer is unpaired and
    ///   [`MAX_UNPAIRED_DEVICES`] other unpaired devices are already known
    ///
    /// The channel is closed in both cases.
    pub fn on_channel_discovered(&self, channel: Arc<dyn Channel>) -> Result<Device> {
        let id = channel.peer_identity().device_id.clone();

        if !validate_device_id(&id) {
            warn!("Rejecting channel {}: invalid device id {:?}", channel.description(), id);
            close_in_background(channel);
            return Err(ProtocolError::InvalidDeviceId(id));
        }

        let admitted = {
            let mut devices = lock(&self.shared.devices);
            let existing = devices.get(&id).cloned();
            let paired = existing.as_ref().is_some_and(Device::is_paired);
            let unpaired = devices
                .iter()
                .filter(|(other, device)| **other != id && !device.is_paired())
                .count();

            if !paired && unpaired >= MAX_UNPAIRED_DEVICES {
                None
            } else {
                Some(match existing {
                    Some(device) => (device, false),
                    None => {
                        let device =
                            self.prepare(Device::new(id.clone(), self.shared.registry.clone()));
                        devices.insert(id.clone(), device.clone());
                        (device, true)
                    }
                })
            }
        };

        let Some((device, created)) = admitted else {
            warn!("Rejecting channel from {}: too many unpaired devices", id);
            close_in_background(channel);
            return Err(ProtocolError::ResourceExhausted(format!(
                "more than {} unpaired devices",
                MAX_UNPAIRED_DEVICES
            )));
        };

        if created {
            info!("New device: {}", id);
            self.emit(ManagerEvent::DeviceAdded(id));
        }

        device.attach_channel(channel)?;
        Ok(device)
    }

    fn on_device_event(&self, device: &Device, event: &DeviceEvent) {
        match event {
            DeviceEvent::StateChanged(state) => self.on_device_state(device, *state),
            DeviceEvent::IdentityChanged(_) => {
                if device.is_connected() && device.is_paired() {
                    self.persist(device);
                }
            }
            DeviceEvent::ActionsChanged(_) => {}
        }
    }

    fn on_device_state(&self, device: &Device, state: DeviceState) {
        if state.connected && state.paired {
            self.persist(device);
        } else if !state.paired {
            match lock(&self.shared.store).remove(device.id()) {
                Ok(true) => debug!("Forgot identity of {}", device.id()),
                Ok(false) => {}
                Err(e) => error!("Failed to erase identity of {}: {}", device.id(), e),
            }
        }

        if state.is_removable() {
            self.remove_device(device);
        }
    }

    fn persist(&self, device: &Device) {
        let Some(identity) = device.identity() else {
            return;
        };

        match lock(&self.shared.store).insert(identity) {
            Ok(true) => debug!("Stored identity of {}", device.id()),
            Ok(false) => {}
            Err(e) => error!("Failed to store identity of {}: {}", device.id(), e),
        }
    }

    fn remove_device(&self, device: &Device) {
        let removed = {
            let mut devices = lock(&self.shared.devices);
            match devices.get(device.id()) {
                Some(current) if current.ptr_eq(device) => devices.remove(device.id()),
                _ => None,
            }
        };

        if let Some(device) = removed {
            info!("Removing device {}", device.id());
            device.shutdown();
            self.emit(ManagerEvent::DeviceRemoved(device.id().to_string()));
        }
    }

    /// Look up a device
    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        lock(&self.shared.devices).get(device_id).cloned()
    }

    /// All known devices, ordered by id
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = lock(&self.shared.devices).values().cloned().collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    /// Devices with an attached channel
    pub fn connected_devices(&self) -> Vec<Device> {
        self.devices()
            .into_iter()
            .filter(Device::is_connected)
            .collect()
    }

    /// Devices that are paired
    pub fn paired_devices(&self) -> Vec<Device> {
        self.devices().into_iter().filter(Device::is_paired).collect()
    }

    pub fn device_count(&self) -> usize {
        lock(&self.shared.devices).len()
    }

    /// Run an action on a device
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DeviceNotFound`] for unknown ids, otherwise
    /// whatever [`Device::activate_action`] returns.
    pub async fn activate_device_action(
        &self,
        device_id: &str,
        action: &str,
        parameter: Option<Value>,
    ) -> Result<()> {
        let device = self
            .get_device(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        device.activate_action(action, parameter).await
    }
}

fn upgrade(weak: &Weak<ManagerShared>) -> Option<DeviceManager> {
    weak.upgrade().map(|shared| DeviceManager { shared })
}

fn close_in_background(channel: Arc<dyn Channel>) {
    tokio::spawn(async move {
        if let Err(e) = channel.close().await {
            debug!("Failed to close {}: {}", channel.description(), e);
        }
    });
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.device_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory_pair, Endpoint, StreamChannel};
    use crate::{DeviceIdentity, DeviceType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> DeviceManager {
        DeviceManager::new(Arc::new(PluginRegistry::with_builtin()), IdentityStore::in_memory())
    }

    fn channel_from(peer: DeviceIdentity) -> (Arc<dyn Channel>, StreamChannel) {
        let local = Endpoint::new(DeviceIdentity::new("Local", DeviceType::Desktop));
        let (ours, theirs) = memory_pair(local, Endpoint::new(peer));
        (Arc::new(ours), theirs)
    }

    #[tokio::test]
    async fn test_channel_creates_device() {
        let manager = manager();
        let mut events = manager.subscribe();
        let peer = DeviceIdentity::new("Pixel", DeviceType::Phone);

        let (channel, _remote) = channel_from(peer.clone());
        let device = manager.on_channel_discovered(channel).unwrap();

        assert!(device.is_connected());
        assert_eq!(manager.device_count(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            ManagerEvent::DeviceAdded(peer.device_id.clone())
        );
        assert!(manager.get_device(&peer.device_id).is_some());
    }

    #[tokio::test]
    async fn test_invalid_device_id_rejected() {
        let manager = manager();
        let peer = DeviceIdentity::with_id("not a valid id", "Bad", DeviceType::Phone);

        let (channel, _remote) = channel_from(peer);
        let err = manager.on_channel_discovered(channel).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidDeviceId(_)));
        assert_eq!(manager.device_count(), 0);
    }

    #[tokio::test]
    async fn test_unpaired_device_limit() {
        let manager = manager();
        let mut remotes = Vec::new();

        for i in 0..MAX_UNPAIRED_DEVICES {
            let peer = DeviceIdentity::new(format!("Phone {}", i), DeviceType::Phone);
            let (channel, remote) = channel_from(peer);
            manager.on_channel_discovered(channel).unwrap();
            remotes.push(remote);
        }

        let (channel, _remote) = channel_from(DeviceIdentity::new("Extra", DeviceType::Phone));
        let err = manager.on_channel_discovered(channel).unwrap_err();
        assert!(matches!(err, ProtocolError::ResourceExhausted(_)));
        assert_eq!(manager.device_count(), MAX_UNPAIRED_DEVICES);
    }

    #[tokio::test]
    async fn test_unpaired_device_removed_on_detach() {
        let manager = manager();
        let peer = DeviceIdentity::new("Pixel", DeviceType::Phone);

        let (channel, _remote) = channel_from(peer.clone());
        let device = manager.on_channel_discovered(channel).unwrap();

        device.detach_channel();
        assert!(manager.get_device(&peer.device_id).is_none());
    }

    #[tokio::test]
    async fn test_identify_routes_by_scheme() {
        struct CountingService {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl ChannelService for CountingService {
            fn scheme(&self) -> &str {
                "mock"
            }

            async fn start(&self, _channels: ChannelSender) -> Result<()> {
                Ok(())
            }

            async fn identify(&self, _target: Option<&str>) -> Result<()> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            async fn stop(&self) -> Result<()> {
                Ok(())
            }
        }

        let manager = manager();
        let service = Arc::new(CountingService {
            calls: AtomicUsize::new(0),
        });
        manager.add_service(service.clone()).await.unwrap();

        manager.identify(Some("mock://peer")).await.unwrap();
        manager.identify(None).await.unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);

        let err = manager.identify(Some("bluetooth://aa:bb")).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Configuration(_)));
        let err = manager.identify(Some("no-scheme")).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unknown_device_action() {
        let manager = manager();
        let err = manager
            .activate_device_action("27456e3cfe5c420896a7c0caeec5e5a0", "pair", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceNotFound(_)));
    }
}
