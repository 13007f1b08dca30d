//! Device
//!
//! A [`Device`] is the pairing and connection state machine for one peer.
//!
//! ## State
//!
//! Two independent flags, reported together as [`DeviceState`]:
//! - `connected`: a [`Channel`] is attached
//! - `paired`: the peer is trusted
//!
//! `paired` survives disconnects. A device with both flags false is
//! removable, and the [`DeviceManager`](crate::DeviceManager) drops it.
//!
//! ## Pairing Flow
//!
//! ```text
//! local request_pairing()  ──── {pair: true, timestamp} ───►  peer
//!        pending (30 s)
//! peer accepts             ◄──── {pair: true} ────────────  paired
//! ```
//!
//! An unsolicited `{pair: true}` from the peer is accepted immediately and
//! answered with `{pair: true}`. `{pair: false}` always unpairs. Any other
//! packet from an unpaired peer is answered with `{pair: false}` and never
//! reaches a plugin.
//!
//! ## Plugins
//!
//! Plugins eligible for the device identity are loaded from the shared
//! [`PluginRegistry`]. A plugin is enabled while the device is connected,
//! paired, and the plugin is not disabled in settings. Enabled plugins
//! receive the packet types they declare and contribute their actions.
//!
//! ## Observers
//!
//! [`Device::subscribe`] registers a callback invoked synchronously after
//! each change, outside the device lock. Callbacks may call back into the
//! device.

mod worker;

use crate::channel::{Channel, PayloadReader, PayloadWriter};
use crate::identity::DEFAULT_DEVICE_NAME;
use crate::packet::PACKET_TYPE_PAIR;
use crate::plugins::{PluginDescriptor, PluginFactory, PluginRegistry, RegistryEvent};
use crate::{DeviceIdentity, Packet, ProtocolError, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use worker::PluginCommand;

/// How long an outgoing pair request stays pending
pub const PAIR_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Action requesting pairing
pub const ACTION_PAIR: &str = "pair";

/// Action unpairing the device
pub const ACTION_UNPAIR: &str = "unpair";

/// Connection and pairing state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeviceState {
    /// A channel is attached
    pub connected: bool,
    /// The peer is trusted
    pub paired: bool,
    /// A local pair request is waiting for an answer
    pub pair_outgoing: bool,
}

impl DeviceState {
    /// Whether the device can be forgotten
    pub fn is_removable(&self) -> bool {
        !self.connected && !self.paired
    }
}

/// Change notification delivered to device observers
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    StateChanged(DeviceState),
    IdentityChanged(DeviceIdentity),
    /// The sorted action names now exposed
    ActionsChanged(Vec<String>),
}

/// Token returned by [`Device::subscribe`]
pub type ObserverId = u64;

type Observer = Arc<dyn Fn(&Device, &DeviceEvent) + Send + Sync>;

/// A packet waiting in an attachment's outbox
struct Outgoing {
    packet: Packet,
    /// Write result for callers that wait; `None` for queued packets
    reply: Option<oneshot::Sender<Result<()>>>,
}

/// The attached channel with its reader and writer tasks
///
/// Every outgoing packet goes through `outbox` and is written by the single
/// writer task, so packets reach the peer in the order they were submitted.
struct Attachment {
    channel: Arc<dyn Channel>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    generation: u64,
}

struct PairRequest {
    serial: u64,
    timer: JoinHandle<()>,
}

struct PluginSlot {
    descriptor: PluginDescriptor,
    factory: Arc<dyn PluginFactory>,
    enabled: bool,
}

struct Inner {
    identity: Option<DeviceIdentity>,
    attachment: Option<Attachment>,
    generation: u64,
    paired: bool,
    pair_request: Option<PairRequest>,
    pair_serial: u64,
    disabled_plugins: BTreeSet<String>,
    plugins: BTreeMap<String, PluginSlot>,
    /// Packet type to enabled plugin names; never holds an empty list
    handlers: HashMap<String, Vec<String>>,
    /// Plugin actions of enabled plugins
    actions: BTreeSet<String>,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: ObserverId,
    watcher: Option<JoinHandle<()>>,
    shut_down: bool,
}

impl Inner {
    fn new(identity: Option<DeviceIdentity>, paired: bool) -> Self {
        Self {
            identity,
            attachment: None,
            generation: 0,
            paired,
            pair_request: None,
            pair_serial: 0,
            disabled_plugins: BTreeSet::new(),
            plugins: BTreeMap::new(),
            handlers: HashMap::new(),
            actions: BTreeSet::new(),
            observers: Vec::new(),
            next_observer: 1,
            watcher: None,
            shut_down: false,
        }
    }

    fn state(&self) -> DeviceState {
        DeviceState {
            connected: self.attachment.is_some(),
            paired: self.paired,
            pair_outgoing: self.pair_request.is_some(),
        }
    }

    fn cancel_pair_request(&mut self) {
        if let Some(request) = self.pair_request.take() {
            request.timer.abort();
        }
    }

    fn take_channel(&mut self) -> Option<Arc<dyn Channel>> {
        self.attachment.take().map(|attachment| {
            attachment.reader.abort();
            attachment.writer.abort();
            attachment.channel
        })
    }

    fn action_list(&self) -> Vec<String> {
        let mut actions: BTreeSet<String> = self.actions.clone();
        actions.insert(ACTION_PAIR.to_string());
        actions.insert(ACTION_UNPAIR.to_string());
        actions.into_iter().collect()
    }
}

struct Shared {
    id: String,
    registry: Arc<PluginRegistry>,
    commands: mpsc::UnboundedSender<PluginCommand>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn command(&self, command: PluginCommand) {
        if self.commands.send(command).is_err() {
            debug!("Plugin task for {} is gone", self.id);
        }
    }

    /// Bring plugin instances and enablement in line with the current state
    fn reconcile(&self, inner: &mut Inner) {
        let eligible = if inner.shut_down {
            BTreeMap::new()
        } else {
            self.registry.eligible(inner.identity.as_ref())
        };

        let stale: Vec<String> = inner
            .plugins
            .iter()
            .filter(|(name, slot)| match eligible.get(*name) {
                Some(factory) => !Arc::ptr_eq(factory, &slot.factory),
                None => true,
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in stale {
            self.set_plugin_active(inner, &name, false);
            inner.plugins.remove(&name);
            self.command(PluginCommand::Unload { name });
        }

        for (name, factory) in eligible {
            if inner.plugins.contains_key(&name) {
                continue;
            }
            self.command(PluginCommand::Load {
                name: name.clone(),
                factory: factory.clone(),
            });
            inner.plugins.insert(
                name,
                PluginSlot {
                    descriptor: factory.descriptor().clone(),
                    factory,
                    enabled: false,
                },
            );
        }

        let active = inner.attachment.is_some() && inner.paired;
        let names: Vec<String> = inner.plugins.keys().cloned().collect();
        for name in names {
            let enabled = active && !inner.disabled_plugins.contains(&name);
            self.set_plugin_active(inner, &name, enabled);
        }
    }

    fn set_plugin_active(&self, inner: &mut Inner, name: &str, enabled: bool) {
        let Some(slot) = inner.plugins.get_mut(name) else {
            return;
        };
        if slot.enabled == enabled {
            return;
        }
        slot.enabled = enabled;
        let descriptor = slot.descriptor.clone();

        if enabled {
            for packet_type in &descriptor.incoming {
                inner
                    .handlers
                    .entry(packet_type.clone())
                    .or_default()
                    .push(name.to_string());
            }
            inner.actions.extend(descriptor.action_names());
            self.command(PluginCommand::Enable {
                name: name.to_string(),
            });
        } else {
            for packet_type in &descriptor.incoming {
                if let Some(handlers) = inner.handlers.get_mut(packet_type) {
                    handlers.retain(|handler| handler != name);
                    if handlers.is_empty() {
                        inner.handlers.remove(packet_type);
                    }
                }
            }
            for action in descriptor.action_names() {
                inner.actions.remove(&action);
            }
            self.command(PluginCommand::Disable {
                name: name.to_string(),
            });
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        inner.cancel_pair_request();
        if let Some(watcher) = inner.watcher.take() {
            watcher.abort();
        }
        if let Some(channel) = inner.take_channel() {
            close_in_background(channel);
        }
    }
}

enum Route {
    Unpaired,
    Unsupported,
    Handlers(Vec<String>),
}

/// Close a channel without waiting for it
fn close_in_background(channel: Arc<dyn Channel>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = channel.close().await {
                debug!("Failed to close {}: {}", channel.description(), e);
            }
        });
    }
}

fn pair_packet(pair: bool) -> Packet {
    Packet::new(PACKET_TYPE_PAIR, json!({ "pair": pair }))
}

/// One remote peer
///
/// Cloning is cheap; clones share the same device. Creating a device spawns
/// its plugin task, so it must happen inside a Tokio runtime.
#[derive(Clone)]
pub struct Device {
    shared: Arc<Shared>,
}

impl Device {
    /// Create an unpaired, disconnected device
    pub fn new(id: impl Into<String>, registry: Arc<PluginRegistry>) -> Self {
        Self::build(id.into(), None, false, registry)
    }

    /// Recreate a paired device from a stored identity
    pub fn restore(identity: DeviceIdentity, registry: Arc<PluginRegistry>) -> Self {
        Self::build(identity.device_id.clone(), Some(identity), true, registry)
    }

    fn build(
        id: String,
        identity: Option<DeviceIdentity>,
        paired: bool,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let registry_events = registry.subscribe();

        let shared = Arc::new(Shared {
            id: id.clone(),
            registry,
            commands,
            inner: Mutex::new(Inner::new(identity, paired)),
        });

        let handle = DeviceHandle {
            id,
            shared: Arc::downgrade(&shared),
        };
        tokio::spawn(worker::run(handle, receiver));
        let watcher = tokio::spawn(watch_registry(Arc::downgrade(&shared), registry_events));

        let device = Self { shared };
        device.mutate(|inner, _| inner.watcher = Some(watcher));
        device
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a change, re-evaluate plugins and notify observers
    fn mutate<R>(&self, change: impl FnOnce(&mut Inner, &mut Vec<DeviceEvent>) -> R) -> R {
        let (result, events, observers) = {
            let mut inner = self.lock();
            let state = inner.state();
            let actions = inner.actions.clone();

            let mut events = Vec::new();
            let result = change(&mut *inner, &mut events);
            self.shared.reconcile(&mut *inner);

            let new_state = inner.state();
            if new_state != state {
                self.shared.command(PluginCommand::State(new_state));
                events.push(DeviceEvent::StateChanged(new_state));
            }
            if inner.actions != actions {
                events.push(DeviceEvent::ActionsChanged(inner.action_list()));
            }

            let observers: Vec<Observer> = if events.is_empty() {
                Vec::new()
            } else {
                inner.observers.iter().map(|(_, o)| o.clone()).collect()
            };
            (result, events, observers)
        };

        for event in &events {
            for observer in &observers {
                observer(self, event);
            }
        }
        result
    }

    /// Device id
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Last identity the peer announced, if any
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.lock().identity.clone()
    }

    /// Display name of the device
    pub fn name(&self) -> String {
        self.lock()
            .identity
            .as_ref()
            .map(|identity| identity.device_name.clone())
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string())
    }

    /// Symbolic icon name for the device type
    pub fn icon_name(&self) -> &'static str {
        self.lock()
            .identity
            .as_ref()
            .map(DeviceIdentity::icon_name)
            .unwrap_or_else(|| crate::DeviceType::default().icon_name())
    }

    /// Current state
    pub fn state(&self) -> DeviceState {
        self.lock().state()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().attachment.is_some()
    }

    pub fn is_paired(&self) -> bool {
        self.lock().paired
    }

    /// Description of the attached channel
    pub fn channel_description(&self) -> Option<String> {
        self.lock()
            .attachment
            .as_ref()
            .map(|attachment| attachment.channel.description().to_string())
    }

    /// Key both sides can compare to confirm the pairing
    ///
    /// `None` while disconnected or when the channel lacks certificates.
    pub fn verification_key(&self) -> Option<String> {
        self.lock()
            .attachment
            .as_ref()
            .and_then(|attachment| attachment.channel.verification_key())
    }

    /// Whether both values refer to the same device instance
    pub fn ptr_eq(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Weak handle for plugins and background tasks
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            id: self.shared.id.clone(),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Attach a channel, replacing and closing any current one
    ///
    /// The channel's peer identity becomes the device identity. A pending
    /// pair request is cancelled and `paired` is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidDeviceId`] and closes the channel if
    /// the peer announced a different device id, and
    /// [`ProtocolError::Cancelled`] once the device is shut down.
    pub fn attach_channel(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let peer = channel.peer_identity().clone();
        if peer.device_id != self.shared.id {
            warn!(
                "Rejecting channel {}: identity {} does not match device {}",
                channel.description(),
                peer.device_id,
                self.shared.id
            );
            close_in_background(channel);
            return Err(ProtocolError::InvalidDeviceId(peer.device_id));
        }

        let weak = Arc::downgrade(&self.shared);
        let attached = self.mutate(|inner, events| {
            if inner.shut_down {
                return false;
            }

            if let Some(previous) = inner.take_channel() {
                debug!("Replacing channel {}", previous.description());
                close_in_background(previous);
            }

            inner.generation += 1;
            let generation = inner.generation;
            let (outbox, queued) = mpsc::unbounded_channel();
            let writer = tokio::spawn(write_loop(
                weak.clone(),
                channel.clone(),
                generation,
                queued,
            ));
            let reader = tokio::spawn(read_loop(weak, channel.clone(), generation));
            inner.attachment = Some(Attachment {
                channel: channel.clone(),
                outbox,
                reader,
                writer,
                generation,
            });
            inner.cancel_pair_request();

            if inner.identity.as_ref() != Some(&peer) {
                inner.identity = Some(peer.clone());
                events.push(DeviceEvent::IdentityChanged(peer));
            }
            true
        });

        if !attached {
            close_in_background(channel);
            return Err(ProtocolError::Cancelled(format!(
                "device {} is shut down",
                self.shared.id
            )));
        }

        info!(
            "Device {} ({}) connected via {}",
            self.name(),
            self.shared.id,
            channel.description()
        );
        Ok(())
    }

    /// Close and drop the current channel
    pub fn detach_channel(&self) {
        let channel = self.mutate(|inner, _| {
            inner.cancel_pair_request();
            inner.take_channel()
        });

        if let Some(channel) = channel {
            info!("Device {} ({}) disconnected", self.name(), self.shared.id);
            close_in_background(channel);
        }
    }

    fn detach_if_current(&self, generation: u64) {
        let channel = self.mutate(|inner, _| {
            match &inner.attachment {
                Some(attachment) if attachment.generation == generation => {}
                _ => return None,
            }
            inner.cancel_pair_request();
            inner.take_channel()
        });

        if let Some(channel) = channel {
            info!(
                "Device {} ({}) lost channel {}",
                self.name(),
                self.shared.id,
                channel.description()
            );
            close_in_background(channel);
        }
    }

    /// Append a packet to the outbox of the attached channel
    fn enqueue(&self, outgoing: Outgoing) -> Result<()> {
        let inner = self.lock();
        let Some(attachment) = &inner.attachment else {
            return Err(ProtocolError::NotConnected(self.shared.id.clone()));
        };

        attachment.outbox.send(outgoing).map_err(|_| {
            ProtocolError::Cancelled(format!("writer for {} stopped", self.shared.id))
        })
    }

    /// Write to the attached channel without the pairing check
    ///
    /// Waits until the writer task has written the packet.
    async fn write_channel(&self, packet: &Packet) -> Result<()> {
        let (reply, written) = oneshot::channel();
        self.enqueue(Outgoing {
            packet: packet.clone(),
            reply: Some(reply),
        })?;

        written.await.unwrap_or_else(|_| {
            Err(ProtocolError::Cancelled(format!(
                "channel to {} was detached",
                self.shared.id
            )))
        })
    }

    /// Send a packet to the paired peer
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::NotConnected`] without a channel
    /// - [`ProtocolError::PermissionDenied`] while unpaired
    /// - the channel's write error otherwise; a transport failure also
    ///   detaches the channel
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.paired_channel()?;
        self.write_channel(packet).await
    }

    /// The attached channel, if the device is also paired
    fn paired_channel(&self) -> Result<Arc<dyn Channel>> {
        let inner = self.lock();
        let Some(attachment) = &inner.attachment else {
            return Err(ProtocolError::NotConnected(self.shared.id.clone()));
        };
        if !inner.paired {
            return Err(ProtocolError::PermissionDenied(self.shared.id.clone()));
        }
        Ok(attachment.channel.clone())
    }

    /// Open the payload of a packet received from this device
    ///
    /// # Errors
    ///
    /// The preconditions of [`Device::send_packet`] apply, plus
    /// [`ProtocolError::InvalidPacket`] if the packet announces no usable
    /// payload.
    pub async fn download(&self, packet: &Packet) -> Result<PayloadReader> {
        let channel = self.paired_channel()?;
        channel.download(packet).await
    }

    /// Send `packet` announcing a payload of `size` bytes
    ///
    /// The packet is written in order with other outgoing packets. Returns
    /// once the peer has connected; write the payload into the returned
    /// stream and shut it down.
    pub async fn upload(&self, mut packet: Packet, size: u64) -> Result<PayloadWriter> {
        let channel = self.paired_channel()?;
        let size = i64::try_from(size)
            .map_err(|_| ProtocolError::InvalidPacket(format!("payload size {} too large", size)))?;
        packet.payload_size = Some(size);

        let upload = channel.upload(&mut packet).await?;
        self.write_channel(&packet).await?;
        upload.accept().await
    }

    /// Send a packet in the background, logging failures
    ///
    /// Queued packets are written in call order, after anything already
    /// waiting in the outbox.
    ///
    /// # Panics
    ///
    /// Panics unless the device is connected and paired.
    pub fn queue_packet(&self, packet: Packet) {
        let state = self.state();
        assert!(
            state.connected && state.paired,
            "queue_packet() requires a connected and paired device"
        );

        let packet_type = packet.packet_type.clone();
        if let Err(e) = self.enqueue(Outgoing {
            packet,
            reply: None,
        }) {
            debug!("Dropping queued '{}': {}", packet_type, e);
        }
    }

    /// Ask the peer to pair
    ///
    /// Does nothing unless connected and unpaired. The request stays pending
    /// for [`PAIR_REQUEST_TIMEOUT`] and then lapses silently.
    pub async fn request_pairing(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.shared);
        let requested = self.mutate(|inner, _| {
            if inner.attachment.is_none() || inner.paired {
                return false;
            }

            inner.cancel_pair_request();
            inner.pair_serial += 1;
            let serial = inner.pair_serial;
            inner.pair_request = Some(PairRequest {
                serial,
                timer: tokio::spawn(expire_pair_request(weak, serial)),
            });
            true
        });

        if !requested {
            debug!(
                "Ignoring pair request for {}: not connected or already paired",
                self.shared.id
            );
            return Ok(());
        }

        info!("Requesting pairing with {}", self.shared.id);
        let packet = pair_packet(true).with_body_field("timestamp", Utc::now().timestamp());
        self.write_channel(&packet).await
    }

    /// Unpair, telling the peer if connected
    pub async fn request_unpairing(&self) -> Result<()> {
        let connected = self.mutate(|inner, _| {
            inner.cancel_pair_request();
            inner.paired = false;
            inner.attachment.is_some()
        });

        info!("Unpairing {}", self.shared.id);
        if connected {
            self.write_channel(&pair_packet(false)).await
        } else {
            Ok(())
        }
    }

    fn set_paired(&self, paired: bool) {
        self.mutate(|inner, _| {
            inner.cancel_pair_request();
            inner.paired = paired;
        });
    }

    async fn handle_pair(&self, packet: &Packet) {
        let Some(pair) = packet.get_bool("pair") else {
            warn!(
                "Malformed pair packet from {}: expected \"pair\" field holding a boolean",
                self.shared.id
            );
            return;
        };

        if !pair {
            info!("Device {} unpaired", self.shared.id);
            self.set_paired(false);
            return;
        }

        let outgoing = self.lock().pair_request.is_some();
        if outgoing {
            info!("Pairing with {} accepted", self.shared.id);
        } else {
            info!("Accepting pair request from {}", self.shared.id);
            if let Err(e) = self.write_channel(&pair_packet(true)).await {
                debug!("Failed to answer pair request: {}", e);
            }
        }
        self.set_paired(true);
    }

    fn route(&self, packet_type: &str) -> Route {
        let inner = self.lock();
        if !inner.paired {
            return Route::Unpaired;
        }
        match inner.handlers.get(packet_type) {
            Some(handlers) => Route::Handlers(handlers.clone()),
            None => Route::Unsupported,
        }
    }

    async fn handle_packet(&self, packet: Packet) {
        if packet.is_type(PACKET_TYPE_PAIR) {
            self.handle_pair(&packet).await;
            return;
        }

        match self.route(&packet.packet_type) {
            Route::Unpaired => {
                debug!(
                    "Rejecting '{}' from unpaired device {}",
                    packet.packet_type, self.shared.id
                );
                if let Err(e) = self.write_channel(&pair_packet(false)).await {
                    debug!("Failed to send unpair notice: {}", e);
                }
            }
            Route::Unsupported => debug!(
                "Unsupported packet \"{}\" from {}",
                packet.packet_type, self.shared.id
            ),
            Route::Handlers(handlers) => {
                assert!(
                    !handlers.is_empty(),
                    "handler table entry for {} is empty",
                    packet.packet_type
                );
                self.shared
                    .command(PluginCommand::Dispatch { handlers, packet });
            }
        }
    }

    /// Run a device action
    ///
    /// `"pair"` and `"unpair"` are always available; plugin actions use the
    /// `"<plugin>.<action>"` form and exist only while the plugin is enabled.
    pub async fn activate_action(&self, name: &str, parameter: Option<Value>) -> Result<()> {
        match name {
            ACTION_PAIR => return self.request_pairing().await,
            ACTION_UNPAIR => return self.request_unpairing().await,
            _ => {}
        }

        let exposed = self.lock().actions.contains(name);
        let (plugin, action) = name
            .split_once('.')
            .filter(|_| exposed)
            .ok_or_else(|| ProtocolError::ActionNotFound(name.to_string()))?;

        let (reply, response) = oneshot::channel();
        self.shared.command(PluginCommand::Action {
            plugin: plugin.to_string(),
            action: action.to_string(),
            parameter,
            reply,
        });

        response.await.map_err(|_| {
            ProtocolError::Cancelled(format!("plugin task for {} stopped", self.shared.id))
        })?
    }

    /// Action names currently exposed, sorted
    pub fn list_actions(&self) -> Vec<String> {
        self.lock().action_list()
    }

    /// Names of the loaded plugins, sorted
    pub fn plugins(&self) -> Vec<String> {
        self.lock().plugins.keys().cloned().collect()
    }

    /// Whether a loaded plugin is currently enabled
    pub fn is_plugin_enabled(&self, name: &str) -> bool {
        self.lock()
            .plugins
            .get(name)
            .is_some_and(|slot| slot.enabled)
    }

    /// Allow or forbid a plugin for this device
    pub fn set_plugin_enabled(&self, name: &str, enabled: bool) {
        self.mutate(|inner, _| {
            if enabled {
                inner.disabled_plugins.remove(name);
            } else {
                inner.disabled_plugins.insert(name.to_string());
            }
        });
    }

    /// Re-evaluate plugins against the registry
    pub fn reload_plugins(&self) {
        self.mutate(|_, _| ());
    }

    /// Register an observer
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&Device, &DeviceEvent) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_observer;
        inner.next_observer += 1;
        inner.observers.push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer, returning whether it was registered
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(observer, _)| *observer != id);
        inner.observers.len() != before
    }

    /// Detach, unload all plugins and stop background tasks
    ///
    /// The device rejects channels afterwards.
    pub fn shutdown(&self) {
        let (channel, first) = self.mutate(|inner, _| {
            let first = !inner.shut_down;
            inner.shut_down = true;
            inner.cancel_pair_request();
            if let Some(watcher) = inner.watcher.take() {
                watcher.abort();
            }
            (inner.take_channel(), first)
        });

        if let Some(channel) = channel {
            close_in_background(channel);
        }
        if first {
            self.shared.command(PluginCommand::Shutdown);
            debug!("Device {} shut down", self.shared.id);
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Weak reference to a [`Device`]
///
/// Handed to plugins so they can send packets without keeping the device
/// alive.
#[derive(Clone)]
pub struct DeviceHandle {
    id: String,
    shared: Weak<Shared>,
}

impl DeviceHandle {
    /// Handle that never resolves to a device
    pub fn detached(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shared: Weak::new(),
        }
    }

    /// Device id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the device if it still exists
    pub fn upgrade(&self) -> Option<Device> {
        self.shared.upgrade().map(|shared| Device { shared })
    }

    fn device(&self) -> Result<Device> {
        self.upgrade()
            .ok_or_else(|| ProtocolError::Cancelled(format!("device {} is gone", self.id)))
    }

    /// See [`Device::send_packet`]
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.device()?.send_packet(packet).await
    }

    /// Current state, or the default state once the device is gone
    pub fn state(&self) -> DeviceState {
        self.upgrade()
            .map(|device| device.state())
            .unwrap_or_default()
    }

    /// See [`Device::identity`]
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.upgrade().and_then(|device| device.identity())
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle").field("id", &self.id).finish()
    }
}

async fn read_loop(device: Weak<Shared>, channel: Arc<dyn Channel>, generation: u64) {
    loop {
        let result = channel.read_packet().await;
        let Some(shared) = device.upgrade() else {
            break;
        };
        let device = Device { shared };

        match result {
            Ok(packet) => device.handle_packet(packet).await,
            Err(ProtocolError::InvalidPacket(reason)) => {
                warn!("Dropping malformed packet from {}: {}", device.id(), reason);
            }
            Err(e) if e.is_cancelled() => {
                debug!("Stopped reading {}: {}", channel.description(), e);
                break;
            }
            Err(e) => {
                warn!("Channel {} failed: {}", channel.description(), e);
                device.detach_if_current(generation);
                break;
            }
        }
    }
}

async fn write_loop(
    device: Weak<Shared>,
    channel: Arc<dyn Channel>,
    generation: u64,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(Outgoing { packet, reply }) = outbox.recv().await {
        let result = channel.write_packet(&packet).await;

        let stop = match &result {
            Ok(()) => None,
            Err(e) if e.is_cancelled() => {
                debug!("Write of '{}' cancelled: {}", packet.packet_type, e);
                Some(false)
            }
            Err(e) => {
                warn!(
                    "Failed to send '{}' on {}: {}",
                    packet.packet_type,
                    channel.description(),
                    e
                );
                Some(true)
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }

        let Some(detach) = stop else {
            continue;
        };

        // Detaching aborts this task, so it comes last
        if detach {
            if let Some(shared) = device.upgrade() {
                Device { shared }.detach_if_current(generation);
            }
        }
        break;
    }
}

async fn expire_pair_request(device: Weak<Shared>, serial: u64) {
    tokio::time::sleep(PAIR_REQUEST_TIMEOUT).await;

    let Some(shared) = device.upgrade() else {
        return;
    };
    let device = Device { shared };

    let expired = device.mutate(|inner, _| {
        let current = inner
            .pair_request
            .as_ref()
            .is_some_and(|request| request.serial == serial);
        if current {
            inner.pair_request = None;
        }
        current
    });

    if expired {
        info!("Pair request to {} timed out", device.id());
    }
}

async fn watch_registry(device: Weak<Shared>, mut events: broadcast::Receiver<RegistryEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => debug!("Plugin registry changed: {:?}", event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!("Missed {} plugin registry events", missed)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }

        let Some(shared) = device.upgrade() else {
            break;
        };
        Device { shared }.reload_plugins();
    }
}
