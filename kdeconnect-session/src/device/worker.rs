//! Per-device plugin task
//!
//! Owns every plugin instance of one device and runs their callbacks one at
//! a time, in the order the device queued them.

use super::{DeviceHandle, DeviceState};
use crate::plugins::{Plugin, PluginFactory};
use crate::{Packet, ProtocolError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Work queued by a device for its plugins
pub(crate) enum PluginCommand {
    /// Instantiate a plugin
    Load {
        name: String,
        factory: Arc<dyn PluginFactory>,
    },
    /// Drop a plugin, disabling it first if needed
    Unload { name: String },
    Enable { name: String },
    Disable { name: String },
    /// Device state changed
    State(DeviceState),
    /// Deliver a packet to the named handlers in order
    Dispatch {
        handlers: Vec<String>,
        packet: Packet,
    },
    /// Run a plugin action and report the result
    Action {
        plugin: String,
        action: String,
        parameter: Option<Value>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Disable everything and stop the task
    Shutdown,
}

struct LoadedPlugin {
    plugin: Box<dyn Plugin>,
    enabled: bool,
}

async fn disable(device: &DeviceHandle, name: &str, loaded: &mut LoadedPlugin) {
    loaded.enabled = false;
    if let Err(e) = loaded.plugin.disable(device).await {
        warn!("Failed to disable plugin {} for {}: {}", name, device.id(), e);
    }
}

pub(crate) async fn run(device: DeviceHandle, mut commands: mpsc::UnboundedReceiver<PluginCommand>) {
    let mut plugins: HashMap<String, LoadedPlugin> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            PluginCommand::Load { name, factory } => {
                debug!("Loading plugin {} for {}", name, device.id());
                plugins.insert(
                    name,
                    LoadedPlugin {
                        plugin: factory.create(),
                        enabled: false,
                    },
                );
            }
            PluginCommand::Unload { name } => {
                if let Some(mut loaded) = plugins.remove(&name) {
                    if loaded.enabled {
                        disable(&device, &name, &mut loaded).await;
                    }
                    debug!("Unloaded plugin {} for {}", name, device.id());
                }
            }
            PluginCommand::Enable { name } => {
                if let Some(loaded) = plugins.get_mut(&name) {
                    if !loaded.enabled {
                        loaded.enabled = true;
                        debug!("Enabled plugin {} for {}", name, device.id());
                        if let Err(e) = loaded.plugin.enable(&device).await {
                            warn!("Failed to enable plugin {} for {}: {}", name, device.id(), e);
                        }
                    }
                }
            }
            PluginCommand::Disable { name } => {
                if let Some(loaded) = plugins.get_mut(&name) {
                    if loaded.enabled {
                        disable(&device, &name, loaded).await;
                        debug!("Disabled plugin {} for {}", name, device.id());
                    }
                }
            }
            PluginCommand::State(state) => {
                for (name, loaded) in plugins.iter_mut() {
                    if let Err(e) = loaded.plugin.update_state(&device, state).await {
                        warn!("Plugin {} failed to update state: {}", name, e);
                    }
                }
            }
            PluginCommand::Dispatch { handlers, packet } => {
                for name in &handlers {
                    match plugins.get_mut(name) {
                        Some(loaded) if loaded.enabled => {
                            if let Err(e) = loaded.plugin.handle_packet(&device, &packet).await {
                                warn!(
                                    "Plugin {} failed to handle '{}' from {}: {}",
                                    name,
                                    packet.packet_type,
                                    device.id(),
                                    e
                                );
                            }
                        }
                        _ => debug!(
                            "Skipping '{}' for plugin {}: not enabled",
                            packet.packet_type, name
                        ),
                    }
                }
            }
            PluginCommand::Action {
                plugin,
                action,
                parameter,
                reply,
            } => {
                let result = match plugins.get_mut(&plugin) {
                    Some(loaded) if loaded.enabled => {
                        loaded
                            .plugin
                            .activate_action(&device, &action, parameter)
                            .await
                    }
                    _ => Err(ProtocolError::ActionNotFound(format!("{}.{}", plugin, action))),
                };
                let _ = reply.send(result);
            }
            PluginCommand::Shutdown => break,
        }
    }

    for (name, mut loaded) in plugins.drain() {
        if loaded.enabled {
            disable(&device, &name, &mut loaded).await;
        }
    }

    debug!("Plugin task for {} stopped", device.id());
}
