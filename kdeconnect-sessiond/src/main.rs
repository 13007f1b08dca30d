mod config;
mod diagnostics;

use anyhow::{Context, Result};
use clap::Parser;
use kdeconnect_session::channel::TcpChannelService;
use kdeconnect_session::plugins::PluginRegistry;
use kdeconnect_session::{DeviceManager, IdentityStore, ManagerEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use config::Config;
use diagnostics::{Cli, Command};

/// Main daemon state
struct Daemon {
    manager: DeviceManager,
}

impl Daemon {
    /// Create a daemon listening on the configured port
    async fn new(config: &Config) -> Result<Self> {
        config
            .ensure_directories()
            .context("Failed to create directories")?;

        let registry = Arc::new(PluginRegistry::with_builtin());
        let identity = registry.apply_capabilities(config.identity()?);

        info!("Device: {} ({})", identity.device_name, identity.device_id);
        info!("Type: {}", identity.device_type);
        info!("Protocol version: {}", identity.protocol_version);
        info!("Plugins: {}", registry.names().join(", "));

        let store = IdentityStore::open(config.state_path())
            .context("Failed to open device state")?;

        let manager = DeviceManager::new(registry, store)
            .with_disabled_plugins(config.plugins.disabled.iter().cloned());

        let certificate = config.certificate()?;
        info!("Certificate fingerprint: {}", certificate.fingerprint);

        let service = TcpChannelService::new(identity, &certificate, config.listen_addr())
            .context("Failed to create TCP channel service")?
            .with_handshake_timeout(config.connect_timeout());
        manager
            .add_service(Arc::new(service))
            .await
            .context("Failed to add TCP channel service")?;

        Ok(Self { manager })
    }

    /// Run until interrupted
    async fn run(&self, connect: &[String]) -> Result<()> {
        let mut events = self.manager.subscribe();

        self.manager
            .start()
            .await
            .context("Failed to start device manager")?;

        for uri in connect {
            if let Err(e) = self.manager.identify(Some(uri)).await {
                warn!("Failed to connect to {}: {}", uri, e);
            }
        }

        info!("Daemon initialized successfully");
        info!("Press Ctrl+C to stop");

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for shutdown signal")?;
                    info!("Received shutdown signal");
                    break;
                }
                event = events.recv() => match event {
                    Ok(ManagerEvent::DeviceAdded(id)) => {
                        let name = self
                            .manager
                            .get_device(&id)
                            .map(|device| device.name())
                            .unwrap_or_default();
                        info!("Device added: {} ({})", name, id);
                    }
                    Ok(ManagerEvent::DeviceRemoved(id)) => info!("Device removed: {}", id),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} device manager events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }

    async fn shutdown(&self) {
        info!("Shutting down daemon...");
        self.manager.shutdown().await;
        info!("Daemon shutdown complete");
    }
}

/// Print the paired devices stored for this host
fn list_devices(config: &Config, verbose: bool) -> Result<()> {
    let store = IdentityStore::open(config.state_path()).context("Failed to open device state")?;

    if store.is_empty() {
        println!("No paired devices");
        return Ok(());
    }

    for identity in store.identities() {
        println!(
            "{}  {} ({})",
            identity.device_id, identity.device_name, identity.device_type
        );

        if verbose {
            println!("    protocol version: {}", identity.protocol_version);
            for capability in &identity.incoming_capabilities {
                println!("    in:  {}", capability);
            }
            for capability in &identity.outgoing_capabilities {
                println!("    out: {}", capability);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    diagnostics::init_logging(&cli)?;

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path).context("Failed to load configuration")?;
    info!("Configuration loaded from {:?}", config_path);

    match cli.subcommand() {
        Command::Run => {
            info!("Starting KDE Connect session daemon...");

            let daemon = Daemon::new(&config)
                .await
                .context("Failed to create daemon")?;

            let result = daemon.run(&cli.connect).await;
            daemon.shutdown().await;
            result
        }
        Command::ListDevices { verbose } => list_devices(&config, verbose),
        Command::DumpConfig => {
            let contents =
                toml::to_string_pretty(&config).context("Failed to serialize config")?;
            println!("# {}", config_path.display());
            print!("{}", contents);
            Ok(())
        }
    }
}
