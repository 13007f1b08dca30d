//! Daemon Configuration
//!
//! Configuration management for the session daemon, stored as TOML.

use anyhow::{Context, Result};
use kdeconnect_session::store::STATE_FILE_NAME;
use kdeconnect_session::{
    generate_device_id, validate_device_id, CertificateInfo, DeviceIdentity, DeviceType,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Directory name below the platform config directory
pub const APP_DIR_NAME: &str = "kdeconnect-session";

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Plugin configuration
    #[serde(default)]
    pub plugins: PluginConfig,

    /// Storage paths
    pub paths: PathConfig,
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name
    pub name: String,

    /// Device type (desktop, laptop, phone, tablet, tv)
    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Device ID (generated and saved on first start if not set)
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP port to accept channels on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Identity exchange timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Plugin configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugins disabled on every device
    #[serde(default)]
    pub disabled: Vec<String>,
}

/// Storage paths configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory, also holds the device state file
    pub config_dir: PathBuf,

    /// Certificate directory
    pub cert_dir: PathBuf,
}

fn default_device_type() -> String {
    DeviceType::Desktop.as_str().to_string()
}

fn default_listen_port() -> u16 {
    1716
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        let config_dir = default_config_dir();
        let cert_dir = config_dir.join("certs");
        Self {
            config_dir,
            cert_dir,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_type: default_device_type(),
                device_id: None,
            },
            network: NetworkConfig::default(),
            plugins: PluginConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join(APP_DIR_NAME)
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        default_config_dir().join(CONFIG_FILE_NAME)
    }

    /// Load configuration from `path`, creating a default one if missing
    ///
    /// A device id is generated and written back when the file has none.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {:?}", path))?
        } else {
            info!("Creating default configuration at {:?}", path);
            Config::default()
        };

        let missing_id = match &config.device.device_id {
            Some(id) if validate_device_id(id) => false,
            Some(id) => {
                warn!("Configured device id {:?} is invalid, generating a new one", id);
                true
            }
            None => true,
        };

        if missing_id || !path.exists() {
            if missing_id {
                config.device.device_id = Some(generate_device_id());
            }
            config.save(path)?;
        }

        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.cert_dir)
            .context("Failed to create certificate directory")?;
        Ok(())
    }

    /// Path of the paired device state file
    pub fn state_path(&self) -> PathBuf {
        self.paths.config_dir.join(STATE_FILE_NAME)
    }

    /// Load the device certificate from the certificate directory
    ///
    /// A certificate is generated on first start and whenever the stored one
    /// does not match the configured device id.
    pub fn certificate(&self) -> Result<CertificateInfo> {
        let device_id = self
            .device
            .device_id
            .as_deref()
            .context("Configuration has no device id")?;

        CertificateInfo::load_or_generate(device_id, &self.paths.cert_dir)
            .with_context(|| format!("Failed to load certificate from {:?}", self.paths.cert_dir))
    }

    /// Address the TCP channel service listens on
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.network.listen_port))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_secs)
    }

    /// Identity announced to peers, without capabilities
    pub fn identity(&self) -> Result<DeviceIdentity> {
        let device_id = self
            .device
            .device_id
            .clone()
            .context("Configuration has no device id")?;

        Ok(DeviceIdentity::with_id(
            device_id,
            &self.device.name,
            DeviceType::from_wire(&self.device.device_type),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.listen_port, 1716);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(config.plugins.disabled.is_empty());
        assert!(config.paths.config_dir.ends_with(APP_DIR_NAME));
        assert_eq!(config.paths.cert_dir, config.paths.config_dir.join("certs"));
        assert_eq!(config.state_path().file_name().unwrap(), STATE_FILE_NAME);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_creates_default_with_device_id() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE_NAME);

        let config = Config::load(&path).unwrap();
        assert!(path.exists());

        let device_id = config.device.device_id.clone().unwrap();
        assert!(validate_device_id(&device_id));

        // The generated id is stable across loads
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.device.device_id, Some(device_id));
    }

    #[test]
    fn test_load_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"
[device]
name = "Workstation"
device_type = "laptop"
device_id = "27456e3cfe5c420896a7c0caeec5e5a0"

[plugins]
disabled = ["ping"]

[paths]
config_dir = "/tmp/kdeconnect-session"
cert_dir = "/tmp/kdeconnect-session/certs"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.network, NetworkConfig::default());
        assert_eq!(config.plugins.disabled, vec!["ping".to_string()]);

        let identity = config.identity().unwrap();
        assert_eq!(identity.device_id, "27456e3cfe5c420896a7c0caeec5e5a0");
        assert_eq!(identity.device_name, "Workstation");
        assert_eq!(identity.device_type, DeviceType::Laptop);
    }

    #[test]
    fn test_invalid_device_id_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);

        let mut config = Config::default();
        config.device.device_id = Some("not/a/valid/id".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        let device_id = loaded.device.device_id.unwrap();
        assert_ne!(device_id, "not/a/valid/id");
        assert!(validate_device_id(&device_id));
    }

    #[test]
    fn test_certificate_lives_in_cert_dir() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.device.device_id = Some(generate_device_id());
        config.paths = PathConfig {
            config_dir: temp_dir.path().to_path_buf(),
            cert_dir: temp_dir.path().join("certs"),
        };
        config.ensure_directories().unwrap();

        let certificate = config.certificate().unwrap();
        assert_eq!(Some(certificate.device_id.clone()), config.device.device_id);
        assert!(config.paths.cert_dir.join("certificate.pem").is_file());

        // Later starts reuse the stored certificate
        let reloaded = config.certificate().unwrap();
        assert_eq!(reloaded.certificate, certificate.certificate);
    }

    #[test]
    fn test_parse_error_has_context() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[device\nname = ").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
