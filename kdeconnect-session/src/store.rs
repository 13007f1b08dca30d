//! Identity Store
//!
//! Identities of paired devices, kept in a JSON object keyed by device id:
//!
//! ```json
//! {
//!   "27456e3cfe5c420896a7c0caeec5e5a0": {
//!     "deviceId": "27456e3cfe5c420896a7c0caeec5e5a0",
//!     "deviceName": "Pixel",
//!     "deviceType": "phone",
//!     ...
//!   }
//! }
//! ```
//!
//! Every change is written to disk immediately. Writes go to a sibling
//! temporary file that is then renamed over the store, so a crash never
//! leaves a half-written store behind. A store that still fails to parse is
//! logged and treated as empty.

use crate::{validate_device_id, DeviceIdentity, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the store inside the state directory
pub const STATE_FILE_NAME: &str = "devices.json";

/// Persistent map of device id to identity
#[derive(Debug, Default)]
pub struct IdentityStore {
    path: Option<PathBuf>,
    identities: BTreeMap<String, DeviceIdentity>,
}

impl IdentityStore {
    /// Open the store at `path`, loading any existing content
    ///
    /// The parent directory is created if needed. A missing file is an empty
    /// store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut store = Self {
            path: Some(path),
            identities: BTreeMap::new(),
        };
        store.load()?;
        Ok(store)
    }

    /// Store that never touches the disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace the in-memory content with the file content
    ///
    /// Entries whose id fails validation are skipped. Unparseable content
    /// leaves the store empty; the file is replaced on the next save.
    pub fn load(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if !path.exists() {
            debug!("No identity store at {:?}", path);
            self.identities.clear();
            return Ok(());
        }

        let json = fs::read_to_string(path)?;
        let stored: BTreeMap<String, DeviceIdentity> = match serde_json::from_str(&json) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Ignoring corrupt identity store {:?}: {}", path, e);
                self.identities.clear();
                return Ok(());
            }
        };

        self.identities = stored
            .into_iter()
            .filter(|(id, identity)| {
                let valid = validate_device_id(id) && *id == identity.device_id;
                if !valid {
                    warn!("Skipping invalid stored identity {:?}", id);
                }
                valid
            })
            .collect();

        info!("Loaded {} device identities from {:?}", self.identities.len(), path);
        Ok(())
    }

    /// Write the store to disk
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&self.identities)?;
        let temp_path = temp_path(path);
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)?;
        debug!("Saved identity store to {:?}", path);
        Ok(())
    }

    /// Insert or replace an identity, saving if anything changed
    ///
    /// Returns whether the store changed.
    pub fn insert(&mut self, identity: DeviceIdentity) -> Result<bool> {
        if self.identities.get(&identity.device_id) == Some(&identity) {
            return Ok(false);
        }

        self.identities.insert(identity.device_id.clone(), identity);
        self.save()?;
        Ok(true)
    }

    /// Remove an identity, saving if it was present
    pub fn remove(&mut self, device_id: &str) -> Result<bool> {
        if self.identities.remove(device_id).is_none() {
            return Ok(false);
        }

        self.save()?;
        Ok(true)
    }

    /// Look up an identity
    pub fn get(&self, device_id: &str) -> Option<&DeviceIdentity> {
        self.identities.get(device_id)
    }

    /// All stored identities, ordered by id
    pub fn identities(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.identities.values()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// `devices.json` becomes `devices.json.tmp`
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from(STATE_FILE_NAME));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceType;
    use tempfile::TempDir;

    fn identity(name: &str) -> DeviceIdentity {
        DeviceIdentity::new(name, DeviceType::Phone).with_incoming_capability("kdeconnect.ping")
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = IdentityStore::open(temp_dir.path().join("state").join(STATE_FILE_NAME)).unwrap();

        assert!(store.is_empty());
        assert!(temp_dir.path().join("state").is_dir());
    }

    #[test]
    fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(STATE_FILE_NAME);
        let pixel = identity("Pixel");

        {
            let mut store = IdentityStore::open(&path).unwrap();
            assert!(store.insert(pixel.clone()).unwrap());
            assert!(!store.insert(pixel.clone()).unwrap());
        }

        let store = IdentityStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&pixel.device_id), Some(&pixel));
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(STATE_FILE_NAME);
        let pixel = identity("Pixel");

        let mut store = IdentityStore::open(&path).unwrap();
        store.insert(pixel.clone()).unwrap();
        assert!(store.remove(&pixel.device_id).unwrap());
        assert!(!store.remove(&pixel.device_id).unwrap());

        let store = IdentityStore::open(&path).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_is_object_keyed_by_id() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(STATE_FILE_NAME);
        let pixel = identity("Pixel");

        let mut store = IdentityStore::open(&path).unwrap();
        store.insert(pixel.clone()).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json[&pixel.device_id]["deviceName"], "Pixel");
        assert_eq!(json[&pixel.device_id]["deviceType"], "phone");
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(STATE_FILE_NAME);
        fs::write(
            &path,
            r#"{ "../../etc": { "deviceId": "../../etc", "deviceName": "Bad" } }"#,
        )
        .unwrap();

        let store = IdentityStore::open(&path).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(STATE_FILE_NAME);
        fs::write(&path, "{ truncated").unwrap();

        let mut store = IdentityStore::open(&path).unwrap();
        assert!(store.is_empty());

        // The next save replaces the corrupt content
        let pixel = identity("Pixel");
        store.insert(pixel.clone()).unwrap();
        let store = IdentityStore::open(&path).unwrap();
        assert_eq!(store.get(&pixel.device_id), Some(&pixel));
    }

    #[test]
    fn test_save_leaves_no_temporary_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(STATE_FILE_NAME);

        let mut store = IdentityStore::open(&path).unwrap();
        store.insert(identity("Pixel")).unwrap();

        assert!(path.is_file());
        assert!(!temp_path(&path).exists());
        assert_eq!(
            temp_path(&path).file_name().unwrap(),
            "devices.json.tmp"
        );
    }

    #[test]
    fn test_in_memory_store() {
        let mut store = IdentityStore::in_memory();
        assert!(store.path().is_none());
        assert!(store.insert(identity("Pixel")).unwrap());
        assert_eq!(store.identities().count(), 1);
    }
}
