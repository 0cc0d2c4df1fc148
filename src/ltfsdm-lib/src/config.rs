use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{DmError, DmResult};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ltfsdm/ltfsdmd.json";

/// Backend configuration file. Unknown fields are ignored, missing ones
/// fall back to the defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(alias = "db")]
    pub db_path: PathBuf,
    #[serde(alias = "pool_config", alias = "pools_file")]
    pub pool_conf_path: PathBuf,
    #[serde(alias = "attr_store")]
    pub attr_store_path: PathBuf,
    #[serde(alias = "socket")]
    pub socket_path: PathBuf,
    #[serde(alias = "key_file")]
    pub key_file_path: PathBuf,
    #[serde(alias = "lock_file")]
    pub lock_file_path: PathBuf,
    pub library: LibraryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/ltfsdm/queue.db"),
            pool_conf_path: PathBuf::from("/var/lib/ltfsdm/pools.json"),
            attr_store_path: PathBuf::from("/var/lib/ltfsdm/attrs.json"),
            socket_path: PathBuf::from("/run/ltfsdm/ltfsdmd.sock"),
            key_file_path: PathBuf::from("/run/ltfsdm/ltfsdmd.key"),
            lock_file_path: PathBuf::from("/run/ltfsdm/ltfsdmd.lock"),
            library: LibraryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> DmResult<ServerConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DmError::Config(format!("reading {} failed: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| DmError::Config(format!("parsing {} failed: {}", path.display(), e)))
    }

    /// Load `path` if it exists, otherwise fall back to the defaults.
    pub fn load_or_default(path: &Path) -> DmResult<ServerConfig> {
        if path.exists() {
            ServerConfig::load(path)
        } else {
            Ok(ServerConfig::default())
        }
    }
}

/// Description of the attached library for the simulated driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub drives: Vec<DriveConfigEntry>,
    #[serde(alias = "tapes")]
    pub cartridges: Vec<CartridgeConfigEntry>,
    /// Simulated per-operation latency in milliseconds.
    pub op_delay_ms: u64,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            drives: Vec::new(),
            cartridges: Vec::new(),
            op_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfigEntry {
    #[serde(alias = "drive_id")]
    pub id: String,
    pub slot: u64,
}

impl Default for DriveConfigEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            slot: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CartridgeConfigEntry {
    #[serde(alias = "tape_id")]
    pub id: String,
    pub slot: u64,
    /// Capacities in MiB.
    pub total_cap: u64,
    pub remaining_cap: u64,
    pub formatted: bool,
    pub write_protected: bool,
    pub accessible: bool,
}

impl Default for CartridgeConfigEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            slot: 0,
            total_cap: 0,
            remaining_cap: 0,
            formatted: true,
            write_protected: false,
            accessible: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_applied_for_missing_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ltfsdmd.json");
        std::fs::write(
            &path,
            r#"{ "db": "/tmp/q.db", "library": { "drives": [ { "id": "d0", "slot": 256 } ] } }"#,
        )
        .unwrap();

        let conf = ServerConfig::load(&path).unwrap();
        assert_eq!(conf.db_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(conf.socket_path, ServerConfig::default().socket_path);
        assert_eq!(conf.library.drives.len(), 1);
        assert_eq!(conf.library.drives[0].slot, 256);
        assert!(conf.library.cartridges.is_empty());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let conf = ServerConfig::load_or_default(Path::new("/nonexistent/ltfsdmd.json")).unwrap();
        assert_eq!(conf.db_path, ServerConfig::default().db_path);
    }
}
