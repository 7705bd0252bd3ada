//! Server configuration.
//!
//! Stored as TOML:
//! - Linux: `~/.config/chunkferry/server.toml`
//! - Windows: `%APPDATA%/chunkferry/server.toml`
//!
//! A missing file is created with defaults, including a freshly generated
//! access token.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use chunkferry_protocol::constants::{DISK_SAFETY_MARGIN, TRANSFER_IDLE_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the WebSocket server listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Root of `files/` and `chunks/`.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Bearer token every client must present.
    #[serde(default = "chunkferry_upload_server::generate_token")]
    pub token: String,

    /// Upload budget advertised to clients in bytes per second (0 = unlimited).
    #[serde(default)]
    pub upload_bandwidth: u64,

    /// Seconds a streamed chunk may sit idle before the server drops it.
    #[serde(default = "default_transfer_idle_timeout")]
    pub transfer_idle_timeout_secs: u64,

    /// Free space kept on top of a file's size before merging.
    #[serde(default = "default_safety_margin")]
    pub disk_safety_margin: u64,
}

fn default_listen() -> SocketAddr {
    ([0, 0, 0, 0], 9300).into()
}

fn default_storage_dir() -> PathBuf {
    base_dir().join("chunkferry").join("storage")
}

fn default_transfer_idle_timeout() -> u64 {
    TRANSFER_IDLE_TIMEOUT.as_secs()
}

fn default_safety_margin() -> u64 {
    DISK_SAFETY_MARGIN
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            storage_dir: default_storage_dir(),
            token: chunkferry_upload_server::generate_token(),
            upload_bandwidth: 0,
            transfer_idle_timeout_secs: default_transfer_idle_timeout(),
            disk_safety_margin: default_safety_margin(),
        }
    }
}

impl Config {
    /// Loads the configuration at `path`, or creates it with defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "created default configuration");
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // The file holds the access token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Platform-specific default configuration file.
pub fn default_path() -> PathBuf {
    base_dir().join("chunkferry").join("server.toml")
}

fn base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        PathBuf::from(
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into()),
        )
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}
