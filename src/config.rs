use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_DISCOVERY_PORT: u16 = 5005;
pub const DEFAULT_TRANSFER_PORT: u16 = 5005;

/// Node settings. Every field has a default so a partial JSON file is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display_name: String,
    /// Address both sockets bind to.
    pub bind_ip: IpAddr,
    pub discovery_port: u16,
    pub transfer_port: u16,
    pub received_dir: PathBuf,
    pub discovery_window_ms: u64,
    pub announce_interval_ms: u64,
    pub peer_ttl_ms: u64,
    pub evict_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub chunk_size: usize,
    pub max_file_size: u64,
    pub max_concurrent_transfers: usize,
    pub preview_max_source_bytes: u64,
    /// Send announcements and probes to the subnet broadcast address.
    pub broadcast: bool,
    /// Extra unicast destinations for announcements and probes.
    pub extra_targets: Vec<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            received_dir: PathBuf::from("received"),
            discovery_window_ms: 2_000,
            announce_interval_ms: 3_000,
            peer_ttl_ms: 15_000,
            evict_interval_ms: 10_000,
            connect_timeout_ms: 5_000,
            io_timeout_ms: 15_000,
            chunk_size: 64 * 1024,
            max_file_size: 16 * 1024 * 1024 * 1024,
            max_concurrent_transfers: 8,
            preview_max_source_bytes: 32 * 1024 * 1024,
            broadcast: true,
            extra_targets: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(Error::Config(
                "max_concurrent_transfers must be positive".into(),
            ));
        }
        if self.discovery_window_ms == 0 {
            return Err(Error::Config("discovery_window_ms must be positive".into()));
        }
        if self.display_name.trim().is_empty() {
            return Err(Error::Config("display_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }

    pub fn evict_interval(&self) -> Duration {
        Duration::from_millis(self.evict_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// The subset of settings both transfer roles need.
#[derive(Debug, Clone)]
pub struct TransferLimits {
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_file_size: u64,
    pub max_concurrent_transfers: usize,
    pub preview_max_source_bytes: u64,
}

impl From<&Config> for TransferLimits {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
            max_file_size: config.max_file_size,
            max_concurrent_transfers: config.max_concurrent_transfers,
            preview_max_source_bytes: config.preview_max_source_bytes,
        }
    }
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// System hostname for the UI, or a random two-word name if it is unavailable.
pub fn default_display_name() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| names::Generator::default().next())
        .unwrap_or_else(|| "Unknown Device".to_string())
}
