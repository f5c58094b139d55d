use crate::distributor::PlacementPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 1024;
pub const DEFAULT_IO_THREADS: usize = 8;
pub const DEFAULT_DIRENTS_BUFF_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub fs: FsSettings,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub placement: PlacementPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub mountdir: PathBuf,
    pub rootdir: PathBuf,
    /// Defaults to `<rootdir>/metadata`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadir: Option<PathBuf>,
    pub listen: SocketAddr,
    /// Address other processes use to reach this daemon. Defaults to `listen`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise: Option<SocketAddr>,
    pub hosts_file: PathBuf,
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_dirents_buff_size")]
    pub dirents_buff_size: u64,
    #[serde(default = "default_true")]
    pub create_exist_check: bool,
    #[serde(default = "default_true")]
    pub implicit_data_removal: bool,
    #[serde(default)]
    pub zero_buffer_before_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_connection_cache")]
    pub connection_cache: u64,
}

fn default_io_threads() -> usize {
    DEFAULT_IO_THREADS
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_dirents_buff_size() -> u64 {
    DEFAULT_DIRENTS_BUFF_SIZE
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_retries() -> u32 {
    3
}

fn default_connection_cache() -> u64 {
    1024
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            mountdir: PathBuf::from("/tmp/gkfs_mount"),
            rootdir: PathBuf::from("/tmp/gkfs_root"),
            metadir: None,
            listen: SocketAddr::from(([127, 0, 0, 1], 4433)),
            advertise: None,
            hosts_file: PathBuf::from("/tmp/gkfs_hosts.txt"),
            io_threads: DEFAULT_IO_THREADS,
        }
    }
}

impl DaemonConfig {
    pub fn chunk_dir(&self) -> PathBuf {
        self.rootdir.join("data").join("chunks")
    }

    pub fn metadir(&self) -> PathBuf {
        self.metadir
            .clone()
            .unwrap_or_else(|| self.rootdir.join("metadata"))
    }

    pub fn advertise(&self) -> SocketAddr {
        self.advertise.unwrap_or(self.listen)
    }
}

impl Default for FsSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            dirents_buff_size: DEFAULT_DIRENTS_BUFF_SIZE,
            create_exist_check: true,
            implicit_data_removal: true,
            zero_buffer_before_read: false,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            connection_cache: default_connection_cache(),
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    pub fn from_file(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !crate::arithmetic::is_power_of_2(self.fs.chunk_size) {
            anyhow::bail!(
                "fs.chunk_size must be a power of two, got {}",
                self.fs.chunk_size
            );
        }
        if self.daemon.io_threads == 0 {
            anyhow::bail!("daemon.io_threads must be at least 1");
        }
        if self.rpc.timeout_ms == 0 {
            anyhow::bail!("rpc.timeout_ms must be at least 1");
        }
        Ok(())
    }

    pub fn generate_default() -> String {
        let default = Settings::default();
        let body = toml::to_string_pretty(&default).unwrap_or_default();
        format!(
            "# gkfs configuration\n\
             #\n\
             # Every daemon and client of one cluster must agree on fs.chunk_size\n\
             # and [placement]. Placement kinds: simple_hash, jump_hash, local_only,\n\
             # forwarder (forward_host = <id>), guided (map_file = \"<path>\").\n\
             # Log verbosity is controlled through RUST_LOG.\n\n{}",
            body
        )
    }

    pub fn write_default_config(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, Self::generate_default())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}
