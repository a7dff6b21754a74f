use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::listener::ListenerBuilder;

// MAX configuration file size: 16 MB
pub const MAX_CONFIG_FILE_SIZE: usize = 16 * 1024 * 1024;
// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

pub const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 1;
pub const MIN_SQPOLL_IDLE_TIME: u32 = 1000; // 1s idle time.
pub const FALLBACK_PARALLELISM: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(1) };

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

/// Worker-pool runtime settings: pool size, io driver selection and the
/// supervision cadence applied to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub worker_threads: usize,
    #[serde(default = "default_entries")]
    pub entries: u32,
    pub sqpoll_idle: Option<u32>,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
    #[serde(default = "default_graceful_shutdown")]
    pub graceful_shutdown_secs: u64,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
            graceful_shutdown_secs: default_graceful_shutdown(),
            monitor_interval_secs: default_monitor_interval(),
        }
    }
}

impl RuntimeConfig {
    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into()
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, true, bool);
define_const!(default_graceful_shutdown, DEFAULT_GRACEFUL_SHUTDOWN_SECS, u64);
define_const!(default_monitor_interval, DEFAULT_MONITOR_INTERVAL_SECS, u64);
define_const!(default_scan_interval, DEFAULT_SCAN_INTERVAL_SECS, u64);
define_const!(default_weight, 1, u16);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

/// A deployable service: a listener definition plus the server-specific
/// configuration flattened beside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig<LC, SC> {
    pub listener: LC,
    #[serde(flatten)]
    pub server: SC,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ListenerConfig {
    SocketAddress(SocketAddress),
    Uds(Uds),
}

impl TryFrom<ListenerConfig> for ListenerBuilder {
    type Error = std::io::Error;

    fn try_from(value: ListenerConfig) -> Result<Self, Self::Error> {
        match value {
            ListenerConfig::SocketAddress(addr) => {
                ListenerBuilder::bind_tcp(addr.socket_addr, Default::default())
            }
            #[cfg(unix)]
            ListenerConfig::Uds(addr) => ListenerBuilder::bind_unix(addr.uds_path),
            #[cfg(not(unix))]
            ListenerConfig::Uds(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix domain sockets are not available on this platform",
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SocketAddress {
    pub socket_addr: std::net::SocketAddr,
    #[serde(default)]
    pub transport_protocol: TransportProtocol,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Uds {
    pub uds_path: PathBuf,
    #[serde(default)]
    pub transport_protocol: TransportProtocol,
}

/// Deployment-directory watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub deploy_dir: PathBuf,
    #[serde(default = "default_scan_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_service_unit")]
    pub service_unit: String,
}

impl ScannerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_service_unit() -> String {
    "hearth".to_string()
}

/// Storage backend selection. The server list only matters to distributed
/// backends; the in-memory store ignores it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(rename = "type", default)]
    pub kind: StorageType,
    #[serde(default)]
    pub servers: Vec<StorageServer>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageServer {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u16,
}

/// Parse a config document from raw bytes, accepting JSON or TOML. The
/// format is sniffed from the first non-space byte.
pub fn parse_from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
    // read first non-space u8
    let is_json = match content
        .iter()
        .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
    {
        Some(first) => *first == b'{',
        None => false,
    };
    match is_json {
        true => serde_json::from_slice::<T>(content).map_err(Into::into),
        false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
    }
}
