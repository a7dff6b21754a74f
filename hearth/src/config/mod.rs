use std::{collections::HashMap, path::Path};

use hearth_core::config::{
    parse_from_slice, ListenerConfig, RuntimeConfig, ScannerConfig, ServiceConfig, StorageConfig,
    MAX_CONFIG_FILE_SIZE,
};
use serde::{Deserialize, Serialize};

pub mod manager;

pub type ServiceConfigMap = HashMap<String, ServiceConfig<ListenerConfig, ServerConfig>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scanner: Option<ScannerConfig>,
    pub servers: ServiceConfigMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub protocol: ProtocolConfig,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolConfig {
    /// Raw byte relay.
    Echo {
        #[serde(default = "default_echo_buffer_size")]
        buffer_size: usize,
    },
    /// Line protocol answering every request with itself.
    LineEcho,
    /// Line protocol exposing the runtime storage.
    Cache,
}

fn default_echo_buffer_size() -> usize {
    hearth_services::tcp::echo::DEFAULT_ECHO_BUFFER_SIZE
}

impl Config {
    /// Load and parse the config file, returning the parsed config together
    /// with the raw bytes (the hot-reload scanner diffs against them).
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<(Self, Vec<u8>)> {
        let content = hearth_core::util::file_read(path).await?;
        if content.len() > MAX_CONFIG_FILE_SIZE {
            anyhow::bail!("config file too large: {} bytes", content.len());
        }
        let config = parse_from_slice::<Self>(&content)?;
        Ok((config, content))
    }

    pub fn parse_service_config(content: &[u8]) -> anyhow::Result<ServiceConfigMap> {
        #[derive(Deserialize)]
        struct Container {
            servers: ServiceConfigMap,
        }
        Ok(parse_from_slice::<Container>(content)?.servers)
    }
}
