//! Runtime configuration.
//!
//! Loaded once at startup from `<dir>/config.yml` (or `<dir>/{env}.yml` when
//! `ENV` is one of development|test|production), then overridden from the
//! environment. Immutable afterwards.

use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub contracts: Vec<Contract>,
}

/// Persistent log index location (sqlite path or `sqlite:` URL).
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub connection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection: "sqlite:ethlogspy.db".into(),
        }
    }
}

/// Response cache tuning. TTL applies uniformly to every entry.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 }
    }
}

/// Upstream node endpoint. The same host/port serves HTTP and WebSocket.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8545,
        }
    }
}

/// Listener settings and the first block the synchroniser backfills from.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub from_block: u64,
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            from_block: 0,
            cors_origin: "*".into(),
        }
    }
}

/// A contract the synchroniser tracks: address plus the human-readable event
/// signatures whose Keccak-256 hashes become `topics[0]` filters.
#[derive(Debug, Clone, Deserialize)]
pub struct Contract {
    pub address: String,
    #[serde(default)]
    pub signatures: Vec<String>,
}

impl Config {
    /// Load from the given directory and apply environment overrides.
    pub fn load(dir: &Path) -> Result<Config, Error> {
        if !dir.is_dir() {
            return Err(Error::ConfigInvalid(format!(
                "'{}' is not a valid directory",
                dir.display()
            )));
        }
        let path = dir.join(config_file_name());
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::ConfigInvalid(format!("open {}: {e}", path.display())))?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| Error::ConfigInvalid(format!("decode {}: {e}", path.display())))?;
        config.apply_env_overrides();
        config.normalize();
        Ok(config)
    }

    /// Environment overrides, matching the original deployment contract:
    /// NODE_HOST, NODE_PORT (default 8545 on unset or unparsable),
    /// BLOCK_NUMBER (sets server.from_block, default 0), CORS_ORIGIN.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("NODE_HOST") {
            if !host.is_empty() {
                self.node.host = host;
            }
        }
        if let Ok(port) = std::env::var("NODE_PORT") {
            self.node.port = port.parse().unwrap_or(8545);
        }
        if let Ok(block) = std::env::var("BLOCK_NUMBER") {
            self.server.from_block = block.parse().unwrap_or(0);
        }
        if let Ok(origin) = std::env::var("CORS_ORIGIN") {
            if !origin.is_empty() {
                self.server.cors_origin = origin;
            }
        }
    }

    /// Contract addresses are compared and indexed lowercase.
    fn normalize(&mut self) {
        for contract in &mut self.contracts {
            contract.address = contract.address.to_lowercase();
        }
    }

    pub fn node_http_url(&self) -> String {
        format!("http://{}:{}", self.node.host, self.node.port)
    }

    pub fn node_ws_url(&self) -> String {
        format!("ws://{}:{}", self.node.host, self.node.port)
    }
}

fn config_file_name() -> String {
    match std::env::var("ENV").as_deref() {
        Ok(env @ ("development" | "test" | "production")) => format!("{env}.yml"),
        _ => "config.yml".into(),
    }
}
