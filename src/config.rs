use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::gateway::registry::BackendEntry;

pub const DEFAULT_CONFIG_FILE: &str = "rpcgate.toml";
pub const ENV_PREFIX: &str = "RPCGATE_";
pub const DEFAULT_RPC_PATH: &str = "/rpc";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub binary_bind: String,
    pub json_bind: String,
    pub http_bind: String,
    /// Route of the HTTP call endpoint
    pub http_path: String,
    pub enable_binary: bool,
    pub enable_json: bool,
    pub enable_http: bool,
    /// Per-read deadline on RPC connections
    pub idle_timeout_secs: Option<u64>,
    /// Upper bound on graceful drain; unset waits forever
    pub drain_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary_bind: "0.0.0.0:50051".to_string(),
            json_bind: "0.0.0.0:50052".to_string(),
            http_bind: "0.0.0.0:8000".to_string(),
            http_path: DEFAULT_RPC_PATH.to_string(),
            enable_binary: true,
            enable_json: true,
            enable_http: true,
            idle_timeout_secs: None,
            drain_timeout_secs: Some(30),
        }
    }
}

impl ServerConfig {
    /// All protocols on ephemeral loopback ports.
    pub fn loopback() -> Self {
        Self {
            binary_bind: "127.0.0.1:0".to_string(),
            json_bind: "127.0.0.1:0".to_string(),
            http_bind: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub prefix_path: String,
    pub drain_timeout_secs: Option<u64>,
    /// Call timeout for bridged requests
    pub call_timeout_secs: Option<u64>,
    /// Backends registered at startup
    pub backends: Vec<BackendEntry>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8081".to_string(),
            prefix_path: DEFAULT_RPC_PATH.to_string(),
            drain_timeout_secs: Some(30),
            call_timeout_secs: None,
            backends: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub log_json: bool,
    pub verbose: bool,
}

impl AppConfig {
    /// Load configuration.
    ///
    /// Precedence, lowest first: built-in defaults, the TOML file (`path`
    /// or `rpcgate.toml` in the working directory), `RPCGATE_*` environment
    /// variables with `__` separating sections, then `overrides`.
    pub fn new<T: Serialize>(
        path: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let mut config: AppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;
        config.server.http_path = route_path(&config.server.http_path)?.to_string();
        config.gateway.prefix_path = route_path(&config.gateway.prefix_path)?.to_string();
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the defaults to `path` as a starting point for editing.
    pub fn write_default(path: &Path) -> Result<(), ConfigError> {
        let body = AppConfig::default().to_toml()?;
        std::fs::write(path, body).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Normalize a bind address; `:port` listens on every interface.
pub fn listen_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Route an HTTP call endpoint is mounted on; empty means `/rpc`.
pub fn route_path(path: &str) -> Result<&str, ConfigError> {
    if path.is_empty() {
        Ok(DEFAULT_RPC_PATH)
    } else if path.starts_with('/') {
        Ok(path)
    } else {
        Err(ConfigError::InvalidPath(path.to_string()))
    }
}
