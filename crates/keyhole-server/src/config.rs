//! Server configuration: TOML file + CLI overrides.

use keyhole_core::{TunnelError, TunnelResult};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub gateway: GatewaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Listen port for the `/tun` endpoint.
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Address the `/tun` listener and all gateways bind to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Bind the `/tun` listener implicitly when `run` is called.
    /// When `false`, `open` must be invoked explicitly.
    #[serde(default = "default_true")]
    pub auto_bind: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind_addr: default_bind_addr(),
            auto_bind: true,
        }
    }
}

/// `[gateway]` section of the config TOML.
///
/// # TOML Example
///
/// ```toml
/// [gateway]
/// max_tunnels = 3
/// port_min = 4002
/// port_max = 4003
/// max_channels = 64
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// Hard cap on concurrent gateways.
    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: usize,
    /// Lower bound of the gateway port range (inclusive).
    ///
    /// Omit to lease ephemeral ports instead of a fixed range.
    #[serde(default = "default_port_min")]
    pub port_min: Option<u16>,
    /// Upper bound of the gateway port range (inclusive).
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    /// Maximum live data-channel sessions per gateway.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            max_tunnels: default_max_tunnels(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            max_channels: default_max_channels(),
        }
    }
}

fn default_server_port() -> u16 {
    4001
}
fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_max_tunnels() -> usize {
    3
}
fn default_port_min() -> Option<u16> {
    Some(4002)
}
fn default_port_max() -> u16 {
    4003
}
fn default_max_channels() -> usize {
    64
}
fn default_true() -> bool {
    true
}

/// Resolved server configuration (file values merged with CLI overrides).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port for the `/tun` listener.
    pub port: u16,
    /// Bind address for the listener and all gateways.
    pub bind_addr: String,
    /// Whether `run` binds the listener implicitly.
    pub auto_bind: bool,
    /// Hard cap on concurrent gateways.
    pub max_tunnels: usize,
    /// Inclusive gateway port range; `port_min = None` leases ephemeral ports.
    pub port_min: Option<u16>,
    pub port_max: u16,
    /// Maximum live data-channel sessions per gateway.
    pub max_channels: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl ServerConfig {
    fn from_file(file: ConfigFile) -> Self {
        Self {
            port: file.server.port,
            bind_addr: file.server.bind_addr,
            auto_bind: file.server.auto_bind,
            max_tunnels: file.gateway.max_tunnels,
            port_min: file.gateway.port_min,
            port_max: file.gateway.port_max,
            max_channels: file.gateway.max_channels,
        }
    }

    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing file silently yields defaults; CLI arguments, when `Some`,
    /// take precedence over file values.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_max_tunnels: Option<usize>,
        cli_port_min: Option<u16>,
        cli_port_max: Option<u16>,
    ) -> TunnelResult<Self> {
        let file_config = match config_path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| TunnelError::Transport(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file_config);
        if let Some(port) = cli_port {
            config.port = port;
        }
        if let Some(max) = cli_max_tunnels {
            config.max_tunnels = max;
        }
        if let Some(min) = cli_port_min {
            config.port_min = Some(min);
        }
        if let Some(max) = cli_port_max {
            config.port_max = max;
        }
        Ok(config)
    }
}
