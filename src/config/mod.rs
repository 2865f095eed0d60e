//! Configuration management for modhost
//!
//! Handles TOML configuration loading and validation. Every field has a
//! default, so an empty file (or no file) is a valid configuration.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::RetryConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

/// Module server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the module server listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Root of the install areas and artifact directories
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Directory that absolute local module references resolve against
    #[serde(default = "default_local_modules_dir")]
    pub local_modules_dir: PathBuf,

    /// Package manager executable
    #[serde(default = "default_package_manager")]
    pub package_manager: String,

    /// Bundler executable, invoked as `<bundler> <entry> <output>`
    #[serde(default = "default_bundler")]
    pub bundler: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_local_modules_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_package_manager() -> String {
    "yarn".to_string()
}

fn default_bundler() -> String {
    "rollup".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            work_dir: default_work_dir(),
            local_modules_dir: default_local_modules_dir(),
            package_manager: default_package_manager(),
            bundler: default_bundler(),
        }
    }
}

/// Lifecycle client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Module server to connect to
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Resolve modules from in-process code only, without a server
    #[serde(default)]
    pub offline: bool,

    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Connection attempts before pending requests are failed
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
}

fn default_server_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_reconnect_initial_delay_ms() -> u64 {
    250
}

fn default_reconnect_max_delay_ms() -> u64 {
    10_000
}

fn default_reconnect_attempts() -> u32 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            offline: false,
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_attempts: default_reconnect_attempts(),
        }
    }
}

impl ClientConfig {
    /// Backoff used by the connection driver
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.reconnect_attempts,
            Duration::from_millis(self.reconnect_initial_delay_ms),
        )
        .with_max_delay(Duration::from_millis(self.reconnect_max_delay_ms))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive (e.g. `"info"`, `"modhost::module=debug"`);
    /// `RUST_LOG` takes precedence
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

impl HostConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: HostConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server.validate()?;
        self.client.validate()?;
        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.work_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("server.work_dir must not be empty"));
        }
        if self.package_manager.trim().is_empty() {
            return Err(anyhow::anyhow!("server.package_manager must not be empty"));
        }
        if self.bundler.trim().is_empty() {
            return Err(anyhow::anyhow!("server.bundler must not be empty"));
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.offline && self.server_addr.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "client.server_addr is required unless client.offline is set"
            ));
        }
        if self.reconnect_initial_delay_ms == 0 {
            return Err(anyhow::anyhow!(
                "client.reconnect_initial_delay_ms must be greater than 0"
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_initial_delay_ms {
            return Err(anyhow::anyhow!(
                "client.reconnect_max_delay_ms must not be below reconnect_initial_delay_ms"
            ));
        }
        if self.reconnect_attempts == 0 {
            return Err(anyhow::anyhow!(
                "client.reconnect_attempts must be greater than 0"
            ));
        }
        Ok(())
    }
}
