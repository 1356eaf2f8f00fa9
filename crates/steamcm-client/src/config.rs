//! Client configuration: TOML file with defaults for every field.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use steamcm_core::{CmError, CmResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub directory: DirectorySection,
    #[serde(default)]
    pub connection: ConnectionSection,
}

/// `[directory]` section: where the server list comes from.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectorySection {
    #[serde(default = "default_directory_url")]
    pub url: String,
    #[serde(default)]
    pub cell_id: u32,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// How many candidates to latency-probe per selection round.
    #[serde(default = "default_probe_count")]
    pub probe_count: usize,
}

impl Default for DirectorySection {
    fn default() -> Self {
        Self {
            url: default_directory_url(),
            cell_id: 0,
            http_timeout_secs: default_http_timeout(),
            probe_count: default_probe_count(),
        }
    }
}

/// `[connection]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Silence after which the peer is considered dead. Independent of the
    /// heartbeat interval the server hands out at logon.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Lag beyond this many intervals is logged.
    #[serde(default = "default_lag_warning_multiple")]
    pub lag_warning_multiple: u32,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default = "default_client_os_type")]
    pub client_os_type: u32,
    #[serde(default = "default_language")]
    pub client_language: String,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            lag_warning_multiple: default_lag_warning_multiple(),
            protocol_version: default_protocol_version(),
            client_os_type: default_client_os_type(),
            client_language: default_language(),
        }
    }
}

fn default_directory_url() -> String {
    "https://api.steampowered.com/ISteamDirectory/GetCMList/v1/".to_string()
}
fn default_http_timeout() -> u64 {
    10
}
fn default_probe_count() -> usize {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_heartbeat_timeout() -> u64 {
    60
}
fn default_lag_warning_multiple() -> u32 {
    3
}
fn default_protocol_version() -> u32 {
    65580
}
fn default_client_os_type() -> u32 {
    // Windows 10
    16
}
fn default_language() -> String {
    "english".to_string()
}

impl ClientConfig {
    /// Load config from a TOML file, falling back to defaults when no path is
    /// given or the file does not exist.
    pub fn load(config_path: Option<&Path>) -> CmResult<Self> {
        let Some(path) = config_path else {
            return Ok(Self::default());
        };
        let expanded = expand_tilde(path);
        if !expanded.exists() {
            info!(path = %expanded.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        info!(path = %expanded.display(), "loading config file");
        let content = std::fs::read_to_string(&expanded)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> CmResult<Self> {
        toml::from_str(content).map_err(|e| CmError::Config(format!("config parse error: {e}")))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.directory.http_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.request_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.heartbeat_timeout_secs)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
