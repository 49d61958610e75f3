//! Configuration file handling.
//!
//! The file is TOML or JSON, chosen by extension. `/reload` re-reads the
//! same path; the listen address, idle timeout and TLS settings are not
//! reloadable and silently keep their previous values.

use data_types::ProxyConfig;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Read {
        source: std::io::Error,
        path: String,
    },

    #[error("unable to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unable to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileConfig {
    /// Address the HTTP service binds; not reloadable.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Credentials every endpoint except /ping requires when set.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Per-request debug logging toggles.
    #[serde(default)]
    pub write_tracing: bool,
    #[serde(default)]
    pub query_tracing: bool,

    /// Connection header read timeout in seconds; not reloadable.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// PEM certificate and key enabling HTTPS; not reloadable.
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,

    /// Default log filter directive, overridable with --log-filter.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    pub proxy: ProxyConfig,
}

fn default_listen_addr() -> String {
    "127.0.0.1:7076".to_string()
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            source,
            path: path.display().to_string(),
        })?;
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            Ok(serde_json::from_str(&text)?)
        } else {
            Ok(toml::from_str(&text)?)
        }
    }

    /// Pin the non-reloadable fields to their previous values.
    pub fn keep_runtime(&mut self, old: &Self) {
        self.listen_addr = old.listen_addr.clone();
        self.idle_timeout = old.idle_timeout;
        self.tls_cert = old.tls_cert.clone();
        self.tls_key = old.tls_key.clone();
    }
}
