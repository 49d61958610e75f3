//! Shared types for the proxy: the unit of write traffic, backend and
//! replica-group configuration, and shard-key building.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One normalized line-protocol record together with its destination
/// database and retention policy.
///
/// `line` never contains an embedded newline except optionally a trailing
/// one; the timestamp has already been appended by the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinePoint {
    pub db: String,
    pub rp: String,
    pub line: Bytes,
}

impl LinePoint {
    pub fn new(db: impl Into<String>, rp: impl Into<String>, line: impl Into<Bytes>) -> Self {
        Self {
            db: db.into(),
            rp: rp.into(),
            line: line.into(),
        }
    }
}

/// Configuration of one physical backend node. The stable identity key is
/// `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Configuration of one replica group: a named set of backends that together
/// hold a complete copy of the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleConfig {
    pub name: String,
    pub backends: Vec<BackendConfig>,
}

/// Proxy-level configuration shared by every backend write engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub circles: Vec<CircleConfig>,

    /// Database allow-list; when non-empty, writes and non-administrative
    /// queries to other databases are rejected.
    #[serde(default)]
    pub dbs: Vec<String>,

    /// Root directory for the per-backend overflow queues.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Lines buffered per database before a flush is forced.
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,

    /// Seconds a non-empty buffer may sit before a timed flush.
    #[serde(default = "default_flush_time")]
    pub flush_time: u64,

    /// Seconds between backend liveness probes.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Seconds between attempts to drain the overflow queue.
    #[serde(default = "default_rewrite_interval")]
    pub rewrite_interval: u64,

    /// Upper bound on concurrent outbound HTTP batches per backend.
    #[serde(default = "default_conn_pool_size")]
    pub conn_pool_size: usize,

    /// Seconds before an outbound write request is abandoned.
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_flush_size() -> usize {
    10_000
}

fn default_flush_time() -> u64 {
    1
}

fn default_check_interval() -> u64 {
    1
}

fn default_rewrite_interval() -> u64 {
    10
}

fn default_conn_pool_size() -> usize {
    20
}

fn default_write_timeout() -> u64 {
    10
}

/// The placement key for a `(database, measurement)` pair.
///
/// This string feeds the consistent-hash ring, so its shape is part of the
/// wire contract and must not change.
pub fn shard_key(db: &str, measurement: &str) -> String {
    let mut key = String::with_capacity(db.len() + measurement.len() + 1);
    key.push_str(db);
    key.push(',');
    key.push_str(measurement);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_key_shape() {
        assert_eq!(shard_key("db1", "cpu"), "db1,cpu");
    }

    #[test]
    fn proxy_config_defaults() {
        let cfg: ProxyConfig = serde_json::from_str(
            r#"{"circles":[{"name":"c0","backends":[{"name":"b0","url":"http://127.0.0.1:8086"}]}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.flush_size, 10_000);
        assert_eq!(cfg.flush_time, 1);
        assert_eq!(cfg.rewrite_interval, 10);
        assert_eq!(cfg.conn_pool_size, 20);
        assert_eq!(cfg.data_dir, "data");
        assert!(cfg.dbs.is_empty());
        assert_eq!(cfg.circles[0].backends[0].username, "");
    }

    #[test]
    fn line_point_holds_shared_bytes() {
        let p = LinePoint::new("db1", "", &b"cpu v=1 1"[..]);
        let q = p.clone();
        assert_eq!(p.line, q.line);
    }
}
