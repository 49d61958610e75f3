//! One replica group: a named set of backends and the consistent-hash ring
//! that places keys on them.

use backend::{Backend, BackendError, ClientError};
use data_types::{shard_key, CircleConfig, ProxyConfig};
use serde_json::{json, Value};
use sharder::HashRing;
use std::sync::Arc;

#[derive(Debug)]
pub struct Circle {
    id: usize,
    name: String,
    backends: Vec<Arc<Backend>>,
    ring: HashRing<Arc<Backend>>,
}

impl Circle {
    /// Open every backend of the group and build its ring. The ring is
    /// rebuilt exactly when the backend set changes, which only happens
    /// through configuration reload creating a new `Circle`.
    pub async fn open(
        id: usize,
        cfg: &CircleConfig,
        px: &ProxyConfig,
    ) -> Result<Arc<Self>, BackendError> {
        let mut backends = Vec::with_capacity(cfg.backends.len());
        for bc in &cfg.backends {
            backends.push(Backend::open(bc, px).await?);
        }
        let ring = HashRing::new(
            backends
                .iter()
                .map(|b| (b.url().to_string(), Arc::clone(b))),
        );
        Ok(Arc::new(Self {
            id,
            name: cfg.name.clone(),
            backends,
            ring,
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Resolve the ring-assigned owner of a shard key.
    pub fn get_backend(&self, key: &str) -> Option<&Arc<Backend>> {
        self.ring.get(key)
    }

    /// Drain and release every backend of the group.
    pub async fn close(&self) {
        futures::future::join_all(self.backends.iter().map(|b| b.close())).await;
    }

    /// Health document for the admin surface.
    pub async fn health(&self, stats: bool) -> Value {
        let backends =
            futures::future::join_all(self.backends.iter().map(|b| self.backend_health(b, stats)))
                .await;
        json!({
            "circle": { "id": self.id, "name": self.name },
            "backends": backends,
        })
    }

    async fn backend_health(&self, be: &Arc<Backend>, stats: bool) -> Value {
        let mut doc = json!({
            "name": be.name(),
            "url": be.url(),
            "active": be.is_active(),
            "backlog": be.has_backlog().await,
            "rewrite": be.rewrite_running(),
            "halted": be.is_halted(),
        });
        if stats {
            let placement = match self.placement_stats(be).await {
                Ok(v) => v,
                Err(e) => json!({ "error": e.to_string() }),
            };
            doc["stats"] = placement;
        }
        doc
    }

    /// Per-database placement counts: how many measurements on this backend
    /// sit where the ring says they belong.
    async fn placement_stats(&self, be: &Arc<Backend>) -> Result<Value, ClientError> {
        let mut load = serde_json::Map::new();
        for db in be.client().show_databases().await? {
            if db == "_internal" {
                continue;
            }
            let measurements = be.client().show_measurements(&db).await?;
            let mut inplace = 0;
            let mut incorrect = 0;
            for meas in &measurements {
                match self.get_backend(&shard_key(&db, meas)) {
                    Some(owner) if owner.url() == be.url() => inplace += 1,
                    _ => incorrect += 1,
                }
            }
            load.insert(
                db,
                json!({
                    "measurements": measurements.len(),
                    "inplace": inplace,
                    "incorrect": incorrect,
                }),
            );
        }
        Ok(Value::Object(load))
    }
}
