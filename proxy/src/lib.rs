//! Top-level router: holds the replica groups, fans writes out to the ring
//! owner in every group, dispatches queries, and swaps the whole topology
//! on configuration reload.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use backend::{Backend, BackendError};
use bytes::Bytes;
use data_types::{shard_key, LinePoint, ProxyConfig};
use line_protocol::{append_nanos, rapid_check, scan_key, Precision};
use parking_lot::RwLock;
use serde_json::Value;
use std::{collections::HashSet, sync::Arc};
use tracing::{info, warn};

mod circle;
mod query;

pub use circle::Circle;
pub use query::{parse as parse_query, ParsedQuery, QueryError, QueryKind};

/// The reserved internal database; never proxied.
const INTERNAL_DB: &str = "_internal";

#[derive(Debug)]
pub struct Proxy {
    circles: RwLock<Vec<Arc<Circle>>>,
    db_set: RwLock<HashSet<String>>,
}

impl Proxy {
    /// Build every replica group from the configuration.
    pub async fn open(cfg: &ProxyConfig) -> Result<Self, BackendError> {
        let circles = Self::open_circles(cfg).await?;
        Ok(Self {
            circles: RwLock::new(circles),
            db_set: RwLock::new(cfg.dbs.iter().cloned().collect()),
        })
    }

    async fn open_circles(cfg: &ProxyConfig) -> Result<Vec<Arc<Circle>>, BackendError> {
        let mut circles = Vec::with_capacity(cfg.circles.len());
        for (id, circfg) in cfg.circles.iter().enumerate() {
            circles.push(Circle::open(id, circfg, cfg).await?);
        }
        Ok(circles)
    }

    /// Swap in a freshly built topology and drain the old one in the
    /// background. Readers keep working on their snapshot throughout.
    pub async fn reload(&self, cfg: &ProxyConfig) -> Result<(), BackendError> {
        let circles = Self::open_circles(cfg).await?;
        let old = {
            let mut guard = self.circles.write();
            std::mem::replace(&mut *guard, circles)
        };
        *self.db_set.write() = cfg.dbs.iter().cloned().collect();

        tokio::spawn(async move {
            for circle in old {
                circle.close().await;
            }
            info!("previous topology drained");
        });
        Ok(())
    }

    /// Snapshot of the current replica groups.
    pub fn circles(&self) -> Vec<Arc<Circle>> {
        self.circles.read().clone()
    }

    pub fn circle(&self, id: usize) -> Option<Arc<Circle>> {
        self.circles.read().get(id).cloned()
    }

    /// The ring owner of `key` in every replica group.
    pub fn get_backends(&self, key: &str) -> Vec<Arc<Backend>> {
        self.circles()
            .iter()
            .filter_map(|c| c.get_backend(key).cloned())
            .collect()
    }

    pub fn is_forbidden_db(&self, db: &str) -> bool {
        if db == INTERNAL_DB {
            return true;
        }
        let dbs = self.db_set.read();
        !dbs.is_empty() && !dbs.contains(db)
    }

    /// Fan one write payload out to the ring owners. Lines that fail to
    /// parse are logged and skipped; the call only fails for a database
    /// with no reachable ring.
    pub async fn write(&self, payload: &[u8], db: &str, rp: &str, precision: Precision) {
        let circles = self.circles();
        for line in payload.split(|&c| c == b'\n') {
            let line = trim_line(line);
            if line.is_empty() {
                continue;
            }
            self.write_line(&circles, line, db, rp, precision).await;
        }
    }

    async fn write_line(
        &self,
        circles: &[Arc<Circle>],
        line: &[u8],
        db: &str,
        rp: &str,
        precision: Precision,
    ) {
        let nano_line = append_nanos(line, precision);
        let (meas, end) = match scan_key(&nano_line) {
            Ok(v) => v,
            Err(e) => {
                warn!(%db, error = %e, "scan key error, dropping line");
                return;
            }
        };
        if !rapid_check(&nano_line[end..]) {
            warn!(%db, %meas, "invalid line shape, dropping line");
            return;
        }

        let key = shard_key(db, &meas);
        let point = LinePoint::new(db, rp, Bytes::from(nano_line));
        for circle in circles {
            match circle.get_backend(&key) {
                Some(be) => {
                    if let Err(e) = be.write_point(point.clone()).await {
                        warn!(url = %be.url(), %db, error = %e, "write point failed");
                    }
                }
                None => warn!(circle = %circle.name(), %key, "no backend for key"),
            }
        }
    }

    /// Classify and route one query, returning the backend's status code
    /// and body verbatim.
    pub async fn query(
        &self,
        q: &str,
        db_param: &str,
        epoch: &str,
        pretty: bool,
    ) -> Result<(u16, Bytes), QueryError> {
        let parsed = query::parse(q)?;

        let db = parsed
            .db
            .clone()
            .or_else(|| (!db_param.is_empty()).then(|| db_param.to_string()));
        if !parsed.show_databases {
            let db = db.as_deref().ok_or(QueryError::DatabaseNotFound)?;
            if self.is_forbidden_db(db) {
                return Err(QueryError::Forbidden(db.to_string()));
            }
        }
        let db = db.unwrap_or_default();

        match parsed.kind {
            QueryKind::SelectFrom => {
                let meas = parsed
                    .measurement
                    .as_deref()
                    .ok_or(QueryError::MeasurementNotFound)?;
                let be = self
                    .pick_holder(&shard_key(&db, meas))
                    .ok_or(QueryError::NoHealthyBackend)?;
                Ok(forward(&be, q, &db, epoch, pretty).await?)
            }
            QueryKind::Show => {
                let be = match parsed.measurement.as_deref() {
                    Some(meas) => self.pick_holder(&shard_key(&db, meas)),
                    None => self.pick_any_active(),
                }
                .ok_or(QueryError::NoHealthyBackend)?;
                Ok(forward(&be, q, &db, epoch, pretty).await?)
            }
            QueryKind::DeleteOrDrop => {
                let meas = parsed
                    .measurement
                    .as_deref()
                    .ok_or(QueryError::MeasurementNotFound)?;
                let backends = self.get_backends(&shard_key(&db, meas));
                self.fan_out(backends, q, &db, epoch, pretty).await
            }
            QueryKind::Alter => {
                let backends: Vec<Arc<Backend>> = self
                    .circles()
                    .iter()
                    .flat_map(|c| c.backends().iter().cloned())
                    .collect();
                self.fan_out(backends, q, &db, epoch, pretty).await
            }
        }
    }

    /// First active ring owner of `key` across the replica groups.
    fn pick_holder(&self, key: &str) -> Option<Arc<Backend>> {
        self.get_backends(key)
            .into_iter()
            .find(|be| be.is_active())
    }

    fn pick_any_active(&self) -> Option<Arc<Backend>> {
        self.circles()
            .iter()
            .flat_map(|c| c.backends().iter())
            .find(|be| be.is_active())
            .cloned()
    }

    /// Send a mutating statement to every backend in `backends`; succeed
    /// only when all of them accept it.
    async fn fan_out(
        &self,
        backends: Vec<Arc<Backend>>,
        q: &str,
        db: &str,
        epoch: &str,
        pretty: bool,
    ) -> Result<(u16, Bytes), QueryError> {
        if backends.is_empty() {
            return Err(QueryError::NoHealthyBackend);
        }
        let results = futures::future::join_all(
            backends.iter().map(|be| forward(be, q, db, epoch, pretty)),
        )
        .await;

        let mut last = None;
        for result in results {
            let (status, body) = result?;
            if status >= 300 {
                return Ok((status, body));
            }
            last = Some((status, body));
        }
        Ok(last.unwrap_or((200, Bytes::new())))
    }

    pub async fn health(&self, stats: bool) -> Value {
        let circles = self.circles();
        let docs =
            futures::future::join_all(circles.iter().map(|c| c.health(stats))).await;
        Value::Array(docs)
    }

    /// Drain every replica group.
    pub async fn close(&self) {
        let circles = {
            let mut guard = self.circles.write();
            std::mem::take(&mut *guard)
        };
        for circle in circles {
            circle.close().await;
        }
    }
}

async fn forward(
    be: &Arc<Backend>,
    q: &str,
    db: &str,
    epoch: &str,
    pretty: bool,
) -> Result<(u16, Bytes), QueryError> {
    let (status, body) = be.client().query_raw(q, db, epoch, pretty).await?;
    Ok((status.as_u16(), body))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|c| !c.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|c| !c.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &line[start..end]
}
