//! Data-movement orchestrator.
//!
//! Four operators share one engine: rebalance, recovery, resync and
//! cleanup. Each streams measurements between backends so that every shard
//! key ends up on, and only on, its ring-assigned holder in every replica
//! group. Operators run as background tasks; admission is controlled by a
//! per-circle `transferring` flag and one global `resyncing` flag.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use backend::{Backend, ClientError, HttpClient, WriteOutcome};
use data_types::shard_key;
use parking_lot::RwLock;
use proxy::Circle;
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};

mod stream;

pub const DEFAULT_WORKER: usize = 1;
pub const DEFAULT_BATCH: usize = 25_000;
/// Default row cap per operator; zero means unbounded.
pub const DEFAULT_LIMIT: u64 = 0;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid circle id {0}")]
    InvalidCircle(usize),

    #[error("circle {0} is transferring")]
    CircleBusy(usize),

    #[error("proxy is resyncing")]
    Resyncing,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("compress batch: {0}")]
    Io(#[from] std::io::Error),

    #[error("destination rejected batch: {0:?}")]
    WriteRejected(WriteOutcome),
}

/// Per-backend movement counters, updated concurrently by operator workers.
#[derive(Debug, Default)]
pub struct Stats {
    inflight: AtomicI64,
    transferred: AtomicU64,
    incorrect: AtomicU64,
    inplace: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub inflight: i64,
    pub transferred: u64,
    pub incorrect: u64,
    pub inplace: u64,
    pub errors: u64,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inflight: self.inflight.load(Ordering::Relaxed),
            transferred: self.transferred.load(Ordering::Relaxed),
            incorrect: self.incorrect.load(Ordering::Relaxed),
            inplace: self.inplace.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Transfer bookkeeping for one replica group.
#[derive(Debug)]
pub struct CircleState {
    pub circle_id: usize,
    pub name: String,
    transferring: AtomicBool,
    stats: RwLock<HashMap<String, Arc<Stats>>>,
}

impl CircleState {
    fn new(circle_id: usize, name: String) -> Arc<Self> {
        Arc::new(Self {
            circle_id,
            name,
            transferring: AtomicBool::new(false),
            stats: RwLock::new(HashMap::new()),
        })
    }

    pub fn transferring(&self) -> bool {
        self.transferring.load(Ordering::Relaxed)
    }

    /// Force the flag; used by the HA state mirror endpoint.
    pub fn set_transferring(&self, value: bool) {
        self.transferring.store(value, Ordering::Relaxed);
    }

    fn begin(&self) -> bool {
        self.transferring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn end(&self) {
        self.transferring.store(false, Ordering::Release);
    }

    fn stats_for(&self, url: &str) -> Arc<Stats> {
        if let Some(stats) = self.stats.read().get(url) {
            return Arc::clone(stats);
        }
        Arc::clone(
            self.stats
                .write()
                .entry(url.to_string())
                .or_default(),
        )
    }

    fn reset_stats(&self) {
        self.stats.write().clear();
    }

    pub fn stats_snapshot(&self) -> Value {
        let stats = self.stats.read();
        let mut doc = serde_json::Map::new();
        for (url, s) in stats.iter() {
            doc.insert(
                url.clone(),
                serde_json::to_value(s.snapshot()).unwrap_or(Value::Null),
            );
        }
        Value::Object(doc)
    }
}

/// A backend that measurements are drained from. For rebalance after a
/// removal this may be a node that is no longer part of any ring.
#[derive(Debug, Clone)]
pub struct SourceNode {
    pub name: String,
    pub url: String,
    pub client: Arc<HttpClient>,
}

impl From<&Arc<Backend>> for SourceNode {
    fn from(be: &Arc<Backend>) -> Self {
        Self {
            name: be.name().to_string(),
            url: be.url().to_string(),
            client: Arc::clone(be.client()),
        }
    }
}

#[derive(Debug)]
pub struct Transfer {
    circles: RwLock<Vec<Arc<Circle>>>,
    states: RwLock<Vec<Arc<CircleState>>>,
    resyncing: AtomicBool,
    worker: AtomicUsize,
    batch: AtomicUsize,
    limit: AtomicU64,
    ha_addrs: RwLock<Vec<String>>,
    http: reqwest::Client,
}

impl Transfer {
    pub fn new(circles: Vec<Arc<Circle>>) -> Arc<Self> {
        let states = Self::states_for(&circles);
        Arc::new(Self {
            circles: RwLock::new(circles),
            states: RwLock::new(states),
            resyncing: AtomicBool::new(false),
            worker: AtomicUsize::new(DEFAULT_WORKER),
            batch: AtomicUsize::new(DEFAULT_BATCH),
            limit: AtomicU64::new(DEFAULT_LIMIT),
            ha_addrs: RwLock::new(Vec::new()),
            http: reqwest::Client::new(),
        })
    }

    fn states_for(circles: &[Arc<Circle>]) -> Vec<Arc<CircleState>> {
        circles
            .iter()
            .map(|c| CircleState::new(c.id(), c.name().to_string()))
            .collect()
    }

    /// Swap in the replica groups of a freshly reloaded topology.
    pub fn reload(&self, circles: Vec<Arc<Circle>>) {
        *self.states.write() = Self::states_for(&circles);
        *self.circles.write() = circles;
    }

    pub fn circle(&self, id: usize) -> Option<Arc<Circle>> {
        self.circles.read().get(id).cloned()
    }

    pub fn circle_state(&self, id: usize) -> Option<Arc<CircleState>> {
        self.states.read().get(id).cloned()
    }

    pub fn circle_states(&self) -> Vec<Arc<CircleState>> {
        self.states.read().clone()
    }

    pub fn resyncing(&self) -> bool {
        self.resyncing.load(Ordering::Relaxed)
    }

    /// Force the resyncing flag; used by the HA state mirror endpoint.
    pub fn set_resyncing(&self, value: bool) {
        self.resyncing.store(value, Ordering::Relaxed);
    }

    /// Admission parameters, set per request before an operator starts.
    pub fn set_params(&self, worker: usize, batch: usize, limit: u64) {
        self.worker.store(worker.max(1), Ordering::Relaxed);
        self.batch.store(batch.max(1), Ordering::Relaxed);
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn set_ha_addrs(&self, addrs: Vec<String>) {
        *self.ha_addrs.write() = addrs;
    }

    /// Reserve the per-circle operator slot. Fails while a resync runs or
    /// another operator holds the circle.
    pub fn begin_circle_op(&self, circle_id: usize) -> Result<(), TransferError> {
        if self.resyncing() {
            return Err(TransferError::Resyncing);
        }
        let state = self
            .circle_state(circle_id)
            .ok_or(TransferError::InvalidCircle(circle_id))?;
        if state.begin() {
            Ok(())
        } else {
            Err(TransferError::CircleBusy(circle_id))
        }
    }

    pub fn end_circle_op(&self, circle_id: usize) {
        if let Some(state) = self.circle_state(circle_id) {
            state.end();
        }
    }

    /// Reserve the global resync slot. Fails while any circle transfers.
    pub fn begin_resync(&self) -> Result<(), TransferError> {
        if let Some(state) = self.states.read().iter().find(|s| s.transferring()) {
            return Err(TransferError::CircleBusy(state.circle_id));
        }
        if self
            .resyncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Ok(())
        } else {
            Err(TransferError::Resyncing)
        }
    }

    pub fn end_resync(&self) {
        self.resyncing.store(false, Ordering::Release);
    }

    /// Document for GET /transfer/state.
    pub fn state_doc(&self) -> Value {
        let circles: Vec<Value> = self
            .circle_states()
            .iter()
            .map(|s| {
                json!({
                    "id": s.circle_id,
                    "name": s.name,
                    "transferring": s.transferring(),
                })
            })
            .collect();
        json!({ "resyncing": self.resyncing(), "circles": circles })
    }

    /// Move every misplaced measurement of `sources` to its ring-assigned
    /// holder in the circle, deleting from the source after a complete
    /// copy. `sources` covers the circle members plus any removed nodes
    /// still holding data.
    pub async fn rebalance(
        &self,
        circle_id: usize,
        sources: Vec<SourceNode>,
        dbs: Vec<String>,
    ) -> Result<(), TransferError> {
        let circle = self
            .circle(circle_id)
            .ok_or(TransferError::InvalidCircle(circle_id))?;
        self.begin_circle_op(circle_id)?;
        info!(circle_id, sources = sources.len(), "rebalance started");
        self.broadcast_circle_state(circle_id, true).await;

        let state = self
            .circle_state(circle_id)
            .ok_or(TransferError::InvalidCircle(circle_id))?;
        state.reset_stats();
        let result = self
            .run_moves(&state, &circle, sources, dbs, None, true)
            .await;

        self.end_circle_op(circle_id);
        self.broadcast_circle_state(circle_id, false).await;
        info!(circle_id, "rebalance finished");
        result
    }

    /// Copy every measurement whose `to_circle` holder is in
    /// `backend_urls` (or all when empty) from its `from_circle` holder.
    /// Nothing is deleted.
    pub async fn recovery(
        &self,
        from_circle_id: usize,
        to_circle_id: usize,
        backend_urls: Vec<String>,
        dbs: Vec<String>,
    ) -> Result<(), TransferError> {
        let from = self
            .circle(from_circle_id)
            .ok_or(TransferError::InvalidCircle(from_circle_id))?;
        let to = self
            .circle(to_circle_id)
            .ok_or(TransferError::InvalidCircle(to_circle_id))?;

        self.begin_circle_op(from_circle_id)?;
        if let Err(e) = self.begin_circle_op(to_circle_id) {
            self.end_circle_op(from_circle_id);
            return Err(e);
        }
        info!(from_circle_id, to_circle_id, "recovery started");
        self.broadcast_circle_state(to_circle_id, true).await;

        let state = self
            .circle_state(to_circle_id)
            .ok_or(TransferError::InvalidCircle(to_circle_id))?;
        state.reset_stats();
        let url_filter: HashSet<String> = backend_urls.into_iter().collect();
        let result = self
            .run_recovery(&state, &from, &to, url_filter, dbs)
            .await;

        self.end_circle_op(to_circle_id);
        self.end_circle_op(from_circle_id);
        self.broadcast_circle_state(to_circle_id, false).await;
        info!(from_circle_id, to_circle_id, "recovery finished");
        result
    }

    /// Cross-replica repair: copy rows newer than `tick` seconds (all rows
    /// when zero) from every holder to the corresponding holder in every
    /// other circle.
    pub async fn resync(&self, dbs: Vec<String>, tick: u64) -> Result<(), TransferError> {
        self.begin_resync()?;
        info!(tick, "resync started");
        self.broadcast_resyncing(true).await;

        let min_ts =
            (tick > 0).then(|| line_protocol::now_nanos() - (tick as i64) * 1_000_000_000);
        let result = self.run_resync(dbs, min_ts).await;

        self.end_resync();
        self.broadcast_resyncing(false).await;
        info!("resync finished");
        result
    }

    /// Delete from each backend of the circle every measurement whose
    /// ring-assigned holder is a different backend. Idempotent.
    pub async fn cleanup(&self, circle_id: usize) -> Result<(), TransferError> {
        let circle = self
            .circle(circle_id)
            .ok_or(TransferError::InvalidCircle(circle_id))?;
        self.begin_circle_op(circle_id)?;
        info!(circle_id, "cleanup started");
        self.broadcast_circle_state(circle_id, true).await;

        let state = self
            .circle_state(circle_id)
            .ok_or(TransferError::InvalidCircle(circle_id))?;
        state.reset_stats();
        let result = self.run_cleanup(&state, &circle).await;

        self.end_circle_op(circle_id);
        self.broadcast_circle_state(circle_id, false).await;
        info!(circle_id, "cleanup finished");
        result
    }

    async fn run_moves(
        &self,
        state: &Arc<CircleState>,
        circle: &Arc<Circle>,
        sources: Vec<SourceNode>,
        dbs: Vec<String>,
        min_ts: Option<i64>,
        delete_source: bool,
    ) -> Result<(), TransferError> {
        let batch = self.batch.load(Ordering::Relaxed);
        let limit = self.limit.load(Ordering::Relaxed);
        let moved = Arc::new(AtomicU64::new(0));
        let sem = Arc::new(Semaphore::new(self.worker.load(Ordering::Relaxed)));
        let mut tasks = JoinSet::new();

        for src in sources {
            let stats = state.stats_for(&src.url);
            let dbs = match self.databases_for(&src, &dbs).await {
                Ok(dbs) => dbs,
                Err(e) => {
                    warn!(url = %src.url, error = %e, "listing databases failed");
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            for db in dbs {
                let measurements = match src.client.show_measurements(&db).await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(url = %src.url, %db, error = %e, "listing measurements failed");
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                for meas in measurements {
                    let Some(dest) = circle.get_backend(&shard_key(&db, &meas)) else {
                        continue;
                    };
                    if dest.url() == src.url {
                        stats.inplace.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    stats.incorrect.fetch_add(1, Ordering::Relaxed);
                    if limit > 0 && moved.load(Ordering::Relaxed) >= limit {
                        debug!(%db, %meas, "row limit reached, skipping move");
                        continue;
                    }

                    let permit = Arc::clone(&sem)
                        .acquire_owned()
                        .await
                        .expect("transfer semaphore closed");
                    tasks.spawn(move_measurement(MoveJob {
                        permit,
                        src: Arc::clone(&src.client),
                        src_url: src.url.clone(),
                        dst: Arc::clone(dest.client()),
                        db: db.clone(),
                        meas,
                        batch,
                        min_ts,
                        moved: Arc::clone(&moved),
                        limit,
                        stats: Arc::clone(&stats),
                        delete_source,
                    }));
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn run_recovery(
        &self,
        state: &Arc<CircleState>,
        from: &Arc<Circle>,
        to: &Arc<Circle>,
        url_filter: HashSet<String>,
        dbs: Vec<String>,
    ) -> Result<(), TransferError> {
        let batch = self.batch.load(Ordering::Relaxed);
        let limit = self.limit.load(Ordering::Relaxed);
        let moved = Arc::new(AtomicU64::new(0));
        let sem = Arc::new(Semaphore::new(self.worker.load(Ordering::Relaxed)));
        let mut tasks = JoinSet::new();
        let mut seen = HashSet::new();

        for be in from.backends() {
            let src_node = SourceNode::from(be);
            let dbs = match self.databases_for(&src_node, &dbs).await {
                Ok(dbs) => dbs,
                Err(e) => {
                    warn!(url = %src_node.url, error = %e, "listing databases failed");
                    continue;
                }
            };
            for db in dbs {
                let measurements = match src_node.client.show_measurements(&db).await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(url = %src_node.url, %db, error = %e, "listing measurements failed");
                        continue;
                    }
                };
                for meas in measurements {
                    if !seen.insert((db.clone(), meas.clone())) {
                        continue;
                    }
                    let key = shard_key(&db, &meas);
                    let (Some(holder), Some(dest)) = (from.get_backend(&key), to.get_backend(&key))
                    else {
                        continue;
                    };
                    if !url_filter.is_empty() && !url_filter.contains(dest.url()) {
                        continue;
                    }
                    let stats = state.stats_for(dest.url());
                    stats.incorrect.fetch_add(1, Ordering::Relaxed);
                    if limit > 0 && moved.load(Ordering::Relaxed) >= limit {
                        continue;
                    }

                    let permit = Arc::clone(&sem)
                        .acquire_owned()
                        .await
                        .expect("transfer semaphore closed");
                    tasks.spawn(move_measurement(MoveJob {
                        permit,
                        src: Arc::clone(holder.client()),
                        src_url: holder.url().to_string(),
                        dst: Arc::clone(dest.client()),
                        db: db.clone(),
                        meas,
                        batch,
                        min_ts: None,
                        moved: Arc::clone(&moved),
                        limit,
                        stats,
                        delete_source: false,
                    }));
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn run_resync(
        &self,
        dbs: Vec<String>,
        min_ts: Option<i64>,
    ) -> Result<(), TransferError> {
        let circles = self.circles.read().clone();
        let batch = self.batch.load(Ordering::Relaxed);
        let limit = self.limit.load(Ordering::Relaxed);
        let moved = Arc::new(AtomicU64::new(0));
        let sem = Arc::new(Semaphore::new(self.worker.load(Ordering::Relaxed)));
        let mut tasks = JoinSet::new();

        for (ci, circle) in circles.iter().enumerate() {
            let Some(state) = self.circle_state(ci) else {
                continue;
            };
            state.reset_stats();
            for be in circle.backends() {
                let src_node = SourceNode::from(be);
                let stats = state.stats_for(&src_node.url);
                let dbs = match self.databases_for(&src_node, &dbs).await {
                    Ok(dbs) => dbs,
                    Err(e) => {
                        warn!(url = %src_node.url, error = %e, "listing databases failed");
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                for db in dbs {
                    let measurements = match src_node.client.show_measurements(&db).await {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(url = %src_node.url, %db, error = %e, "listing measurements failed");
                            stats.errors.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };
                    for meas in measurements {
                        let key = shard_key(&db, &meas);
                        for (oi, other) in circles.iter().enumerate() {
                            if oi == ci {
                                continue;
                            }
                            let Some(dest) = other.get_backend(&key) else {
                                continue;
                            };
                            if limit > 0 && moved.load(Ordering::Relaxed) >= limit {
                                continue;
                            }
                            let permit = Arc::clone(&sem)
                                .acquire_owned()
                                .await
                                .expect("transfer semaphore closed");
                            tasks.spawn(move_measurement(MoveJob {
                                permit,
                                src: Arc::clone(&src_node.client),
                                src_url: src_node.url.clone(),
                                dst: Arc::clone(dest.client()),
                                db: db.clone(),
                                meas: meas.clone(),
                                batch,
                                min_ts,
                                moved: Arc::clone(&moved),
                                limit,
                                stats: Arc::clone(&stats),
                                delete_source: false,
                            }));
                        }
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn run_cleanup(
        &self,
        state: &Arc<CircleState>,
        circle: &Arc<Circle>,
    ) -> Result<(), TransferError> {
        let sem = Arc::new(Semaphore::new(self.worker.load(Ordering::Relaxed)));
        let mut tasks = JoinSet::new();

        for be in circle.backends() {
            let src_node = SourceNode::from(be);
            let stats = state.stats_for(&src_node.url);
            let dbs = match self.databases_for(&src_node, &[]).await {
                Ok(dbs) => dbs,
                Err(e) => {
                    warn!(url = %src_node.url, error = %e, "listing databases failed");
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            for db in dbs {
                let measurements = match src_node.client.show_measurements(&db).await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(url = %src_node.url, %db, error = %e, "listing measurements failed");
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                for meas in measurements {
                    match circle.get_backend(&shard_key(&db, &meas)) {
                        Some(owner) if owner.url() == src_node.url => {
                            stats.inplace.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            stats.incorrect.fetch_add(1, Ordering::Relaxed);
                            let permit = Arc::clone(&sem)
                                .acquire_owned()
                                .await
                                .expect("transfer semaphore closed");
                            let client = Arc::clone(&src_node.client);
                            let url = src_node.url.clone();
                            let stats = Arc::clone(&stats);
                            let db = db.clone();
                            tasks.spawn(async move {
                                let _permit = permit;
                                match client.drop_measurement(&db, &meas).await {
                                    Ok(()) => {
                                        stats.transferred.fetch_add(1, Ordering::Relaxed);
                                    }
                                    Err(e) => {
                                        warn!(%url, %db, %meas, error = %e, "cleanup drop failed");
                                        stats.errors.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                            });
                        }
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Databases to scan: the request's list, or everything the source
    /// holds minus the internal database.
    async fn databases_for(
        &self,
        src: &SourceNode,
        requested: &[String],
    ) -> Result<Vec<String>, ClientError> {
        if !requested.is_empty() {
            return Ok(requested.to_vec());
        }
        Ok(src
            .client
            .show_databases()
            .await?
            .into_iter()
            .filter(|db| db != "_internal")
            .collect())
    }

    /// Mirror a circle's transferring flag to every HA peer, best effort.
    async fn broadcast_circle_state(&self, circle_id: usize, flag: bool) {
        let addrs = self.ha_addrs.read().clone();
        for addr in addrs {
            let url = format!("http://{addr}/transfer/state");
            let result = self
                .http
                .post(&url)
                .form(&[
                    ("circle_id", circle_id.to_string()),
                    ("transferring", flag.to_string()),
                ])
                .send()
                .await;
            if let Err(e) = result {
                warn!(%addr, error = %e, "failed to mirror transfer state to peer");
            }
        }
    }

    async fn broadcast_resyncing(&self, flag: bool) {
        let addrs = self.ha_addrs.read().clone();
        for addr in addrs {
            let url = format!("http://{addr}/transfer/state");
            let result = self
                .http
                .post(&url)
                .form(&[("resyncing", flag.to_string())])
                .send()
                .await;
            if let Err(e) = result {
                warn!(%addr, error = %e, "failed to mirror resync state to peer");
            }
        }
    }
}

struct MoveJob {
    permit: tokio::sync::OwnedSemaphorePermit,
    src: Arc<HttpClient>,
    src_url: String,
    dst: Arc<HttpClient>,
    db: String,
    meas: String,
    batch: usize,
    min_ts: Option<i64>,
    moved: Arc<AtomicU64>,
    limit: u64,
    stats: Arc<Stats>,
    delete_source: bool,
}

async fn move_measurement(job: MoveJob) {
    let MoveJob {
        permit,
        src,
        src_url,
        dst,
        db,
        meas,
        batch,
        min_ts,
        moved,
        limit,
        stats,
        delete_source,
    } = job;
    let _permit = permit;

    stats.inflight.fetch_add(1, Ordering::Relaxed);
    let result = stream::copy_series(&src, &dst, &db, &meas, batch, min_ts, &moved, limit).await;
    match result {
        Ok((rows, complete)) => {
            if complete {
                if delete_source {
                    match src.drop_measurement(&db, &meas).await {
                        Ok(()) => {
                            stats.transferred.fetch_add(1, Ordering::Relaxed);
                            debug!(%src_url, %db, %meas, rows, "measurement moved");
                        }
                        Err(e) => {
                            warn!(%src_url, %db, %meas, error = %e, "source delete failed");
                            stats.errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                } else {
                    stats.transferred.fetch_add(1, Ordering::Relaxed);
                    debug!(%src_url, %db, %meas, rows, "measurement copied");
                }
            }
        }
        Err(e) => {
            warn!(%src_url, %db, %meas, error = %e, "measurement copy failed");
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
    stats.inflight.fetch_sub(1, Ordering::Relaxed);
}
