//! Per-node write engine.
//!
//! Each physical backend gets one [`Backend`]: a bounded ingress channel, a
//! single worker task that owns the per-database buffers, a semaphore-bounded
//! pool for outbound HTTP batches, an on-disk overflow queue for batches that
//! could not be delivered, and a rewrite loop that drains the queue once the
//! node is reachable again.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use bytes::{BufMut, Bytes, BytesMut};
use data_types::{BackendConfig, LinePoint, ProxyConfig};
use file_queue::FileQueue;
use flate2::{write::GzEncoder, Compression};
use parking_lot::Mutex;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use std::{
    collections::HashMap,
    io::Write as _,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, Semaphore},
    task::{JoinHandle, JoinSet},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};

mod http_client;
pub use http_client::{ClientError, HttpClient, Series, WriteOutcome};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend is closed")]
    Closed,

    #[error("backend halted after overflow queue failure")]
    Halted,

    #[error("overflow queue error: {0}")]
    Queue(#[from] file_queue::Error),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Percent-escape a database name for embedding in a queue record, which
/// uses a single space as the field separator.
pub fn escape_db(db: &str) -> String {
    utf8_percent_encode(db, NON_ALPHANUMERIC).to_string()
}

fn unescape_db(escaped: &str) -> Option<String> {
    percent_decode_str(escaped)
        .decode_utf8()
        .ok()
        .map(|c| c.into_owned())
}

/// Gzip one line-protocol batch the way it goes over the wire.
pub fn compress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(payload)?;
    enc.finish()
}

#[derive(Debug, Default)]
struct CacheBuffer {
    bytes: BytesMut,
    counter: usize,
}

/// One backend node of one replica group.
#[derive(Debug)]
pub struct Backend {
    name: String,
    url: String,
    client: Arc<HttpClient>,
    queue: Arc<FileQueue>,
    active: Arc<AtomicBool>,
    rewrite_running: Arc<AtomicBool>,
    halted: Arc<AtomicBool>,
    tx: Mutex<Option<mpsc::Sender<LinePoint>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    prober: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Backend {
    /// Open the backend: overflow queue, worker task and liveness prober.
    pub async fn open(cfg: &BackendConfig, px: &ProxyConfig) -> Result<Arc<Self>, BackendError> {
        let client = Arc::new(HttpClient::new(cfg, Duration::from_secs(px.write_timeout))?);
        let queue = Arc::new(FileQueue::open(Path::new(&px.data_dir).join(&cfg.name)).await?);
        let active = Arc::new(AtomicBool::new(true));
        let rewrite_running = Arc::new(AtomicBool::new(false));
        let halted = Arc::new(AtomicBool::new(false));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(16);

        let worker = Worker {
            url: cfg.url.clone(),
            rx,
            buffers: HashMap::new(),
            client: Arc::clone(&client),
            queue: Arc::clone(&queue),
            active: Arc::clone(&active),
            rewrite_running: Arc::clone(&rewrite_running),
            halted: Arc::clone(&halted),
            pool: Arc::new(Semaphore::new(px.conn_pool_size)),
            tasks: JoinSet::new(),
            rewrite_task: None,
            flush_size: px.flush_size,
            flush_time: Duration::from_secs(px.flush_time),
            rewrite_interval: Duration::from_secs(px.rewrite_interval),
            flush_at: None,
            shutdown_rx: shutdown_rx.clone(),
        };
        let worker = tokio::spawn(worker.run());
        let prober = tokio::spawn(probe_loop(
            Arc::clone(&client),
            Arc::clone(&active),
            Duration::from_secs(px.check_interval),
            cfg.url.clone(),
            shutdown_rx,
        ));

        Ok(Arc::new(Self {
            name: cfg.name.clone(),
            url: cfg.url.clone(),
            client,
            queue,
            active,
            rewrite_running,
            halted,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            prober: Mutex::new(Some(prober)),
            shutdown,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn client(&self) -> &Arc<HttpClient> {
        &self.client
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Force the active flag; normally only the prober writes it.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn rewrite_running(&self) -> bool {
        self.rewrite_running.load(Ordering::Relaxed)
    }

    /// True once the overflow queue has failed fatally (corruption or a
    /// write error). A halted backend refuses further points; only a
    /// restart with a repaired data directory clears it.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    /// True iff the overflow queue still holds undelivered batches.
    pub async fn has_backlog(&self) -> bool {
        self.queue.is_data().await
    }

    /// Enqueue one point. Blocks when the ingress channel is full, which is
    /// the backpressure the proxy's write handler relies on.
    pub async fn write_point(&self, point: LinePoint) -> Result<(), BackendError> {
        if self.is_halted() {
            return Err(BackendError::Halted);
        }
        let tx = self.tx.lock().clone().ok_or(BackendError::Closed)?;
        tx.send(point).await.map_err(|_| BackendError::Closed)
    }

    /// Drain and release the backend: flush buffers, wait for in-flight
    /// batches, stop the rewrite loop and prober, close the queue files.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        let prober = self.prober.lock().take();
        if let Some(prober) = prober {
            let _ = prober.await;
        }
    }
}

struct Worker {
    url: String,
    rx: mpsc::Receiver<LinePoint>,
    buffers: HashMap<String, CacheBuffer>,
    client: Arc<HttpClient>,
    queue: Arc<FileQueue>,
    active: Arc<AtomicBool>,
    rewrite_running: Arc<AtomicBool>,
    halted: Arc<AtomicBool>,
    pool: Arc<Semaphore>,
    tasks: JoinSet<()>,
    rewrite_task: Option<JoinHandle<()>>,
    flush_size: usize,
    flush_time: Duration,
    rewrite_interval: Duration,
    flush_at: Option<Instant>,
    shutdown_rx: watch::Receiver<bool>,
}

enum Event {
    Point(LinePoint),
    Closed,
    FlushTimer,
    RewriteTick,
}

impl Worker {
    async fn run(mut self) {
        // First tick after one full interval, like a Go ticker.
        let mut rewrite_tick =
            time::interval_at(Instant::now() + self.rewrite_interval, self.rewrite_interval);
        rewrite_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Reap finished pool tasks so the set does not grow unbounded.
            while self.tasks.try_join_next().is_some() {}

            let flush_at = self.flush_at;
            let event = tokio::select! {
                point = self.rx.recv() => point.map(Event::Point).unwrap_or(Event::Closed),
                _ = time::sleep_until(flush_at.unwrap_or_else(Instant::now)),
                    if flush_at.is_some() => Event::FlushTimer,
                _ = rewrite_tick.tick() => Event::RewriteTick,
            };

            match event {
                Event::Point(point) => self.write_buffer(point).await,
                Event::FlushTimer => {
                    self.flush_at = None;
                    self.flush_all().await;
                }
                Event::RewriteTick => self.rewrite_idle().await,
                Event::Closed => break,
            }
        }

        // Channel closed: flush what is buffered, wait for the pool, stop
        // the rewrite loop, then release the queue files.
        self.flush_all().await;
        while self.tasks.join_next().await.is_some() {}
        if let Some(rewrite) = self.rewrite_task.take() {
            let _ = rewrite.await;
        }
        self.queue.close().await;
    }

    async fn write_buffer(&mut self, point: LinePoint) {
        let db = point.db;
        let buffer = self.buffers.entry(db.clone()).or_default();
        buffer.bytes.extend_from_slice(&point.line);
        if !point.line.ends_with(b"\n") {
            buffer.bytes.put_u8(b'\n');
        }
        buffer.counter += 1;

        if buffer.counter >= self.flush_size {
            self.flush_buffer(&db).await;
        } else if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.flush_time);
        }
    }

    async fn flush_all(&mut self) {
        self.flush_at = None;
        let dbs: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.counter > 0)
            .map(|(db, _)| db.clone())
            .collect();
        for db in dbs {
            self.flush_buffer(&db).await;
        }
    }

    async fn flush_buffer(&mut self, db: &str) {
        // Detach bytes and counter as one unit; points arriving while the
        // pool task runs allocate a fresh buffer.
        let Some(buffer) = self.buffers.remove(db) else {
            return;
        };
        if buffer.counter == 0 || buffer.bytes.is_empty() {
            return;
        }
        let payload = buffer.bytes.freeze();

        let permit = Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .expect("backend pool semaphore closed");
        let client = Arc::clone(&self.client);
        let queue = Arc::clone(&self.queue);
        let active = Arc::clone(&self.active);
        let halted = Arc::clone(&self.halted);
        let url = self.url.clone();
        let db = db.to_string();

        self.tasks.spawn(async move {
            let _permit = permit;
            deliver_batch(&url, &client, &queue, &active, &halted, &db, payload).await;
        });
    }

    async fn rewrite_idle(&mut self) {
        if self.rewrite_running.load(Ordering::Relaxed) || self.halted.load(Ordering::Relaxed) {
            return;
        }
        if !self.queue.is_data().await {
            return;
        }
        self.rewrite_running.store(true, Ordering::Relaxed);
        self.rewrite_task = Some(tokio::spawn(rewrite_loop(
            self.url.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.queue),
            Arc::clone(&self.active),
            Arc::clone(&self.rewrite_running),
            Arc::clone(&self.halted),
            self.rewrite_interval,
            self.shutdown_rx.clone(),
        )));
    }
}

/// Compress and deliver one batch, spilling to the queue on transient
/// failure or when the backend is marked inactive. A queue write failure
/// halts the backend: the overflow file can no longer be trusted.
async fn deliver_batch(
    url: &str,
    client: &HttpClient,
    queue: &FileQueue,
    active: &AtomicBool,
    halted: &AtomicBool,
    db: &str,
    payload: Bytes,
) {
    let compressed = match compress(&payload) {
        Ok(c) => c,
        Err(e) => {
            error!(%url, %db, error = %e, "compress batch failed, dropping");
            return;
        }
    };

    if active.load(Ordering::Relaxed) {
        match client.write_compressed(db, "", compressed.clone()).await {
            WriteOutcome::Accepted => return,
            WriteOutcome::BadRequest => {
                warn!(%url, %db, "bad request, dropping batch");
                return;
            }
            WriteOutcome::NotFound => {
                warn!(%url, %db, "backend reports not found, dropping batch");
                return;
            }
            WriteOutcome::Transient => {
                warn!(%url, %db, bytes = compressed.len(), "write failed, spilling batch to queue");
            }
        }
    }

    let escaped = escape_db(db);
    let mut record = Vec::with_capacity(escaped.len() + 1 + compressed.len());
    record.extend_from_slice(escaped.as_bytes());
    record.push(b' ');
    record.extend_from_slice(&compressed);
    if let Err(e) = queue.write(record).await {
        if e.is_fatal() {
            halted.store(true, Ordering::Relaxed);
            error!(%url, %db, error = %e, "queue write failed, batch lost, halting backend");
        } else {
            error!(%url, %db, error = %e, "queue write failed, batch lost");
        }
    }
}

enum RewriteStep {
    Wrote,
    Drained,
    Retry,
    Fatal,
}

async fn rewrite_loop(
    url: String,
    client: Arc<HttpClient>,
    queue: Arc<FileQueue>,
    active: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    halted: Arc<AtomicBool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        if !queue.is_data().await {
            break;
        }
        if !active.load(Ordering::Relaxed) {
            if wait_or_shutdown(interval, &mut shutdown).await {
                break;
            }
            continue;
        }
        match rewrite_one(&url, &client, &queue).await {
            RewriteStep::Wrote => {}
            RewriteStep::Drained => break,
            RewriteStep::Retry => {
                if wait_or_shutdown(interval, &mut shutdown).await {
                    break;
                }
            }
            RewriteStep::Fatal => {
                halted.store(true, Ordering::Relaxed);
                error!(%url, "overflow queue corrupted, halting backend");
                break;
            }
        }
    }
    running.store(false, Ordering::Relaxed);
}

async fn rewrite_one(url: &str, client: &HttpClient, queue: &FileQueue) -> RewriteStep {
    let record = match queue.read().await {
        Ok(Some(record)) => record,
        Ok(None) => return RewriteStep::Drained,
        Err(e) if e.is_fatal() => {
            error!(%url, error = %e, "queue read hit corruption");
            return RewriteStep::Fatal;
        }
        Err(e) => {
            error!(%url, error = %e, "queue read failed");
            return RewriteStep::Retry;
        }
    };

    let Some(split) = record.iter().position(|&c| c == b' ') else {
        warn!(%url, "dropping malformed queue record without separator");
        commit(url, queue).await;
        return RewriteStep::Wrote;
    };
    let db = std::str::from_utf8(&record[..split])
        .ok()
        .and_then(unescape_db);
    let Some(db) = db else {
        warn!(%url, "dropping queue record with undecodable database");
        commit(url, queue).await;
        return RewriteStep::Wrote;
    };
    let payload = record[split + 1..].to_vec();

    match client.write_compressed(&db, "", payload).await {
        WriteOutcome::Accepted => {
            commit(url, queue).await;
            RewriteStep::Wrote
        }
        WriteOutcome::BadRequest => {
            warn!(%url, %db, "bad request, dropping queued batch");
            commit(url, queue).await;
            RewriteStep::Wrote
        }
        WriteOutcome::NotFound => {
            warn!(%url, %db, "backend reports not found, dropping queued batch");
            commit(url, queue).await;
            RewriteStep::Wrote
        }
        WriteOutcome::Transient => {
            if let Err(e) = queue.rollback_meta().await {
                error!(%url, error = %e, "rollback meta failed");
            }
            RewriteStep::Retry
        }
    }
}

async fn commit(url: &str, queue: &FileQueue) {
    if let Err(e) = queue.update_meta().await {
        error!(%url, error = %e, "update meta failed");
    }
}

/// Sleep for `d`, returning early (and `true`) when shutdown is signalled.
async fn wait_or_shutdown(d: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = time::sleep(d) => *shutdown.borrow(),
        _ = shutdown.changed() => true,
    }
}

async fn probe_loop(
    client: Arc<HttpClient>,
    active: Arc<AtomicBool>,
    interval: Duration,
    url: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = time::interval_at(Instant::now() + interval, interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let ok = client.ping().await;
                let was = active.swap(ok, Ordering::Relaxed);
                if was != ok {
                    info!(%url, active = ok, "backend state changed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
