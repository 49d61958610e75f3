//! # FileQueue
//!
//! A single-producer single-consumer byte-record queue persisted to one
//! regular file with a sidecar meta file, used as the per-backend overflow
//! for write batches that could not be delivered online.
//!
//! Records are delivered at least once, in FIFO order. `read` peeks at the
//! committed cursor; `update_meta` commits past the last read and
//! `rollback_meta` re-exposes it. File I/O happens on a dedicated blocking
//! task owned by the queue, so the async surface never stalls an executor
//! thread and every operation is serialized.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use bytes::Bytes;
use parking_lot::Mutex;
use snafu::OptionExt;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

mod blocking;
mod error;

pub use error::{Error, Result};

use error::QueueClosedSnafu;

#[derive(Debug)]
enum Request {
    Write(oneshot::Sender<Result<()>>, Vec<u8>),
    Read(oneshot::Sender<Result<Option<Bytes>>>),
    UpdateMeta(oneshot::Sender<Result<()>>),
    RollbackMeta(oneshot::Sender<Result<()>>),
    IsData(oneshot::Sender<bool>),
}

/// Handle to one on-disk queue rooted at a directory.
///
/// A directory must have exactly one logical owner; opening two queues over
/// the same path is not supported.
#[derive(Debug)]
pub struct FileQueue {
    tx: Mutex<Option<mpsc::Sender<Request>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FileQueue {
    /// Open (or create) the queue under `dir` and start its I/O task.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let queue = tokio::task::spawn_blocking(move || blocking::Queue::open(&dir))
            .await
            .ok()
            .context(QueueClosedSnafu)??;

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::task::spawn_blocking(move || task_main(rx, queue));

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Append one record. Errors here are fatal to the queue.
    pub async fn write(&self, record: Vec<u8>) -> Result<()> {
        self.one_command(|tx| Request::Write(tx, record)).await?
    }

    /// Return the record at the read cursor, or `None` when drained.
    /// Subsequent calls return the same record until [`Self::update_meta`].
    pub async fn read(&self) -> Result<Option<Bytes>> {
        self.one_command(Request::Read).await?
    }

    /// Commit the cursor past the last read.
    pub async fn update_meta(&self) -> Result<()> {
        self.one_command(Request::UpdateMeta).await?
    }

    /// Re-expose the last read record for a later retry.
    pub async fn rollback_meta(&self) -> Result<()> {
        self.one_command(Request::RollbackMeta).await?
    }

    /// True iff the committed read offset is behind the write offset.
    pub async fn is_data(&self) -> bool {
        self.one_command(Request::IsData).await.unwrap_or(false)
    }

    /// Flush and release both files. Further operations fail with
    /// [`Error::QueueClosed`].
    pub async fn close(&self) {
        self.tx.lock().take();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn one_command<R>(&self, req: impl FnOnce(oneshot::Sender<R>) -> Request) -> Result<R> {
        let tx = self.tx.lock().clone().context(QueueClosedSnafu)?;
        let (req_tx, req_rx) = oneshot::channel();
        tx.send(req(req_tx)).await.ok().context(QueueClosedSnafu)?;
        req_rx.await.ok().context(QueueClosedSnafu)
    }
}

fn task_main(mut rx: mpsc::Receiver<Request>, mut queue: blocking::Queue) {
    while let Some(req) = rx.blocking_recv() {
        // Send failures mean the caller gave up waiting; the operation has
        // already happened either way.
        match req {
            Request::Write(tx, payload) => {
                tx.send(queue.write(&payload)).ok();
            }
            Request::Read(tx) => {
                tx.send(queue.read().map(|r| r.map(Bytes::from))).ok();
            }
            Request::UpdateMeta(tx) => {
                tx.send(queue.update_meta()).ok();
            }
            Request::RollbackMeta(tx) => {
                tx.send(queue.rollback_meta()).ok();
            }
            Request::IsData(tx) => {
                tx.send(queue.is_data()).ok();
            }
        }
    }
    if let Err(e) = queue.close() {
        error!(error = %e, "failed to close queue files");
    }
}
