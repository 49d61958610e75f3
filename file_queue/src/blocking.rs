//! Synchronous file operations backing the queue. All calls run on the
//! queue's dedicated blocking task, so this module never sees concurrent
//! access.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use snafu::{ensure, ResultExt};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::error::*;

/// Name of the record file inside a queue directory.
const DATA_FILE: &str = "data";
/// Name of the sidecar cursor file.
const META_FILE: &str = "data.meta";

/// The on-disk queue: one append-only data file plus a sidecar meta file
/// holding the committed read offset and the write offset as two
/// little-endian `u64`s. Records are framed as a little-endian `u32` length
/// followed by the payload.
#[derive(Debug)]
pub(crate) struct Queue {
    data: File,
    data_path: PathBuf,
    meta_path: PathBuf,

    /// Persisted read offset; `read` always re-reads the record here until
    /// a commit moves it.
    committed: u64,
    /// End of the last fully appended record.
    write_offset: u64,
    /// Frame length (header + payload) of the record returned by the last
    /// uncommitted `read`.
    pending: Option<u64>,
}

impl Queue {
    pub(crate) fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).context(UnableToCreateDirSnafu { path: dir })?;

        let data_path = dir.join(DATA_FILE);
        let meta_path = dir.join(META_FILE);

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)
            .context(UnableToOpenDataSnafu { path: &data_path })?;

        let write_offset = data
            .metadata()
            .context(UnableToOpenDataSnafu { path: &data_path })?
            .len();

        let committed = match read_meta(&meta_path)? {
            // A cursor past the end of the data file means the meta outlived
            // a truncation; restart from the beginning.
            Some((read, _)) if read <= write_offset => read,
            _ => 0,
        };

        Ok(Self {
            data,
            data_path,
            meta_path,
            committed,
            write_offset,
            pending: None,
        })
    }

    /// Append one framed record and make it durable.
    pub(crate) fn write(&mut self, payload: &[u8]) -> Result<()> {
        self.data
            .seek(SeekFrom::Start(self.write_offset))
            .context(UnableToSeekSnafu)?;
        self.data
            .write_u32::<LittleEndian>(payload.len() as u32)
            .context(UnableToWriteLengthSnafu)?;
        self.data
            .write_all(payload)
            .context(UnableToWriteDataSnafu)?;
        self.data.sync_data().context(UnableToSyncSnafu)?;

        // The record becomes visible to readers only once the offset moves.
        self.write_offset += 4 + payload.len() as u64;
        Ok(())
    }

    /// Return the record at the committed read offset without advancing.
    /// Repeated calls return the same bytes until `update_meta`.
    pub(crate) fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.is_data() {
            return Ok(None);
        }
        self.data
            .seek(SeekFrom::Start(self.committed))
            .context(UnableToSeekSnafu)?;
        let len = self
            .data
            .read_u32::<LittleEndian>()
            .context(UnableToReadLengthSnafu)? as u64;
        ensure!(
            self.committed + 4 + len <= self.write_offset,
            TruncatedRecordSnafu {
                offset: self.committed
            }
        );

        let mut payload = vec![0; len as usize];
        self.data
            .read_exact(&mut payload)
            .context(UnableToReadDataSnafu)?;
        self.pending = Some(4 + len);
        Ok(Some(payload))
    }

    /// Advance the persisted read offset past the last `read`. Truncates
    /// both files once everything written has been consumed.
    pub(crate) fn update_meta(&mut self) -> Result<()> {
        if let Some(frame) = self.pending.take() {
            self.committed += frame;
        }
        if self.committed >= self.write_offset {
            self.data.set_len(0).context(UnableToTruncateSnafu)?;
            self.data.sync_data().context(UnableToSyncSnafu)?;
            self.committed = 0;
            self.write_offset = 0;
        }
        self.persist_meta()
    }

    /// Forget the pending read so the same record is served again.
    pub(crate) fn rollback_meta(&mut self) -> Result<()> {
        self.pending = None;
        self.persist_meta()
    }

    pub(crate) fn is_data(&self) -> bool {
        self.committed < self.write_offset
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        self.data.sync_data().context(UnableToSyncSnafu)?;
        self.persist_meta()
    }

    fn persist_meta(&self) -> Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.meta_path)
            .context(UnableToWriteMetaSnafu {
                path: &self.meta_path,
            })?;
        f.write_u64::<LittleEndian>(self.committed)
            .context(UnableToWriteMetaSnafu {
                path: &self.meta_path,
            })?;
        f.write_u64::<LittleEndian>(self.write_offset)
            .context(UnableToWriteMetaSnafu {
                path: &self.meta_path,
            })?;
        f.sync_data().context(UnableToSyncSnafu)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn data_path(&self) -> &Path {
        &self.data_path
    }
}

fn read_meta(path: &Path) -> Result<Option<(u64, u64)>> {
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(UnableToReadMetaSnafu { path }),
    };
    let read = f
        .read_u64::<LittleEndian>()
        .context(UnableToReadMetaSnafu { path })?;
    let write = f
        .read_u64::<LittleEndian>()
        .context(UnableToReadMetaSnafu { path })?;
    Ok(Some((read, write)))
}
