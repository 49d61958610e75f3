use snafu::Snafu;
use std::{io, path::PathBuf};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    UnableToCreateDir { source: io::Error, path: PathBuf },

    UnableToOpenData { source: io::Error, path: PathBuf },

    UnableToReadMeta { source: io::Error, path: PathBuf },

    UnableToWriteMeta { source: io::Error, path: PathBuf },

    UnableToSeek { source: io::Error },

    UnableToWriteLength { source: io::Error },

    UnableToWriteData { source: io::Error },

    UnableToSync { source: io::Error },

    UnableToReadLength { source: io::Error },

    UnableToReadData { source: io::Error },

    UnableToTruncate { source: io::Error },

    #[snafu(display("record at offset {offset} extends past the write offset"))]
    TruncatedRecord { offset: u64 },

    #[snafu(display("queue is closed"))]
    QueueClosed,
}

impl Error {
    /// True for corruption or write-side failures that must halt the
    /// queue's owner. Read errors stay transient (the cursor is untouched
    /// and the record can be retried), and a closed queue is a lifecycle
    /// state, not a failure.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::UnableToReadLength { .. }
                | Self::UnableToReadData { .. }
                | Self::UnableToReadMeta { .. }
                | Self::QueueClosed
        )
    }
}

/// A specialized `Result` for queue errors
pub type Result<T, E = Error> = std::result::Result<T, E>;
