use std::path::PathBuf;

use thiserror::Error;

use crate::store::RootId;

/// Errors raised by the image index store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite error.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// A batch could not be committed.
    #[error(transparent)]
    Commit(#[from] StoreCommitError),

    /// The referenced root does not exist.
    #[error("unknown root {0}")]
    UnknownRoot(RootId),

    /// Paths are stored as text; non UTF-8 paths are rejected.
    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    /// Filesystem error while preparing the database location.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A batch flush failed. Records committed by earlier batches are intact.
#[derive(Debug, Error)]
#[error("failed to commit batch of {pending} upserts: {source}")]
pub struct StoreCommitError {
    pub pending: usize,
    #[source]
    pub source: rusqlite::Error,
}

/// A directory that could not be traversed. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("skipped {}: {detail}", path.display())]
pub struct CrawlSubtreeError {
    pub path: PathBuf,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum CrawlError {
    /// Another crawl already holds one of the requested roots.
    #[error("a crawl is already running for root(s) {0:?}")]
    AlreadyRunning(Vec<RootId>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-frame decode failure. The slot is marked failed and the session continues.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to scale {}: {detail}", path.display())]
    Scale { path: PathBuf, detail: String },

    /// The sequence index could not be mapped to a path.
    #[error("no image for sequence index {index}: {detail}")]
    Unresolved { index: usize, detail: String },

    #[error("decoder aborted on sequence index {index}")]
    Aborted { index: usize },
}

/// Errors reported by render backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// External process death, lost GPU context: ends the session.
    #[error("render backend failed: {0}")]
    Fatal(String),

    /// A single frame could not be shown; the backend keeps running.
    #[error("frame not shown: {0}")]
    Frame(String),
}

impl BackendError {
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("render backend did not report ready within {0:?}")]
    BackendTimeout(std::time::Duration),
}
