use std::io;
use std::path::PathBuf;

use thiserror::Error;
use weighted_lru::CapacityError;

/// Errors surfaced by the file cache.
///
/// The variants are cheap to clone so that a single population outcome (for example a
/// failed [`finish`](crate::FileWriter::finish)) can be handed to every concurrent
/// waiter. Underlying [`io::Error`]s are therefore preserved as messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The entry name passed to [`acquire`](crate::FileCache::acquire) was empty.
    #[error("cache entry name is empty")]
    EmptyEntry,

    /// A second acquire for an existing key declared a different size than the first.
    #[error("entry was already acquired with a different size")]
    DifferentSizePerKey,

    /// An [`AcquiredFileReference`](crate::AcquiredFileReference) was used after
    /// [`close`](crate::AcquiredFileReference::close).
    #[error("acquired file reference was already released")]
    AlreadyReleased,

    /// The entry's population attempt failed; observed by waiters of
    /// [`wait_stored`](crate::AcquiredFileReference::wait_stored).
    #[error("failed to write file")]
    WriteFailed,

    /// The file state subscription was torn down while waiting on it.
    #[error("file state subscription was closed")]
    SubscriptionClosed,

    /// A writer was requested for an entry that is not in the absent state, for
    /// example one recovered from disk as already stored.
    #[error("file is not absent, refusing to open a writer")]
    NotAbsent,

    /// Bytes written do not match the declared size, either up front for an
    /// out-of-bounds write or at commit time.
    #[error(
        "size mismatch for {}: {written} written vs {expected} expected",
        path.display()
    )]
    SizeMismatch {
        /// The file being populated.
        path: PathBuf,
        /// Bytes the writer would have covered, or had covered at commit time.
        written: u64,
        /// The size declared at acquire time.
        expected: u64,
    },

    /// The weighted LRU could not make room for the entry.
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// An I/O failure while creating, writing, or committing the backing file.
    #[error("{0}")]
    Io(String),
}

impl CacheError {
    /// Wraps an [`io::Error`] with context, keeping the variant cloneable.
    pub(crate) fn io(context: impl std::fmt::Display, err: io::Error) -> Self {
        Self::Io(format!("{context}: {err}"))
    }
}
