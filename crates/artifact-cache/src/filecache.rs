use std::fs::DirBuilder;
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use weighted_lru::WeightedLruCache;

use crate::config::FileCacheConfig;
use crate::entry::{CacheEntry, FileState};
use crate::error::CacheError;
use crate::evict::remove_evicted_file;
use crate::pubsub::Subscription;
use crate::writer::FileWriter;

/// Suffix of in-progress population files. Orphaned tmp files (left behind by a
/// crash) are deleted by the startup scan.
pub const TMP_SUFFIX: &str = ".tmp";

type EntryCache = WeightedLruCache<PathBuf, CacheEntry>;

/// An on-disk cache of large downloaded artifacts under a byte-capacity budget.
///
/// [`acquire`](Self::acquire) turns a `(name, size)` pair into an
/// [`AcquiredFileReference`] pinning the entry. The caller that observes
/// `inserted = true` is the designated populator and drives
/// [`open`](AcquiredFileReference::open) / [`write_at`](FileWriter::write_at) /
/// [`finish`](FileWriter::finish); everyone else can block on
/// [`wait_stored`](AcquiredFileReference::wait_stored) to observe that writer's
/// progress. Every reference must be closed exactly once.
///
/// Completed artifacts live at `<cache_dir>/<name>`, in-progress writes at
/// `<cache_dir>/<name>.tmp`. A single `FileCache` instance owns its directory; no
/// cross-process coordination is attempted.
pub struct FileCache {
    cache_dir: PathBuf,
    cache: Arc<EntryCache>,
}

impl FileCache {
    /// Creates the cache directory (mode `0700`) if needed and recovers its contents.
    ///
    /// Recovery deletes orphaned `*.tmp` files and re-registers every remaining
    /// regular file as an unpinned, already-stored entry with its on-disk size, so a
    /// process restart neither loses capacity accounting nor re-downloads what it
    /// already has.
    pub fn new(config: &FileCacheConfig) -> anyhow::Result<Self> {
        let cache_dir = config.cache_dir.clone();

        let mut builder = DirBuilder::new();
        builder.mode(0o700);
        match builder.create(&cache_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to create cache directory {}", cache_dir.display())
                });
            }
        }

        let max_size = config.max_size_bytes()?;
        let max_items = NonZeroUsize::new(config.max_items as usize)
            .context("max_items must be non-zero")?;

        let cache = Arc::new(EntryCache::new(
            max_size,
            max_items,
            |_path: &PathBuf, entry: &Arc<CacheEntry>| remove_evicted_file(entry),
        ));

        let file_cache = Self { cache_dir, cache };
        file_cache
            .init_cache_dir()
            .context("failed to recover cache directory")?;

        Ok(file_cache)
    }

    /// Pins the entry for `entry_name`, creating it if absent.
    ///
    /// The returned flag is `true` iff this call inserted the entry, which makes the
    /// caller the designated populator. An existing entry acquired with a different
    /// declared size is rejected with [`CacheError::DifferentSizePerKey`]; the
    /// just-taken reference is unwound so nothing leaks.
    pub fn acquire(
        &self,
        entry_name: &str,
        size: u64,
    ) -> Result<(AcquiredFileReference, bool), CacheError> {
        if entry_name.is_empty() {
            return Err(CacheError::EmptyEntry);
        }

        let full_path = self.cache_dir.join(entry_name);
        let acquired = self.cache.acquire(full_path.clone(), size, || {
            CacheEntry::new(full_path.clone(), size, FileState::Absent)
        })?;

        let entry = acquired.value;
        if entry.size() != size {
            self.cache.release_try_purge(&full_path);
            return Err(CacheError::DifferentSizePerKey);
        }

        let subscription = entry.subscribe();
        let reference = AcquiredFileReference {
            entry,
            subscription,
            cache: Arc::clone(&self.cache),
            released: false,
        };
        Ok((reference, acquired.inserted))
    }

    /// The root directory owned by this cache.
    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Forcibly evicts every released entry, removing its file.
    pub fn evict_released(&self) {
        self.cache.purge_released();
    }

    fn init_cache_dir(&self) -> anyhow::Result<()> {
        for dirent in std::fs::read_dir(&self.cache_dir)? {
            let dirent = dirent?;
            let metadata = dirent.metadata()?;
            if !metadata.is_file() {
                continue;
            }

            let full_path = dirent.path();
            if dirent.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
                if let Err(err) = std::fs::remove_file(&full_path) {
                    tracing::error!(
                        path = %full_path.display(),
                        error = %err,
                        "failed to delete orphaned tmp file on startup"
                    );
                }
                continue;
            }

            let size = metadata.len();
            self.cache
                .add(full_path.clone(), size, || {
                    CacheEntry::new(full_path.clone(), size, FileState::Stored)
                })
                .with_context(|| {
                    format!(
                        "failed to register recovered cache file {}",
                        full_path.display()
                    )
                })?;
        }

        Ok(())
    }
}

/// One pinned reference to a cache entry.
///
/// Obtained from [`FileCache::acquire`] and valid until [`close`](Self::close), which
/// must be called exactly once. Dropping an unclosed reference releases it as a
/// safety net (with a warning), so a panicking task cannot pin capacity forever.
pub struct AcquiredFileReference {
    entry: Arc<CacheEntry>,
    subscription: Subscription<FileState>,
    cache: Arc<EntryCache>,
    released: bool,
}

impl AcquiredFileReference {
    /// Returns the entry's single writer, creating it on first use.
    ///
    /// Every holder of a reference for this key gets the same writer back. Fails with
    /// [`CacheError::NotAbsent`] if the entry is already populated (or failed), e.g.
    /// for entries recovered from disk.
    pub async fn open(&self) -> Result<Arc<FileWriter>, CacheError> {
        if self.released {
            return Err(CacheError::AlreadyReleased);
        }
        CacheEntry::open_writer(&self.entry).await
    }

    /// The final on-disk path of this entry.
    pub fn path(&self) -> &Path {
        self.entry.final_path()
    }

    /// The size declared when the entry was acquired.
    pub fn size(&self) -> u64 {
        self.entry.size()
    }

    /// The entry's current population state.
    pub fn state(&self) -> FileState {
        self.entry.state()
    }

    /// Blocks until the entry is fully stored.
    ///
    /// Returns immediately when the entry is already in a terminal state; otherwise
    /// suspends on the state subscription until the writer commits (`Ok`) or fails
    /// ([`CacheError::WriteFailed`]). This is the subsystem's only suspension point;
    /// it is cancel-safe, so callers impose deadlines by dropping the future, e.g.
    /// via [`tokio::time::timeout`].
    pub async fn wait_stored(&mut self) -> Result<(), CacheError> {
        if self.released {
            return Err(CacheError::AlreadyReleased);
        }

        match self.entry.state() {
            FileState::Stored => return Ok(()),
            FileState::WriteFailed => return Err(CacheError::WriteFailed),
            FileState::Absent | FileState::Opened => {}
        }

        loop {
            match self.subscription.recv().await {
                Some(FileState::Stored) => return Ok(()),
                Some(FileState::WriteFailed) => return Err(CacheError::WriteFailed),
                Some(_) => continue,
                None => return Err(CacheError::SubscriptionClosed),
            }
        }
    }

    /// Releases this reference. Must be called exactly once; later uses of the
    /// reference fail with [`CacheError::AlreadyReleased`].
    ///
    /// A not-fully-stored entry is purged once its last reference goes away, so
    /// half-written or broken files never linger.
    pub fn close(&mut self) -> Result<(), CacheError> {
        if self.released {
            return Err(CacheError::AlreadyReleased);
        }
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        self.released = true;
        self.subscription.close();

        if self.entry.state() == FileState::Stored {
            self.cache.release(self.entry.final_path());
        } else {
            self.cache.release_try_purge(self.entry.final_path());
        }
    }
}

impl std::fmt::Debug for AcquiredFileReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredFileReference")
            .field("path", &self.entry.final_path())
            .field("size", &self.entry.size())
            .field("state", &self.entry.state())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for AcquiredFileReference {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                path = %self.entry.final_path().display(),
                "acquired file reference dropped without being closed"
            );
            self.release();
        }
    }
}
