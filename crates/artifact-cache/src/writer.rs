use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::OnceCell;

use crate::entry::{CacheEntry, FileState};
use crate::error::CacheError;

/// The single object permitted to populate one cache entry's bytes.
///
/// Exactly one `FileWriter` is ever constructed per entry, by whichever caller won the
/// claim inside [`open`](crate::AcquiredFileReference::open); all other holders of a
/// reference to the same entry get a shared handle to that same writer.
///
/// Writes are positioned and thread-safe with the writer itself, so a populator may
/// fan the download out into out-of-order or overlapping chunks. Only the high-water
/// mark (the largest `offset + len` written so far) is tracked, not a running total,
/// which tolerates retried and overlapping ranges.
#[derive(Debug)]
pub struct FileWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    declared_size: u64,
    /// Highest `offset + len` successfully written so far.
    written: AtomicU64,
    file: File,
    entry: Weak<CacheEntry>,
    result: OnceCell<Result<(), CacheError>>,
}

impl FileWriter {
    /// Creates the tmp file backing `entry`. Only called from the entry's one-time
    /// writer initialization.
    pub(crate) fn create(entry: &Arc<CacheEntry>) -> Result<Arc<Self>, CacheError> {
        let tmp_path = entry.tmp_path();
        let file = File::create(&tmp_path).map_err(|err| {
            CacheError::io(
                format_args!("failed to create cache file {}", tmp_path.display()),
                err,
            )
        })?;

        Ok(Arc::new(Self {
            tmp_path,
            final_path: entry.final_path().clone(),
            declared_size: entry.size(),
            written: AtomicU64::new(0),
            file,
            entry: Arc::downgrade(entry),
            result: OnceCell::new(),
        }))
    }

    /// Writes `buf` at `offset` into the tmp file.
    ///
    /// A write reaching beyond the declared size is rejected up front, without writing
    /// anything. Short positioned writes are retried internally, so the high-water
    /// mark never records an end that was not actually reached.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), CacheError> {
        let end = offset.saturating_add(buf.len() as u64);
        if end > self.declared_size {
            return Err(CacheError::SizeMismatch {
                path: self.tmp_path.clone(),
                written: end,
                expected: self.declared_size,
            });
        }

        self.file.write_all_at(buf, offset).map_err(|err| {
            CacheError::io(
                format_args!("failed to write cache file {}", self.tmp_path.display()),
                err,
            )
        })?;
        self.written.fetch_max(end, Ordering::AcqRel);

        Ok(())
    }

    /// Validates the write and atomically commits the file.
    ///
    /// Idempotent: the body runs exactly once, every later call returns the first
    /// outcome. If the high-water mark does not match the declared size exactly, the
    /// entry flips to [`FileState::WriteFailed`] and the tmp file is left behind for
    /// eviction cleanup. On success the tmp file is renamed to its final path and the
    /// entry flips to [`FileState::Stored`]. Either way, every subscriber of the
    /// entry's state is notified.
    pub async fn finish(&self) -> Result<(), CacheError> {
        self.result
            .get_or_init(|| self.finish_inner())
            .await
            .clone()
    }

    /// The final path this writer commits to.
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    async fn finish_inner(&self) -> Result<(), CacheError> {
        let result = self.commit().await;

        if let Some(entry) = self.entry.upgrade() {
            let state = if result.is_ok() {
                FileState::Stored
            } else {
                FileState::WriteFailed
            };
            entry.set_terminal(state).await;
        }

        result
    }

    async fn commit(&self) -> Result<(), CacheError> {
        let written = self.written.load(Ordering::Acquire);
        if written != self.declared_size {
            return Err(CacheError::SizeMismatch {
                path: self.tmp_path.clone(),
                written,
                expected: self.declared_size,
            });
        }

        tokio::fs::rename(&self.tmp_path, &self.final_path)
            .await
            .map_err(|err| {
                CacheError::io(
                    format_args!(
                        "failed to rename cache file {} -> {}",
                        self.tmp_path.display(),
                        self.final_path.display()
                    ),
                    err,
                )
            })
    }
}
