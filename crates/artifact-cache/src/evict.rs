use crate::entry::{CacheEntry, FileState};

/// Removes an evicted entry's on-disk remains.
///
/// This is the only code path that deletes files out of the cache directory. It runs
/// synchronously inside the weighted LRU's critical section, either when a released
/// entry is evicted for capacity, or when the last reference to a non-stored entry is
/// released. Filesystem errors are logged only; eviction has no caller left to report
/// to.
pub(crate) fn remove_evicted_file(entry: &CacheEntry) {
    match entry.state() {
        FileState::Stored => {
            let path = entry.final_path();
            if let Err(err) = std::fs::remove_file(path) {
                tracing::error!(
                    path = %path.display(),
                    error = %err,
                    "failed to remove stored cache file on eviction"
                );
            }
        }
        FileState::Opened | FileState::WriteFailed => {
            let tmp_path = entry.tmp_path();
            if let Err(err) = std::fs::remove_file(&tmp_path) {
                tracing::error!(
                    path = %tmp_path.display(),
                    error = %err,
                    "failed to remove temporary cache file on eviction"
                );
            }
        }
        // Nothing was ever created on disk.
        FileState::Absent => {}
    }
}
