use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::OnceCell;

use crate::error::CacheError;
use crate::filecache::TMP_SUFFIX;
use crate::pubsub::{PubSub, Subscription};
use crate::writer::FileWriter;

/// Capacity of each state subscription channel.
///
/// An entry publishes at most two transitions (`Opened`, then a terminal state), so a
/// subscriber that never drains cannot stall a writer in practice.
pub(crate) const STATE_CHANNEL_CAPACITY: usize = 4;

/// Population state of a cache entry's backing file.
///
/// `Absent → Opened` happens exactly once, when the designated populator claims the
/// writer. `Opened` transitions into exactly one of the terminal states: `Stored` on a
/// successful commit, `WriteFailed` on a short write, size mismatch, or I/O error.
/// Terminal states are never left; retrying requires a fresh entry after the broken
/// one was purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileState {
    /// No bytes exist on disk yet and nobody claimed the writer.
    Absent = 0,
    /// A writer was claimed; `<path>.tmp` is being populated.
    Opened = 1,
    /// The file was fully written and committed to its final path.
    Stored = 2,
    /// Population failed; only the tmp file (if any) remains, awaiting eviction.
    WriteFailed = 3,
}

impl FileState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Absent,
            1 => Self::Opened,
            2 => Self::Stored,
            3 => Self::WriteFailed,
            _ => unreachable!("invalid file state {raw}"),
        }
    }
}

/// The value stored inside the weighted LRU for one cache file.
///
/// Carries the population state machine and the bus over which state transitions are
/// fanned out to everyone holding a reference to this entry.
pub(crate) struct CacheEntry {
    size: u64,
    final_path: PathBuf,
    state: AtomicU8,
    writer: OnceCell<Result<Arc<FileWriter>, CacheError>>,
    pubsub: PubSub<FileState>,
}

impl CacheEntry {
    pub(crate) fn new(final_path: PathBuf, size: u64, state: FileState) -> Self {
        Self {
            size,
            final_path,
            state: AtomicU8::new(state as u8),
            writer: OnceCell::new(),
            pubsub: PubSub::new(),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn final_path(&self) -> &PathBuf {
        &self.final_path
    }

    pub(crate) fn tmp_path(&self) -> PathBuf {
        let mut path = self.final_path.clone().into_os_string();
        path.push(TMP_SUFFIX);
        PathBuf::from(path)
    }

    pub(crate) fn state(&self) -> FileState {
        FileState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn subscribe(&self) -> Subscription<FileState> {
        self.pubsub.subscribe(STATE_CHANNEL_CAPACITY)
    }

    /// Returns the entry's single writer, creating it on the first call.
    ///
    /// Every holder of a reference to this entry gets the same writer back; the
    /// one-time initialization claims the `Absent → Opened` transition and creates the
    /// tmp file. A creation failure marks the entry as failed and is returned to all
    /// callers alike.
    pub(crate) async fn open_writer(entry: &Arc<CacheEntry>) -> Result<Arc<FileWriter>, CacheError> {
        entry
            .writer
            .get_or_init(|| async {
                if !entry.claim().await {
                    return Err(CacheError::NotAbsent);
                }
                match FileWriter::create(entry) {
                    Ok(writer) => Ok(writer),
                    Err(err) => {
                        entry.set_terminal(FileState::WriteFailed).await;
                        Err(err)
                    }
                }
            })
            .await
            .clone()
    }

    /// The one-time `Absent → Opened` claim of writer ownership.
    async fn claim(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                FileState::Absent as u8,
                FileState::Opened as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.pubsub.publish(FileState::Opened).await;
        }
        won
    }

    /// Moves the entry into a terminal state and notifies every subscriber.
    ///
    /// Called at most once per entry: either by the writer's one-time commit, or by
    /// the one-time initialization when tmp file creation fails.
    pub(crate) async fn set_terminal(&self, state: FileState) {
        debug_assert!(matches!(
            state,
            FileState::Stored | FileState::WriteFailed
        ));
        self.state.store(state as u8, Ordering::Release);
        self.pubsub.publish(state).await;
    }
}
