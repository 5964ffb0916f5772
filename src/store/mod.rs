//! Transactional Store
//!
//! Embedded, ordered key-value store with nested buckets, concurrent
//! read-only transactions and a single writer.
//!
//! ## Architecture
//!
//! ```text
//!  select(fn) ──► ReadTx(snapshot = committed.clone()) ──► fn
//!
//!  update(fn) ──► writer lock (try_lock_for) ──► WriteTx(base, overlay) ──► fn
//!                      │                                  │ Ok
//!                      │                 journal.append + sync (durable)
//!                      │                                  │
//!                      └──────────── apply overlay to committed root
//! ```
//!
//! An update whose closure returns `Err` is dropped without touching the
//! journal or the committed tree. Readers never block on the writer.

pub mod backend;
pub mod bucket;
pub mod journal;
pub mod node;
pub mod snapshot;
pub mod tx;

pub use backend::{InMemoryBackend, JournalBackend, JournalError, LocalBackend};
pub use bucket::{BucketView, Cursor, Entry, Iter};
pub use tx::{BucketMut, ReadTx, Transaction, WriteTx};

use journal::{JournalEntry, JournalRotator};
use node::Node;
use parking_lot::{Mutex, RwLock};
use snapshot::{decode_snapshot, encode_snapshot, SNAPSHOT_FILE};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Error type for store operations
#[derive(Debug)]
pub enum StoreError {
    /// Journal or snapshot I/O failed
    Journal(JournalError),
    /// Could not acquire the writer lock in time
    LockTimeout(Duration),
    /// Store has been closed
    Closed,
    /// Bucket path does not exist
    BucketNotFound(String),
    /// Bucket path is not usable (e.g. empty)
    InvalidBucket(String),
    /// Keys must be non-empty
    InvalidKey,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Journal(e) => write!(f, "store I/O error: {}", e),
            StoreError::LockTimeout(d) => write!(f, "timed out after {:?} waiting for writer lock", d),
            StoreError::Closed => write!(f, "store is closed"),
            StoreError::BucketNotFound(path) => write!(f, "bucket not found: {}", path),
            StoreError::InvalidBucket(path) => write!(f, "invalid bucket path: {:?}", path),
            StoreError::InvalidKey => write!(f, "key must not be empty"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Journal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<JournalError> for StoreError {
    fn from(e: JournalError) -> Self {
        StoreError::Journal(e)
    }
}

/// Tuning knobs for an open store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Maximum wait for the writer lock
    pub lock_timeout: Duration,
    /// Journal file size before rotation
    pub max_journal_file_size: usize,
    /// Commits between automatic checkpoints (0 disables)
    pub checkpoint_every: u64,
    /// Fsync the journal before each commit becomes visible
    pub sync_on_commit: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            lock_timeout: Duration::from_secs(10),
            max_journal_file_size: 16 * 1024 * 1024, // 16MB
            checkpoint_every: 1_000,
            sync_on_commit: true,
        }
    }
}

impl StoreOptions {
    /// Small files and frequent checkpoints so tests exercise rotation
    pub fn test() -> Self {
        StoreOptions {
            lock_timeout: Duration::from_secs(2),
            max_journal_file_size: 4 * 1024,
            checkpoint_every: 50,
            sync_on_commit: true,
        }
    }
}

struct Writer {
    journal: JournalRotator,
    last_txid: u64,
    commits_since_checkpoint: u64,
    closed: bool,
}

/// The store. Share it through `Arc`.
pub struct Store {
    committed: RwLock<Arc<Node>>,
    writer: Mutex<Writer>,
    backend: Arc<dyn JournalBackend>,
    closed: AtomicBool,
    options: StoreOptions,
}

impl Store {
    /// Open (or create) a store in directory `location`.
    pub fn open(location: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let backend = LocalBackend::new(location.as_ref())?;
        Self::open_with_backend(Arc::new(backend), options)
    }

    /// Fresh store backed by memory only.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open_with_backend(Arc::new(InMemoryBackend::new()), StoreOptions::test())
    }

    /// Open over any backend: load the snapshot, then replay newer journal
    /// entries.
    pub fn open_with_backend(
        backend: Arc<dyn JournalBackend>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let (root, snapshot_txid) = if backend.exists(SNAPSHOT_FILE)? {
            decode_snapshot(&backend.read(SNAPSHOT_FILE)?)?
        } else {
            (Node::default(), 0)
        };

        let journal = JournalRotator::new(backend.clone(), options.max_journal_file_size)?;
        let mut root = Arc::new(root);
        let mut last_txid = snapshot_txid;
        let mut replayed = 0u64;
        for (txid, pending) in journal.recover_after(snapshot_txid)? {
            node::apply(&mut root, pending);
            last_txid = txid;
            replayed += 1;
        }

        info!(
            snapshot_txid,
            replayed,
            last_txid,
            entries = root.total_entries(),
            "store opened"
        );

        Ok(Store {
            committed: RwLock::new(root),
            writer: Mutex::new(Writer {
                journal,
                last_txid,
                commits_since_checkpoint: replayed,
                closed: false,
            }),
            backend,
            closed: AtomicBool::new(false),
            options,
        })
    }

    /// Run `f` in a read-only transaction over the latest committed state.
    pub fn select<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&ReadTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed.into());
        }
        let root = self.committed.read().clone();
        f(&ReadTx::new(root))
    }

    /// Run `f` in the single read-write transaction. `Ok` commits, `Err`
    /// discards every write made by `f`.
    pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut WriteTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let timeout = self.options.lock_timeout;
        let mut writer = self
            .writer
            .try_lock_for(timeout)
            .ok_or(StoreError::LockTimeout(timeout))?;
        if writer.closed {
            return Err(StoreError::Closed.into());
        }

        let base = self.committed.read().clone();
        let mut tx = WriteTx::new(base, writer.last_txid + 1);
        let out = match f(&mut tx) {
            Ok(out) => out,
            Err(e) => {
                debug!(txid = tx.txid(), "update rolled back");
                return Err(e);
            }
        };

        let (txid, pending) = tx.into_pending();
        if pending.is_empty() {
            return Ok(out);
        }

        let entry = JournalEntry::from_pending(&pending, txid).map_err(StoreError::from)?;
        writer.journal.append(&entry).map_err(StoreError::from)?;
        if self.options.sync_on_commit {
            writer.journal.sync().map_err(StoreError::from)?;
        }

        node::apply(&mut self.committed.write(), pending);
        writer.last_txid = txid;
        writer.commits_since_checkpoint += 1;

        if self.options.checkpoint_every > 0
            && writer.commits_since_checkpoint >= self.options.checkpoint_every
        {
            // The commit is already durable; a failed checkpoint only delays truncation.
            if let Err(e) = self.checkpoint_locked(&mut writer) {
                warn!(error = %e, "automatic checkpoint failed");
            }
        }
        Ok(out)
    }

    /// Write a snapshot and drop journal files it covers.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock();
        if writer.closed {
            return Err(StoreError::Closed);
        }
        self.checkpoint_locked(&mut writer)
    }

    fn checkpoint_locked(&self, writer: &mut Writer) -> Result<(), StoreError> {
        let root = self.committed.read().clone();
        let bytes = encode_snapshot(&root, writer.last_txid)?;
        self.backend.write_atomic(SNAPSHOT_FILE, &bytes)?;
        let deleted = writer.journal.truncate_through(writer.last_txid)?;
        writer.commits_since_checkpoint = 0;
        debug!(
            txid = writer.last_txid,
            bytes = bytes.len(),
            journal_files_deleted = deleted,
            "checkpoint written"
        );
        Ok(())
    }

    /// Checkpoint and refuse further transactions. Waits for an in-flight
    /// update. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock();
        if writer.closed {
            return Ok(());
        }
        let result = self.checkpoint_locked(&mut writer);
        writer.closed = true;
        self.closed.store(true, Ordering::Release);
        info!(last_txid = writer.last_txid, "store closed");
        result
    }

    /// Txid of the last committed update.
    pub fn last_txid(&self) -> u64 {
        self.writer.lock().last_txid
    }
}
