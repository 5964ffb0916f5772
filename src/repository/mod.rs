//! Feed Repository
//!
//! Domain persistence on top of the index manager. The submodules expose
//! functions over a transaction so callers (the reaper in particular) can
//! compose several of them into one atomic `update`; `Repository` wraps the
//! common single-transaction calls.
//!
//! ```text
//! Repository ──► feeds / transmissions / items ──► index ──► codec + store
//! ```

pub mod feeds;
pub mod index;
pub mod items;
pub mod transmissions;

pub use feeds::CleanupReport;

use crate::codec::{CodecError, Entity};
use crate::model::{Feed, Item, Transmission};
use crate::store::{Store, StoreError, Transaction};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Bucket holding store-wide settings.
pub const INFO_BUCKET: &str = "Info";
const SCHEMA_VERSION_KEY: &[u8] = b"SchemaVersion";
pub const SCHEMA_VERSION: &str = "1";

/// Error type for repository operations
#[derive(Debug)]
pub enum RepositoryError {
    Store(StoreError),
    Codec(CodecError),
    NotFound { entity: &'static str, id: u64 },
    SchemaVersion { found: String, expected: String },
    UnknownIndex { entity: &'static str, index: String },
    /// Stored data violates an invariant (dangling index entry, bad counter)
    Corrupt(String),
}

impl std::fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepositoryError::Store(e) => write!(f, "{}", e),
            RepositoryError::Codec(e) => write!(f, "{}", e),
            RepositoryError::NotFound { entity, id } => write!(f, "{} {} not found", entity, id),
            RepositoryError::SchemaVersion { found, expected } => write!(
                f,
                "schema version mismatch: store has {}, expected {}",
                found, expected
            ),
            RepositoryError::UnknownIndex { entity, index } => {
                write!(f, "entity {} has no index {}", entity, index)
            }
            RepositoryError::Corrupt(msg) => write!(f, "corrupt store: {}", msg),
        }
    }
}

impl std::error::Error for RepositoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RepositoryError::Store(e) => Some(e),
            RepositoryError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for RepositoryError {
    fn from(e: StoreError) -> Self {
        RepositoryError::Store(e)
    }
}

impl From<CodecError> for RepositoryError {
    fn from(e: CodecError) -> Self {
        RepositoryError::Codec(e)
    }
}

/// Create every entity and index bucket and check the schema version.
pub fn initialize(store: &Store) -> Result<(), RepositoryError> {
    store.update(|tx| {
        let found = tx
            .bucket(&[INFO_BUCKET])
            .and_then(|b| b.get(SCHEMA_VERSION_KEY))
            .map(|v| String::from_utf8_lossy(v).into_owned());
        match found {
            Some(version) if version != SCHEMA_VERSION => {
                return Err(RepositoryError::SchemaVersion {
                    found: version,
                    expected: SCHEMA_VERSION.to_string(),
                })
            }
            Some(_) => {}
            None => {
                info!(version = SCHEMA_VERSION, "initializing new store");
                tx.create_bucket_if_not_exists(&[INFO_BUCKET])?
                    .put(SCHEMA_VERSION_KEY, SCHEMA_VERSION.as_bytes())?;
            }
        }
        index::ensure_buckets(tx, Feed::metadata()?)?;
        index::ensure_buckets(tx, Transmission::metadata()?)?;
        index::ensure_buckets(tx, Item::metadata()?)?;
        Ok(())
    })
}

/// Handle bundling the store with single-transaction repository calls.
#[derive(Clone)]
pub struct Repository {
    store: Arc<Store>,
}

impl Repository {
    /// Wrap `store`, creating buckets on first use.
    pub fn open(store: Arc<Store>) -> Result<Self, RepositoryError> {
        initialize(&store)?;
        Ok(Repository { store })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn add_feed(&self, url: &str, now: DateTime<Utc>) -> Result<Feed, RepositoryError> {
        self.store.update(|tx| feeds::add(tx, url, now))
    }

    pub fn get_feed(&self, id: u64) -> Result<Option<Feed>, RepositoryError> {
        self.store.select(|tx| feeds::get(tx, id))
    }

    pub fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, RepositoryError> {
        self.store.select(|tx| feeds::get_by_url(tx, url))
    }

    pub fn list_feeds(&self) -> Result<Vec<Feed>, RepositoryError> {
        self.store.select(|tx| feeds::list(tx))
    }

    pub fn save_feed(&self, feed: &mut Feed) -> Result<(), RepositoryError> {
        self.store.update(|tx| feeds::save(tx, feed))
    }

    pub fn delete_feed(&self, id: u64) -> Result<bool, RepositoryError> {
        self.store.update(|tx| feeds::delete(tx, id))
    }

    /// Feeds with `next_fetch <= now`, soonest first.
    pub fn feeds_due(&self, now: DateTime<Utc>) -> Result<Vec<Feed>, RepositoryError> {
        self.store.select(|tx| feeds::due(tx, now))
    }

    pub fn find_duplicates(&self) -> Result<BTreeMap<String, Vec<u64>>, RepositoryError> {
        self.store.select(|tx| feeds::find_duplicates(tx))
    }

    pub fn cleanup_duplicates(&self) -> Result<CleanupReport, RepositoryError> {
        self.store.update(|tx| feeds::cleanup_duplicates(tx))
    }

    pub fn transmissions_for_feed(
        &self,
        feed_id: u64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transmission>, RepositoryError> {
        self.store
            .select(|tx| transmissions::for_feed(tx, feed_id, since))
    }

    pub fn save_transmission(&self, t: &mut Transmission) -> Result<(), RepositoryError> {
        self.store.update(|tx| transmissions::save(tx, t))
    }

    pub fn last_fetch_time(&self) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        self.store.select(|tx| transmissions::last_fetch_time(tx))
    }

    pub fn items_for_feed(&self, feed_id: u64) -> Result<Vec<Item>, RepositoryError> {
        self.store.select(|tx| items::for_feed(tx, feed_id))
    }

    pub fn items_by_guids(&self, feed_id: u64, guids: &[&str]) -> Result<Vec<Item>, RepositoryError> {
        self.store.select(|tx| items::by_guids(tx, feed_id, guids))
    }

    pub fn save_item(&self, item: &mut Item) -> Result<(), RepositoryError> {
        self.store.update(|tx| items::save(tx, item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        initialize(&store).unwrap();
        initialize(&store).unwrap();
        let has_index = store
            .select(|tx| Ok::<_, StoreError>(tx.bucket(&["Feed", "NextFetch"]).is_some()))
            .unwrap();
        assert!(has_index);
    }

    #[test]
    fn test_schema_version_mismatch() {
        let store = Store::open_in_memory().unwrap();
        store
            .update(|tx| {
                tx.create_bucket_if_not_exists(&[INFO_BUCKET])?
                    .put(SCHEMA_VERSION_KEY, b"0")
            })
            .unwrap();
        assert!(matches!(
            initialize(&store),
            Err(RepositoryError::SchemaVersion { .. })
        ));
    }
}
