//! Item persistence

use super::{index, RepositoryError};
use crate::codec;
use crate::model::item::{self, Item, INDEX_GUID};
use crate::store::{Transaction, WriteTx};

pub fn save(tx: &mut WriteTx, item: &mut Item) -> Result<(), RepositoryError> {
    if item.id == 0 {
        item.id = index::next_sequence(tx, item::ENTITY)?;
    }
    index::save(tx, &*item)?;
    Ok(())
}

pub fn by_guid<T: Transaction>(tx: &T, feed_id: u64, guid: &str) -> Result<Option<Item>, RepositoryError> {
    index::get_by_index(tx, INDEX_GUID, &Item::guid_key(feed_id, guid)?)
}

/// Stored items of `feed_id` among `guids`. Unknown GUIDs are skipped.
pub fn by_guids<T: Transaction>(
    tx: &T,
    feed_id: u64,
    guids: &[&str],
) -> Result<Vec<Item>, RepositoryError> {
    let mut found = Vec::new();
    for guid in guids {
        if let Some(item) = by_guid(tx, feed_id, guid)? {
            found.push(item);
        }
    }
    Ok(found)
}

/// All items of a feed, in GUID order.
pub fn for_feed<T: Transaction>(tx: &T, feed_id: u64) -> Result<Vec<Item>, RepositoryError> {
    index::with_prefix(tx, INDEX_GUID, &codec::encode_fields(&[&feed_id])?)
}
