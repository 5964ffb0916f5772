//! Feed persistence, scheduling scan and duplicate cleanup

use super::{index, items, transmissions, RepositoryError};
use crate::codec::FieldValue;
use crate::model::feed::{self, Feed, INDEX_NEXT_FETCH, INDEX_URL};
use crate::store::{Transaction, WriteTx};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Outcome of `cleanup_duplicates`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// url → (survivor, removed ids)
    pub merged: BTreeMap<String, (u64, Vec<u64>)>,
    pub transmissions_moved: usize,
    pub items_moved: usize,
    /// Items dropped because the survivor already had their GUID
    pub items_merged: usize,
}

impl CleanupReport {
    pub fn feeds_removed(&self) -> usize {
        self.merged.values().map(|(_, removed)| removed.len()).sum()
    }
}

pub fn get<T: Transaction>(tx: &T, id: u64) -> Result<Option<Feed>, RepositoryError> {
    index::get(tx, &id.encode_field())
}

pub fn get_by_url<T: Transaction>(tx: &T, url: &str) -> Result<Option<Feed>, RepositoryError> {
    index::get_by_index(tx, INDEX_URL, &[url.to_string()])
}

/// All feeds in id order.
pub fn list<T: Transaction>(tx: &T) -> Result<Vec<Feed>, RepositoryError> {
    index::all(tx)
}

/// Upsert. A feed without an id is assigned the next one.
pub fn save(tx: &mut WriteTx, feed: &mut Feed) -> Result<(), RepositoryError> {
    if feed.id == 0 {
        feed.id = index::next_sequence(tx, feed::ENTITY)?;
    }
    index::save(tx, &*feed)?;
    Ok(())
}

/// The feed at `url`, created (and due immediately) if unknown.
pub fn add(tx: &mut WriteTx, url: &str, now: DateTime<Utc>) -> Result<Feed, RepositoryError> {
    if let Some(existing) = get_by_url(&*tx, url)? {
        return Ok(existing);
    }
    let mut feed = Feed::new(url, now);
    save(tx, &mut feed)?;
    info!(id = feed.id, url, "feed added");
    Ok(feed)
}

/// Remove a feed with its transmissions and items.
pub fn delete(tx: &mut WriteTx, id: u64) -> Result<bool, RepositoryError> {
    for t in transmissions::for_feed(&*tx, id, None)? {
        index::delete::<crate::model::Transmission>(tx, &t.key())?;
    }
    for item in items::for_feed(&*tx, id)? {
        index::delete::<crate::model::Item>(tx, &item.key())?;
    }
    index::delete::<Feed>(tx, &id.encode_field())
}

/// Feeds with `next_fetch <= now` (or never scheduled), soonest first.
///
/// A range scan over the NextFetch index ending at `(now, 0xFF)`.
pub fn due<T: Transaction>(tx: &T, now: DateTime<Utc>) -> Result<Vec<Feed>, RepositoryError> {
    let through = index::upper_bound(&[Some(now).encode_field()])?;
    index::range(tx, INDEX_NEXT_FETCH, b"", &through)
}

/// URLs held by more than one feed, each with its ids in creation order.
pub fn find_duplicates<T: Transaction>(tx: &T) -> Result<BTreeMap<String, Vec<u64>>, RepositoryError> {
    let mut by_url: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for feed in list(tx)? {
        by_url.entry(feed.url).or_default().push(feed.id);
    }
    by_url.retain(|_, ids| ids.len() > 1);
    Ok(by_url)
}

/// Collapse duplicate feeds onto the first-created one.
///
/// Transmissions and items of the removed feeds are repointed to the
/// survivor; an item whose GUID the survivor already has is dropped in
/// favor of the survivor's copy.
pub fn cleanup_duplicates(tx: &mut WriteTx) -> Result<CleanupReport, RepositoryError> {
    let mut report = CleanupReport::default();

    for (url, ids) in find_duplicates(&*tx)? {
        let (survivor_id, removed) = match ids.split_first() {
            Some((first, rest)) => (*first, rest.to_vec()),
            None => continue,
        };
        let mut survivor = get(&*tx, survivor_id)?.ok_or(RepositoryError::NotFound {
            entity: feed::ENTITY,
            id: survivor_id,
        })?;

        for dup_id in &removed {
            for mut t in transmissions::for_feed(&*tx, *dup_id, None)? {
                t.feed_id = survivor_id;
                index::save(tx, &t)?;
                report.transmissions_moved += 1;
            }

            for mut item in items::for_feed(&*tx, *dup_id)? {
                let taken = items::by_guid(&*tx, survivor_id, &item.guid)?.is_some();
                if taken {
                    index::delete::<crate::model::Item>(tx, &item.key())?;
                    report.items_merged += 1;
                } else {
                    item.feed_id = survivor_id;
                    index::save(tx, &item)?;
                    report.items_moved += 1;
                }
            }

            if let Some(dup) = get(&*tx, *dup_id)? {
                if dup.last_updated > survivor.last_updated {
                    survivor.last_updated = dup.last_updated;
                }
            }
            index::delete::<Feed>(tx, &dup_id.encode_field())?;
            debug!(url = %url, survivor = survivor_id, removed = dup_id, "duplicate feed removed");
        }

        // Rewrite so the URL index points at the survivor.
        save(tx, &mut survivor)?;
        report.merged.insert(url, (survivor_id, removed));
    }

    if !report.merged.is_empty() {
        info!(
            feeds = report.feeds_removed(),
            transmissions = report.transmissions_moved,
            items = report.items_moved,
            merged = report.items_merged,
            "duplicate feeds cleaned up"
        );
    }
    Ok(report)
}
