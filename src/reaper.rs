//! Reaper
//!
//! Persists each Harvest in one write transaction:
//!
//! ```text
//! Harvest ──► look up stored items by GUID
//!         ──► reconcile timestamps (new vs. known items)
//!         ──► raise feed.last_updated, reschedule next_fetch
//!         ──► save Transmission, Items, Feed   (all or nothing)
//! ```
//!
//! Harvests queue on the input channel and are applied one at a time; the
//! store's writer lock serializes them against every other writer too. A
//! failed harvest rolls back, is counted and logged, and the loop moves on.

use crate::clock::SharedClock;
use crate::codec;
use crate::model::item::group_by_guid;
use crate::model::{feed, Harvest, Item, ResultCode};
use crate::poller::InFlight;
use crate::repository::{feeds, items, transmissions, RepositoryError};
use crate::store::{Store, WriteTx};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

/// What one reap did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapSummary {
    pub feed_id: u64,
    pub transmission_id: u64,
    pub result: Option<ResultCode>,
    pub items: usize,
    pub new_items: usize,
    pub next_fetch: Option<DateTime<Utc>>,
}

/// Timestamps for an item seen for the first time. Missing or future dates
/// become `now`.
pub fn reconcile_new(item: &mut Item, now: DateTime<Utc>) {
    if item.created.map_or(true, |c| c > now) {
        item.created = Some(now);
    }
    if item.updated.map_or(true, |u| u > now) {
        item.updated = item.created;
    }
}

/// Timestamps for an item already stored as `stored`.
///
/// `created` never moves later than the stored value. `updated` keeps the
/// stored value when the feed omits it, or when the feed bumps it without
/// changing the content.
pub fn reconcile_existing(item: &mut Item, stored: &Item, now: DateTime<Utc>) {
    item.id = stored.id;

    if item.created.is_none() || item.created > stored.created {
        item.created = stored.created;
    }

    match item.updated {
        None => item.updated = stored.updated,
        Some(_) if item.updated > stored.updated && item.hash() == stored.hash() => {
            item.updated = stored.updated;
        }
        Some(u) if u > now => item.updated = Some(now),
        Some(_) => {}
    }
}

/// Apply one harvest inside `tx`.
pub fn reap_in(tx: &mut WriteTx, harvest: Harvest, now: DateTime<Utc>) -> Result<ReapSummary, RepositoryError> {
    let Harvest {
        feed: mut fd,
        transmission: mut t,
        items: mut harvested,
    } = harvest;

    // The feed may have been deleted while this attempt was in flight.
    let Some(current) = feeds::get(&*tx, fd.id)? else {
        return Err(RepositoryError::NotFound {
            entity: feed::ENTITY,
            id: fd.id,
        });
    };
    // The harvest carries the feed as it was when polled. Fields only the
    // reaper writes come from the stored record, which may be newer.
    fd.last_updated = fd.last_updated.max(current.last_updated);
    fd.last200 = current.last200;

    // First occurrence of a GUID within one document wins. A GUID that cannot
    // be indexed would fail the whole transaction, so it is dropped.
    let mut seen = HashSet::new();
    harvested.retain(|item| {
        if !codec::is_indexable(&item.guid) {
            warn!(feed = fd.id, guid = ?item.guid, "item GUID contains NUL, dropped");
            return false;
        }
        seen.insert(item.guid.clone())
    });

    let guids: Vec<&str> = harvested.iter().map(|i| i.guid.as_str()).collect();
    let stored = group_by_guid(items::by_guids(&*tx, fd.id, &guids)?);

    let previous_update = fd.last_updated;
    let mut most_recent: Option<DateTime<Utc>> = None;
    let mut new_items = 0;
    for item in harvested.iter_mut() {
        item.feed_id = fd.id;
        match stored.get(&item.guid) {
            Some(existing) => reconcile_existing(item, existing, now),
            None => {
                new_items += 1;
                reconcile_new(item, now);
            }
        }
        if item.updated > most_recent {
            most_recent = item.updated;
        }
    }

    t.feed_id = fd.id;
    t.last_updated = most_recent;
    if most_recent > fd.last_updated {
        fd.last_updated = most_recent;
    }
    if t.result == Some(ResultCode::Ok) && fd.last_updated.is_none() {
        fd.last_updated = Some(now);
    }
    t.item_count = harvested.len() as u32;
    t.new_items = new_items as u32;
    t.updated = new_items > 0 || fd.last_updated > previous_update;

    fd.schedule_next_fetch(now);

    transmissions::save(tx, &mut t)?;
    for item in harvested.iter_mut() {
        items::save(tx, item)?;
    }
    if t.status_code == 200 {
        fd.last200 = Some(t.clone());
    }
    fd.last = Some(t.clone());
    feeds::save(tx, &mut fd)?;

    Ok(ReapSummary {
        feed_id: fd.id,
        transmission_id: t.id,
        result: t.result,
        items: harvested.len(),
        new_items,
        next_fetch: fd.next_fetch,
    })
}

/// Apply one harvest in its own transaction.
pub fn reap(store: &Store, harvest: Harvest, now: DateTime<Utc>) -> Result<ReapSummary, RepositoryError> {
    store.update(|tx| reap_in(tx, harvest, now))
}

/// Counters for observation.
#[derive(Debug, Default)]
pub struct ReaperStats {
    pub reaped: AtomicU64,
    pub failed: AtomicU64,
}

pub struct Reaper {
    stats: Arc<ReaperStats>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    span: Span,
}

impl Reaper {
    /// Start the loop. Each harvest's feed is released from `in_flight` once
    /// its transaction commits or rolls back.
    pub fn start(
        store: Arc<Store>,
        clock: SharedClock,
        in_flight: Arc<InFlight>,
        input: mpsc::Receiver<Harvest>,
        span: Span,
    ) -> Self {
        let stats = Arc::new(ReaperStats::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            run(store, clock, in_flight, input, cancel.clone(), stats.clone()).instrument(span.clone()),
        );
        span.in_scope(|| info!("reaper started"));
        Reaper {
            stats,
            cancel,
            handle: Some(handle),
            span,
        }
    }

    pub fn stats(&self) -> &ReaperStats {
        &self.stats
    }

    /// Stop taking new harvests, apply the ones already queued, and wait for
    /// the loop to exit.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            self.span.in_scope(|| warn!("reaper already stopped"));
            return;
        };
        self.cancel.cancel();
        if let Err(e) = handle.await {
            self.span.in_scope(|| error!(error = %e, "reaper loop panicked"));
        }
        self.span.in_scope(|| {
            info!(
                reaped = self.stats.reaped.load(Ordering::Relaxed),
                failed = self.stats.failed.load(Ordering::Relaxed),
                "reaper stopped"
            )
        });
    }
}

async fn run(
    store: Arc<Store>,
    clock: SharedClock,
    in_flight: Arc<InFlight>,
    mut input: mpsc::Receiver<Harvest>,
    cancel: CancellationToken,
    stats: Arc<ReaperStats>,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            next = input.recv() => match next {
                Some(harvest) => reap_one(&store, &clock, &in_flight, harvest, &stats).await,
                None => break,
            },
        }
    }

    // Refuse new sends, then apply what is already buffered.
    input.close();
    while let Some(harvest) = input.recv().await {
        reap_one(&store, &clock, &in_flight, harvest, &stats).await;
    }
    debug!("reaper loop exited");
}

async fn reap_one(
    store: &Arc<Store>,
    clock: &SharedClock,
    in_flight: &InFlight,
    harvest: Harvest,
    stats: &ReaperStats,
) {
    let feed_id = harvest.feed.id;
    let url = harvest.feed.url.clone();
    let store = store.clone();
    let now = clock.now();
    let outcome = tokio::task::spawn_blocking(move || reap(&store, harvest, now)).await;
    in_flight.release(feed_id);

    match outcome {
        Ok(Ok(summary)) => {
            stats.reaped.fetch_add(1, Ordering::Relaxed);
            debug!(
                feed = summary.feed_id,
                result = ?summary.result,
                new = summary.new_items,
                items = summary.items,
                next_fetch = ?summary.next_fetch,
                url = %url,
                "harvest reaped"
            );
        }
        Ok(Err(e)) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(url = %url, error = %e, "harvest rolled back");
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(url = %url, error = %e, "reap task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Feed, Transmission};
    use crate::repository::Repository;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    fn item(guid: &str, created: Option<DateTime<Utc>>, updated: Option<DateTime<Utc>>) -> Item {
        let mut item = Item::new(0, guid);
        item.created = created;
        item.updated = updated;
        item.title = format!("title {}", guid);
        item
    }

    #[test]
    fn test_new_item_future_dates_clamped() {
        let mut i = item("a", Some(now() + Duration::days(3)), Some(now() + Duration::days(4)));
        reconcile_new(&mut i, now());
        assert_eq!(i.created, Some(now()));
        assert_eq!(i.updated, Some(now()));

        let mut i = item("b", Some(now() - Duration::hours(1)), None);
        reconcile_new(&mut i, now());
        assert_eq!(i.created, Some(now() - Duration::hours(1)));
        assert_eq!(i.updated, i.created);
    }

    #[test]
    fn test_existing_created_never_creeps_forward() {
        let mut stored = item("a", Some(now() - Duration::days(2)), Some(now() - Duration::days(2)));
        stored.id = 9;

        let mut later = item("a", Some(now() - Duration::days(1)), None);
        reconcile_existing(&mut later, &stored, now());
        assert_eq!(later.id, 9);
        assert_eq!(later.created, stored.created);
        assert_eq!(later.updated, stored.updated);

        let mut missing = item("a", None, None);
        reconcile_existing(&mut missing, &stored, now());
        assert_eq!(missing.created, stored.created);
    }

    #[test]
    fn test_existing_updated_needs_content_change() {
        let stored = item("a", Some(now() - Duration::days(2)), Some(now() - Duration::days(2)));
        let bumped_at = Some(now() - Duration::hours(1));

        let mut same = item("a", stored.created, bumped_at);
        reconcile_existing(&mut same, &stored, now());
        assert_eq!(same.updated, stored.updated);

        let mut changed = item("a", stored.created, bumped_at);
        changed.content = "new body".to_string();
        reconcile_existing(&mut changed, &stored, now());
        assert_eq!(changed.updated, bumped_at);

        let mut future = item("a", stored.created, Some(now() + Duration::days(1)));
        future.content = "other body".to_string();
        reconcile_existing(&mut future, &stored, now());
        assert_eq!(future.updated, Some(now()));
    }

    fn setup() -> (Repository, Feed) {
        let repo = Repository::open(Arc::new(Store::open_in_memory().unwrap())).unwrap();
        let feed = repo.add_feed("http://example.com/feed", now()).unwrap();
        (repo, feed)
    }

    fn ok_harvest(feed: &Feed, items: Vec<Item>) -> Harvest {
        let mut t = Transmission::new(feed.id, &feed.url, now());
        t.result = Some(ResultCode::Ok);
        t.status_code = 200;
        let mut feed = feed.clone();
        feed.set_status(ResultCode::Ok, "", now());
        Harvest {
            feed,
            transmission: t,
            items,
        }
    }

    #[test]
    fn test_reap_persists_everything() {
        let (repo, feed) = setup();
        let h = ok_harvest(&feed, vec![item("g1", Some(now() - Duration::minutes(20)), None)]);
        let summary = reap(repo.store(), h, now()).unwrap();
        assert_eq!(summary.new_items, 1);
        assert_eq!(summary.next_fetch, Some(now() + Duration::minutes(10)));

        let stored = repo.get_feed(feed.id).unwrap().unwrap();
        assert_eq!(stored.last_updated, Some(now() - Duration::minutes(20)));
        assert_eq!(stored.last.as_ref().map(|t| t.new_items), Some(1));
        assert!(stored.last200.is_some());
        assert_eq!(repo.items_for_feed(feed.id).unwrap().len(), 1);
        assert_eq!(repo.transmissions_for_feed(feed.id, None).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_guid_in_one_document_saved_once() {
        let (repo, feed) = setup();
        let h = ok_harvest(&feed, vec![item("g1", None, None), item("g1", None, None)]);
        let summary = reap(repo.store(), h, now()).unwrap();
        assert_eq!(summary.items, 1);
        assert_eq!(repo.items_for_feed(feed.id).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_first_fetch_sets_baseline() {
        let (repo, feed) = setup();
        reap(repo.store(), ok_harvest(&feed, Vec::new()), now()).unwrap();
        let stored = repo.get_feed(feed.id).unwrap().unwrap();
        assert_eq!(stored.last_updated, Some(now()));
    }

    #[test]
    fn test_error_harvest_backs_off_from_status_since() {
        let (repo, mut feed) = setup();
        feed.set_status(ResultCode::ServerError, "HTTP 500", now() - Duration::hours(80));
        let mut t = Transmission::new(feed.id, &feed.url, now());
        t.result = Some(ResultCode::ServerError);
        t.status_code = 500;
        let summary = reap(repo.store(), Harvest::new(feed.clone(), t), now()).unwrap();
        assert_eq!(summary.next_fetch, Some(now() + Duration::hours(24)));
        let stored = repo.get_feed(feed.id).unwrap().unwrap();
        assert!(stored.last200.is_none());
        assert_eq!(stored.last_updated, None);
    }

    #[test]
    fn test_deleted_feed_rolls_back() {
        let (repo, feed) = setup();
        repo.delete_feed(feed.id).unwrap();
        let h = ok_harvest(&feed, vec![item("g1", None, None)]);
        assert!(matches!(
            reap(repo.store(), h, now()),
            Err(RepositoryError::NotFound { .. })
        ));
        assert!(repo.items_for_feed(feed.id).unwrap().is_empty());
        assert!(repo.get_feed(feed.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_service_drains_queue_on_stop() {
        let (repo, feed) = setup();
        let (tx, rx) = mpsc::channel(8);
        let clock: SharedClock = Arc::new(crate::clock::ManualClock::new(now()));
        let in_flight = Arc::new(InFlight::new());
        in_flight.claim(feed.id);
        let mut reaper = Reaper::start(repo.store().clone(), clock, in_flight.clone(), rx, Span::none());
        for n in 0..5 {
            let guid = format!("g{}", n);
            tx.send(ok_harvest(&feed, vec![item(&guid, None, None)])).await.unwrap();
        }
        reaper.stop().await;
        assert_eq!(reaper.stats().reaped.load(Ordering::Relaxed), 5);
        assert_eq!(repo.items_for_feed(feed.id).unwrap().len(), 5);
        assert!(tx.send(ok_harvest(&feed, Vec::new())).await.is_err());
        assert!(in_flight.is_empty());
    }
}
