//! Repository integration tests: time-range scans over the attempt log and
//! duplicate-feed cleanup.

use chrono::{DateTime, Duration, TimeZone, Utc};
use feedreaper::model::{Feed, Item, ResultCode, Transmission};
use feedreaper::repository::Repository;
use feedreaper::store::Store;
use std::sync::Arc;

fn t() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 10, 15, 0, 0).unwrap()
}

fn repo() -> Repository {
    Repository::open(Arc::new(Store::open_in_memory().unwrap())).unwrap()
}

fn log_attempt(repo: &Repository, feed: &Feed, at: DateTime<Utc>) -> u64 {
    let mut attempt = Transmission::new(feed.id, &feed.url, at);
    attempt.result = Some(ResultCode::Ok);
    repo.save_transmission(&mut attempt).unwrap();
    attempt.id
}

#[test]
fn test_attempt_log_since_is_inclusive_and_newest_first() {
    let repo = repo();
    let feed = repo.add_feed("http://a/", t()).unwrap();
    let other = repo.add_feed("http://b/", t()).unwrap();
    log_attempt(&repo, &feed, t() - Duration::hours(1));
    log_attempt(&repo, &feed, t());
    log_attempt(&repo, &feed, t() + Duration::hours(1));
    log_attempt(&repo, &other, t() + Duration::hours(2));

    let since = repo.transmissions_for_feed(feed.id, Some(t())).unwrap();
    let times: Vec<_> = since.iter().map(|a| a.start_time).collect();
    assert_eq!(times, vec![Some(t() + Duration::hours(1)), Some(t())]);

    let all = repo.transmissions_for_feed(feed.id, None).unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|a| a.feed_id == feed.id));

    assert_eq!(repo.last_fetch_time().unwrap(), Some(t() + Duration::hours(2)));
}

#[test]
fn test_duplicate_feeds_are_merged_onto_first() {
    let repo = repo();
    for url in ["x", "x", "y"] {
        repo.save_feed(&mut Feed::new(url, t())).unwrap();
    }
    let dups = repo.find_duplicates().unwrap();
    assert_eq!(dups.len(), 1);
    assert_eq!(dups["x"], vec![1, 2]);

    // Feed 2 owns an attempt, a unique item, and an item feed 1 also has.
    let dup = repo.get_feed(2).unwrap().unwrap();
    log_attempt(&repo, &dup, t());
    for (feed_id, guid) in [(1, "shared"), (2, "shared"), (2, "only-in-2")] {
        let mut item = Item::new(feed_id, guid);
        item.created = Some(t());
        repo.save_item(&mut item).unwrap();
    }
    let mut newer = dup.clone();
    newer.last_updated = Some(t() + Duration::days(1));
    repo.save_feed(&mut newer).unwrap();
    assert_eq!(repo.items_by_guids(2, &["shared", "missing"]).unwrap().len(), 1);

    let report = repo.cleanup_duplicates().unwrap();
    assert_eq!(report.feeds_removed(), 1);
    assert_eq!(report.merged["x"], (1, vec![2]));
    assert_eq!(report.transmissions_moved, 1);
    assert_eq!(report.items_moved, 1);
    assert_eq!(report.items_merged, 1);

    assert!(repo.get_feed(2).unwrap().is_none());
    let survivor = repo.get_feed_by_url("x").unwrap().unwrap();
    assert_eq!(survivor.id, 1);
    assert_eq!(survivor.last_updated, Some(t() + Duration::days(1)));
    assert_eq!(repo.transmissions_for_feed(1, None).unwrap().len(), 1);

    let mut guids: Vec<_> = repo
        .items_for_feed(1)
        .unwrap()
        .into_iter()
        .map(|i| i.guid)
        .collect();
    guids.sort();
    assert_eq!(guids, vec!["only-in-2".to_string(), "shared".to_string()]);

    assert!(repo.find_duplicates().unwrap().is_empty());
    assert_eq!(repo.list_feeds().unwrap().len(), 2);
}

#[test]
fn test_due_excludes_future_and_orders_by_time() {
    let repo = repo();
    let mut late = repo.add_feed("http://late/", t()).unwrap();
    let early = repo.add_feed("http://early/", t() - Duration::minutes(5)).unwrap();
    let mut future = repo.add_feed("http://future/", t()).unwrap();

    late.next_fetch = Some(t());
    repo.save_feed(&mut late).unwrap();
    future.next_fetch = Some(t() + Duration::minutes(1));
    repo.save_feed(&mut future).unwrap();

    let due: Vec<_> = repo.feeds_due(t()).unwrap().into_iter().map(|f| f.id).collect();
    assert_eq!(due, vec![early.id, late.id]);
}
