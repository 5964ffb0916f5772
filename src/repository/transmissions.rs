//! Fetch attempt log

use super::{index, RepositoryError};
use crate::codec;
use crate::model::transmission::{self, Transmission, INDEX_FEED_TIME, INDEX_TIME};
use crate::store::{Transaction, WriteTx};
use chrono::{DateTime, Utc};

/// Append (or rewrite) an attempt. A new attempt is assigned the next id.
pub fn save(tx: &mut WriteTx, t: &mut Transmission) -> Result<(), RepositoryError> {
    if t.id == 0 {
        t.id = index::next_sequence(tx, transmission::ENTITY)?;
    }
    index::save(tx, &*t)?;
    Ok(())
}

/// A feed's attempts starting at `since` (all if `None`), newest first.
pub fn for_feed<T: Transaction>(
    tx: &T,
    feed_id: u64,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<Transmission>, RepositoryError> {
    let from = codec::index_key(&transmission::feed_time_bound(feed_id, since)?)?;
    let through = index::upper_bound(&codec::encode_fields(&[&feed_id])?)?;
    let mut found: Vec<Transmission> = index::range(tx, INDEX_FEED_TIME, &from, &through)?;
    found.reverse();
    Ok(found)
}

/// Start time of the most recent attempt across all feeds.
pub fn last_fetch_time<T: Transaction>(tx: &T) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    let latest: Option<Transmission> = index::last(tx, INDEX_TIME)?;
    Ok(latest.and_then(|t| t.start_time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::initialize;
    use crate::store::Store;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, hour, 0, 0).unwrap()
    }

    fn seeded() -> Store {
        let store = Store::open_in_memory().unwrap();
        initialize(&store).unwrap();
        store
            .update(|tx| {
                for (feed, hour) in [(1, 1), (2, 2), (1, 3), (1, 5)] {
                    save(tx, &mut Transmission::new(feed, "u", at(hour)))?;
                }
                Ok::<_, RepositoryError>(())
            })
            .unwrap();
        store
    }

    #[test]
    fn test_for_feed_newest_first() {
        let store = seeded();
        let got = store.select(|tx| for_feed(tx, 1, None)).unwrap();
        let hours: Vec<_> = got.iter().map(|t| t.start_time).collect();
        assert_eq!(hours, vec![Some(at(5)), Some(at(3)), Some(at(1))]);
    }

    #[test]
    fn test_for_feed_since_is_inclusive() {
        let store = seeded();
        let got = store.select(|tx| for_feed(tx, 1, Some(at(3)))).unwrap();
        assert_eq!(got.len(), 2);
        let none = store
            .select(|tx| for_feed(tx, 1, Some(at(5) + Duration::seconds(1))))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_last_fetch_time() {
        let store = seeded();
        assert_eq!(store.select(|tx| last_fetch_time(tx)).unwrap(), Some(at(5)));

        let empty = Store::open_in_memory().unwrap();
        initialize(&empty).unwrap();
        assert_eq!(empty.select(|tx| last_fetch_time(tx)).unwrap(), None);
    }
}
