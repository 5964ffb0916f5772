//! Index Manager
//!
//! Keeps an entity's primary bucket and its secondary-index buckets in step.
//!
//! ```text
//! [Feed]                 primary key  → values blob
//! [Feed, NextFetch]      index tuple  → primary key
//! [Feed, URL]            index tuple  → primary key
//! [Sequences]            entity name  → last issued id
//! ```
//!
//! Every write is read-modify-compare: the stored record is decoded first, its
//! index tuples are diffed against the new ones, and entries that no longer
//! match are removed before the new ones go in.

use super::RepositoryError;
use crate::codec::{self, Data, Entity, FieldValue, Metadata, SEGMENT_SEPARATOR};
use crate::store::{BucketView, StoreError, Transaction, WriteTx};

/// Bucket holding per-entity id counters.
pub const SEQUENCES_BUCKET: &str = "Sequences";

/// Create the primary bucket and one bucket per declared index.
pub fn ensure_buckets(tx: &mut WriteTx, metadata: &Metadata) -> Result<(), RepositoryError> {
    tx.create_bucket_if_not_exists(&[metadata.name])?;
    for index in metadata.indexes.keys() {
        tx.create_bucket_if_not_exists(&[metadata.name, index])?;
    }
    Ok(())
}

/// Issue the next id for `entity`. Ids start at 1.
pub fn next_sequence(tx: &mut WriteTx, entity: &str) -> Result<u64, RepositoryError> {
    let mut bucket = tx.create_bucket_if_not_exists(&[SEQUENCES_BUCKET])?;
    let current = match bucket.get(entity.as_bytes()) {
        Some(raw) => {
            let raw = String::from_utf8_lossy(raw);
            u64::decode_field(&raw).map_err(|message| {
                RepositoryError::Corrupt(format!("sequence {}: {}", entity, message))
            })?
        }
        None => 0,
    };
    let next = current + 1;
    bucket.put(entity.as_bytes(), next.encode_field().as_bytes())?;
    Ok(next)
}

/// Upsert `record`, maintaining every index. Returns the encoded form.
pub fn save<E: Entity>(tx: &mut WriteTx, record: &E) -> Result<Data, RepositoryError> {
    let (metadata, data) = codec::encode(record)?;
    let previous = load_data(&primary(&*tx, metadata)?, metadata, &data.key)?;

    for (index, tuple) in &data.indexes {
        let new_key = codec::index_key(tuple)?;
        let mut bucket = tx
            .bucket_mut(&[metadata.name, index])
            .ok_or_else(|| missing(&[metadata.name, index]))?;

        if let Some(prev) = &previous {
            let old_key = codec::index_key(prev.index(index))?;
            // Another record may own the slot by now; leave it alone.
            let ours = bucket.get(&old_key) == Some(data.key.as_bytes());
            if old_key != new_key && !old_key.is_empty() && ours {
                bucket.delete(&old_key)?;
            }
        }
        // A tuple of all-zero values encodes to nothing and is not indexed.
        if !new_key.is_empty() {
            bucket.put(&new_key, data.key.as_bytes())?;
        }
    }

    let blob = codec::values_to_blob(&data.values)?;
    tx.bucket_mut(&[metadata.name])
        .ok_or_else(|| missing(&[metadata.name]))?
        .put(data.key.as_bytes(), &blob)?;
    Ok(data)
}

/// Remove the record stored under `key` together with its index entries.
/// Returns whether a record existed.
pub fn delete<E: Entity>(tx: &mut WriteTx, key: &str) -> Result<bool, RepositoryError> {
    let metadata = E::metadata()?;
    let previous = match load_data(&primary(&*tx, metadata)?, metadata, key)? {
        Some(data) => data,
        None => return Ok(false),
    };

    for (index, tuple) in &previous.indexes {
        let index_key = codec::index_key(tuple)?;
        if index_key.is_empty() {
            continue;
        }
        let mut bucket = tx
            .bucket_mut(&[metadata.name, index])
            .ok_or_else(|| missing(&[metadata.name, index]))?;
        if bucket.get(&index_key) == Some(key.as_bytes()) {
            bucket.delete(&index_key)?;
        }
    }

    tx.bucket_mut(&[metadata.name])
        .ok_or_else(|| missing(&[metadata.name]))?
        .delete(key.as_bytes())?;
    Ok(true)
}

/// Fetch by primary key.
pub fn get<E: Entity, T: Transaction>(tx: &T, key: &str) -> Result<Option<E>, RepositoryError> {
    let metadata = E::metadata()?;
    match load_data(&primary(tx, metadata)?, metadata, key)? {
        Some(data) => {
            let mut record = E::default();
            codec::decode(&mut record, &data.values)?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Fetch by an exact index tuple.
pub fn get_by_index<E: Entity, T: Transaction>(
    tx: &T,
    index: &str,
    segments: &[String],
) -> Result<Option<E>, RepositoryError> {
    let metadata = E::metadata()?;
    let bucket = index_bucket(tx, metadata, index)?;
    let key = codec::index_key(segments)?;
    match bucket.get(&key) {
        Some(pk) => get(tx, &String::from_utf8_lossy(pk)),
        None => Ok(None),
    }
}

/// Record behind the greatest entry of `index`.
pub fn last<E: Entity, T: Transaction>(tx: &T, index: &str) -> Result<Option<E>, RepositoryError> {
    let metadata = E::metadata()?;
    let mut cursor = index_bucket(tx, metadata, index)?.cursor();
    match cursor.last() {
        Some((_, pk)) => get(tx, &String::from_utf8_lossy(pk)),
        None => Ok(None),
    }
}

/// Primary keys of index entries in `[from, through]`, in index order.
pub fn scan_keys<T: Transaction>(
    tx: &T,
    metadata: &Metadata,
    index: &str,
    from: &[u8],
    through: &[u8],
) -> Result<Vec<String>, RepositoryError> {
    let bucket = index_bucket(tx, metadata, index)?;
    Ok(bucket
        .iter_from(from)
        .take_while(|(k, _)| *k <= through)
        .map(|(_, pk)| String::from_utf8_lossy(pk).into_owned())
        .collect())
}

/// Records whose index entries fall in `[from, through]`, in index order.
pub fn range<E: Entity, T: Transaction>(
    tx: &T,
    index: &str,
    from: &[u8],
    through: &[u8],
) -> Result<Vec<E>, RepositoryError> {
    let metadata = E::metadata()?;
    let keys = scan_keys(tx, metadata, index, from, through)?;
    load_all(tx, &keys)
}

/// Records whose index tuple starts with `segments`.
pub fn with_prefix<E: Entity, T: Transaction>(
    tx: &T,
    index: &str,
    segments: &[String],
) -> Result<Vec<E>, RepositoryError> {
    let from = prefix_key(segments)?;
    let through = upper_bound(segments)?;
    range(tx, index, &from, &through)
}

/// Every record of the entity, in primary-key order.
pub fn all<E: Entity, T: Transaction>(tx: &T) -> Result<Vec<E>, RepositoryError> {
    let metadata = E::metadata()?;
    primary(tx, metadata)?
        .iter()
        .map(|(_, blob)| -> Result<E, RepositoryError> {
            let values = codec::values_from_blob(blob)?;
            let mut record = E::default();
            codec::decode(&mut record, &values)?;
            Ok(record)
        })
        .collect()
}

/// Index key of `segments` followed by the separator, so that it precedes
/// every longer tuple sharing those segments.
pub fn prefix_key(segments: &[String]) -> Result<Vec<u8>, RepositoryError> {
    let mut key = codec::index_key(segments)?;
    key.push(SEGMENT_SEPARATOR);
    Ok(key)
}

/// Inclusive upper bound for tuples starting with `segments`.
///
/// Segments never contain the separator, and encoded values never contain
/// 0xFF, so `segments ++ [0x00, 0xFF]` sorts after every extension.
pub fn upper_bound(segments: &[String]) -> Result<Vec<u8>, RepositoryError> {
    let mut key = prefix_key(segments)?;
    key.push(0xFF);
    Ok(key)
}

fn load_all<E: Entity, T: Transaction>(tx: &T, keys: &[String]) -> Result<Vec<E>, RepositoryError> {
    let mut records = Vec::with_capacity(keys.len());
    for key in keys {
        match get(tx, key)? {
            Some(record) => records.push(record),
            None => {
                return Err(RepositoryError::Corrupt(format!(
                    "index entry points at missing record {}",
                    key
                )))
            }
        }
    }
    Ok(records)
}

fn load_data(
    bucket: &BucketView<'_>,
    metadata: &'static Metadata,
    key: &str,
) -> Result<Option<Data>, RepositoryError> {
    if key.is_empty() {
        return Ok(None);
    }
    match bucket.get(key.as_bytes()) {
        Some(blob) => Ok(Some(codec::data_from(metadata, codec::values_from_blob(blob)?))),
        None => Ok(None),
    }
}

fn primary<'t, T: Transaction>(tx: &'t T, metadata: &Metadata) -> Result<BucketView<'t>, RepositoryError> {
    tx.bucket(&[metadata.name])
        .ok_or_else(|| missing(&[metadata.name]))
}

fn index_bucket<'t, T: Transaction>(
    tx: &'t T,
    metadata: &Metadata,
    index: &str,
) -> Result<BucketView<'t>, RepositoryError> {
    if !metadata.indexes.contains_key(index) {
        return Err(RepositoryError::UnknownIndex {
            entity: metadata.name,
            index: index.to_string(),
        });
    }
    tx.bucket(&[metadata.name, index])
        .ok_or_else(|| missing(&[metadata.name, index]))
}

fn missing(path: &[&str]) -> RepositoryError {
    RepositoryError::Store(StoreError::BucketNotFound(path.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{field, schema, FieldDef, IndexPos, SchemaDef, Values};
    use crate::store::Store;
    use std::sync::OnceLock;

    static NOTE_SCHEMA: SchemaDef = SchemaDef {
        name: "Note",
        key: "ID",
        fields: &[
            FieldDef::indexed("ID", &[IndexPos::new("Rank", 2)]),
            FieldDef::indexed("Rank", &[IndexPos::new("Rank", 1)]),
            FieldDef::indexed("Tag", &[IndexPos::new("Tag", 1)]),
        ],
    };

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Note {
        id: u64,
        rank: u64,
        tag: String,
    }

    impl Entity for Note {
        fn metadata() -> Result<&'static Metadata, codec::CodecError> {
            static CELL: OnceLock<Result<Metadata, codec::CodecError>> = OnceLock::new();
            schema::cached(&CELL, &NOTE_SCHEMA)
        }

        fn to_values(&self) -> Result<Values, codec::CodecError> {
            let mut values = Values::new();
            field::put(&mut values, "ID", &self.id);
            field::put(&mut values, "Rank", &self.rank);
            field::put(&mut values, "Tag", &self.tag);
            Ok(values)
        }

        fn apply_values(&mut self, values: &Values) -> Result<(), codec::CodecError> {
            self.id = field::get(values, "Note", "ID")?;
            self.rank = field::get(values, "Note", "Rank")?;
            self.tag = field::get(values, "Note", "Tag")?;
            Ok(())
        }
    }

    fn note(id: u64, rank: u64, tag: &str) -> Note {
        Note {
            id,
            rank,
            tag: tag.to_string(),
        }
    }

    fn store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .update(|tx| ensure_buckets(tx, Note::metadata()?))
            .unwrap();
        store
    }

    fn index_len(store: &Store, index: &str) -> usize {
        store
            .select(|tx| Ok::<_, RepositoryError>(tx.bucket(&["Note", index]).map(|b| b.len())))
            .unwrap()
            .unwrap_or(0)
    }

    #[test]
    fn test_save_and_get() {
        let store = store();
        store.update(|tx| save(tx, &note(1, 5, "a")).map(|_| ())).unwrap();

        let got: Option<Note> = store.select(|tx| get(tx, &1u64.encode_field())).unwrap();
        assert_eq!(got, Some(note(1, 5, "a")));
        let by_tag: Option<Note> = store
            .select(|tx| get_by_index(tx, "Tag", &["a".to_string()]))
            .unwrap();
        assert_eq!(by_tag.map(|n| n.id), Some(1));
    }

    #[test]
    fn test_update_moves_index_entries() {
        let store = store();
        store.update(|tx| save(tx, &note(1, 5, "a")).map(|_| ())).unwrap();
        store.update(|tx| save(tx, &note(1, 9, "b")).map(|_| ())).unwrap();

        assert_eq!(index_len(&store, "Rank"), 1);
        assert_eq!(index_len(&store, "Tag"), 1);
        let stale: Option<Note> = store
            .select(|tx| get_by_index(tx, "Tag", &["a".to_string()]))
            .unwrap();
        assert!(stale.is_none());
    }

    #[test]
    fn test_stale_entry_owned_by_other_record_is_kept() {
        let store = store();
        store.update(|tx| save(tx, &note(1, 1, "shared")).map(|_| ())).unwrap();
        // Record 2 takes over the "shared" slot, then record 1 moves away.
        store.update(|tx| save(tx, &note(2, 2, "shared")).map(|_| ())).unwrap();
        store.update(|tx| save(tx, &note(1, 1, "other")).map(|_| ())).unwrap();

        let owner: Option<Note> = store
            .select(|tx| get_by_index(tx, "Tag", &["shared".to_string()]))
            .unwrap();
        assert_eq!(owner.map(|n| n.id), Some(2));
    }

    #[test]
    fn test_delete_removes_index_entries() {
        let store = store();
        store.update(|tx| save(tx, &note(1, 5, "a")).map(|_| ())).unwrap();
        let existed = store
            .update(|tx| delete::<Note>(tx, &1u64.encode_field()))
            .unwrap();
        assert!(existed);
        assert_eq!(index_len(&store, "Rank"), 0);
        assert_eq!(index_len(&store, "Tag"), 0);
        let again = store
            .update(|tx| delete::<Note>(tx, &1u64.encode_field()))
            .unwrap();
        assert!(!again);
    }

    #[test]
    fn test_range_is_ordered_and_inclusive() {
        let store = store();
        store
            .update(|tx| {
                for (id, rank) in [(1, 30), (2, 10), (3, 20), (4, 40)] {
                    save(tx, &note(id, rank, ""))?;
                }
                Ok::<_, RepositoryError>(())
            })
            .unwrap();

        let through = upper_bound(&[30u64.encode_field()]).unwrap();
        let got: Vec<Note> = store.select(|tx| range(tx, "Rank", b"", &through)).unwrap();
        let ranks: Vec<u64> = got.iter().map(|n| n.rank).collect();
        assert_eq!(ranks, vec![10, 20, 30]);
    }

    #[test]
    fn test_prefix_scan() {
        let store = store();
        store
            .update(|tx| {
                save(tx, &note(1, 7, ""))?;
                save(tx, &note(2, 7, ""))?;
                save(tx, &note(3, 8, ""))?;
                Ok::<_, RepositoryError>(())
            })
            .unwrap();
        let got: Vec<Note> = store
            .select(|tx| with_prefix(tx, "Rank", &[7u64.encode_field()]))
            .unwrap();
        assert_eq!(got.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_sequences_increment_per_entity() {
        let store = store();
        let ids = store
            .update(|tx| {
                Ok::<_, RepositoryError>((
                    next_sequence(tx, "Note")?,
                    next_sequence(tx, "Note")?,
                    next_sequence(tx, "Other")?,
                ))
            })
            .unwrap();
        assert_eq!(ids, (1, 2, 1));
    }

    #[test]
    fn test_unknown_index_rejected() {
        let store = store();
        let result: Result<Option<Note>, _> =
            store.select(|tx| get_by_index(tx, "Nope", &["x".to_string()]));
        assert!(matches!(result, Err(RepositoryError::UnknownIndex { .. })));
    }

    #[test]
    fn test_failed_save_rolls_back_all_writes() {
        let store = store();
        let result = store.update(|tx| {
            save(tx, &note(1, 1, "ok"))?;
            save(tx, &note(0, 2, "no key"))?;
            Ok::<_, RepositoryError>(())
        });
        assert!(matches!(result, Err(RepositoryError::Codec(_))));
        let got: Option<Note> = store.select(|tx| get(tx, &1u64.encode_field())).unwrap();
        assert!(got.is_none());
    }
}
