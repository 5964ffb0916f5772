//! Entity Codec
//!
//! Maps typed records onto the flat form the store understands:
//!
//! ```text
//! record ──encode──► Data { key, values: field → string, indexes: name → tuple }
//!        ◄─decode── values
//! ```
//!
//! The primary key and every index tuple are derived from `values` through the
//! entity's `Metadata`, so `data_from` can rebuild them from a stored blob
//! without the typed record (used to diff old and new index entries).

pub mod field;
pub mod schema;

pub use field::{FieldValue, TIMESTAMP_FORMAT};
pub use schema::{FieldDef, IndexPos, Metadata, SchemaDef};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Field name → encoded value.
pub type Values = BTreeMap<String, String>;

/// Separator between segments of a composite index key.
pub const SEGMENT_SEPARATOR: u8 = 0x00;

/// Error type for codec operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The key field encoded to an empty string
    MissingKey { entity: &'static str },
    /// Index positions are not 1..N
    NonContiguousIndex {
        entity: &'static str,
        index: &'static str,
    },
    /// Decode target is shared and cannot be mutated in place
    NonAddressable { entity: &'static str },
    /// Field name not declared in the schema
    UnknownField { entity: &'static str, field: String },
    /// Stored value does not parse as the field's type
    InvalidValue {
        entity: &'static str,
        field: &'static str,
        message: String,
    },
    /// Index segment contains the separator byte
    InvalidSegment { segment: String },
    /// Values blob or embedded record could not be (de)serialized
    Serialization(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::MissingKey { entity } => write!(f, "Empty primary key for {}", entity),
            CodecError::NonContiguousIndex { entity, index } => write!(
                f,
                "Non-contiguous index names for entity {}, index {}",
                entity, index
            ),
            CodecError::NonAddressable { entity } => {
                write!(f, "Cannot decode {} into a non-addressable value", entity)
            }
            CodecError::UnknownField { entity, field } => {
                write!(f, "Invalid field name for {}: {}", entity, field)
            }
            CodecError::InvalidValue {
                entity,
                field,
                message,
            } => write!(f, "Invalid value for {}.{}: {}", entity, field, message),
            CodecError::InvalidSegment { segment } => {
                write!(f, "Index segment contains separator: {:?}", segment)
            }
            CodecError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// A record type with a static schema table.
pub trait Entity: Default + Send + 'static {
    /// Validated metadata, cached per type.
    fn metadata() -> Result<&'static Metadata, CodecError>;

    /// Every declared field, string-encoded.
    fn to_values(&self) -> Result<Values, CodecError>;

    /// Overwrite fields from `values`; absent fields take their zero value.
    fn apply_values(&mut self, values: &Values) -> Result<(), CodecError>;
}

/// Encoded form of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub name: &'static str,
    pub key: String,
    pub values: Values,
    pub indexes: BTreeMap<&'static str, Vec<String>>,
}

impl Data {
    /// Index tuple for `index`, empty if not declared.
    pub fn index(&self, index: &str) -> &[String] {
        self.indexes.get(index).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Encode a record into its key, values and index tuples.
pub fn encode<E: Entity>(record: &E) -> Result<(&'static Metadata, Data), CodecError> {
    let metadata = E::metadata()?;
    let values = record.to_values()?;
    let data = data_from(metadata, values);
    if data.key.is_empty() {
        return Err(CodecError::MissingKey {
            entity: metadata.name,
        });
    }
    Ok((metadata, data))
}

/// Decode `values` into an existing record.
pub fn decode<E: Entity>(target: &mut E, values: &Values) -> Result<(), CodecError> {
    let metadata = E::metadata()?;
    if let Some(unknown) = values.keys().find(|k| !metadata.has_field(k)) {
        return Err(CodecError::UnknownField {
            entity: metadata.name,
            field: unknown.clone(),
        });
    }
    target.apply_values(values)
}

/// Decode into a shared record. Fails when other owners hold the record,
/// since it cannot be mutated in place.
pub fn decode_shared<E: Entity + Sync>(
    target: &mut Arc<E>,
    values: &Values,
) -> Result<(), CodecError> {
    let metadata = E::metadata()?;
    match Arc::get_mut(target) {
        Some(record) => decode(record, values),
        None => Err(CodecError::NonAddressable {
            entity: metadata.name,
        }),
    }
}

/// Build `Data` from already-encoded values.
pub fn data_from(metadata: &'static Metadata, values: Values) -> Data {
    let key = values.get(metadata.key).cloned().unwrap_or_default();
    let indexes = metadata
        .indexes
        .iter()
        .map(|(name, fields)| {
            let tuple = fields
                .iter()
                .map(|f| values.get(*f).cloned().unwrap_or_default())
                .collect();
            (*name, tuple)
        })
        .collect();
    Data {
        name: metadata.name,
        key,
        values,
        indexes,
    }
}

/// Whether `segment` can appear in an index tuple.
pub fn is_indexable(segment: &str) -> bool {
    !segment.as_bytes().contains(&SEGMENT_SEPARATOR)
}

/// Encode ad-hoc values into an index tuple, e.g. a scan bound.
pub fn encode_fields(fields: &[&dyn FieldValue]) -> Result<Vec<String>, CodecError> {
    fields
        .iter()
        .map(|f| {
            let segment = f.encode_field();
            if !is_indexable(&segment) {
                Err(CodecError::InvalidSegment { segment })
            } else {
                Ok(segment)
            }
        })
        .collect()
}

/// Join index segments into a store key.
pub fn index_key(segments: &[String]) -> Result<Vec<u8>, CodecError> {
    let mut key = Vec::with_capacity(segments.iter().map(|s| s.len() + 1).sum());
    for (i, segment) in segments.iter().enumerate() {
        if !is_indexable(segment) {
            return Err(CodecError::InvalidSegment {
                segment: segment.clone(),
            });
        }
        if i > 0 {
            key.push(SEGMENT_SEPARATOR);
        }
        key.extend_from_slice(segment.as_bytes());
    }
    Ok(key)
}

/// Serialize values for the primary bucket. Empty values are omitted.
pub fn values_to_blob(values: &Values) -> Result<Vec<u8>, CodecError> {
    let compact: BTreeMap<&String, &String> = values.iter().filter(|(_, v)| !v.is_empty()).collect();
    bincode::serialize(&compact).map_err(|e| CodecError::Serialization(e.to_string()))
}

pub fn values_from_blob(blob: &[u8]) -> Result<Values, CodecError> {
    bincode::deserialize(blob).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::OnceLock;

    static EVENT_SCHEMA: SchemaDef = SchemaDef {
        name: "Event",
        key: "ID",
        fields: &[
            FieldDef::indexed("ID", &[IndexPos::new("Time", 2)]),
            FieldDef::indexed("At", &[IndexPos::new("Time", 1)]),
            FieldDef::indexed("Label", &[IndexPos::new("Label", 1)]),
            FieldDef::plain("Weight"),
        ],
    };

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Event {
        id: u64,
        at: Option<DateTime<Utc>>,
        label: String,
        weight: f64,
    }

    impl Entity for Event {
        fn metadata() -> Result<&'static Metadata, CodecError> {
            static CELL: OnceLock<Result<Metadata, CodecError>> = OnceLock::new();
            schema::cached(&CELL, &EVENT_SCHEMA)
        }

        fn to_values(&self) -> Result<Values, CodecError> {
            let mut values = Values::new();
            field::put(&mut values, "ID", &self.id);
            field::put(&mut values, "At", &self.at);
            field::put(&mut values, "Label", &self.label);
            field::put(&mut values, "Weight", &self.weight);
            Ok(values)
        }

        fn apply_values(&mut self, values: &Values) -> Result<(), CodecError> {
            self.id = field::get(values, "Event", "ID")?;
            self.at = field::get(values, "Event", "At")?;
            self.label = field::get(values, "Event", "Label")?;
            self.weight = field::get(values, "Event", "Weight")?;
            Ok(())
        }
    }

    static BROKEN_SCHEMA: SchemaDef = SchemaDef {
        name: "Broken",
        key: "ID",
        fields: &[
            FieldDef::indexed("ID", &[IndexPos::new("Pair", 1)]),
            FieldDef::indexed("Other", &[IndexPos::new("Pair", 3)]),
        ],
    };

    #[derive(Debug, Default)]
    struct Broken {
        id: u64,
    }

    impl Entity for Broken {
        fn metadata() -> Result<&'static Metadata, CodecError> {
            static CELL: OnceLock<Result<Metadata, CodecError>> = OnceLock::new();
            schema::cached(&CELL, &BROKEN_SCHEMA)
        }

        fn to_values(&self) -> Result<Values, CodecError> {
            let mut values = Values::new();
            field::put(&mut values, "ID", &self.id);
            Ok(values)
        }

        fn apply_values(&mut self, values: &Values) -> Result<(), CodecError> {
            self.id = field::get(values, "Broken", "ID")?;
            Ok(())
        }
    }

    fn sample() -> Event {
        Event {
            id: 42,
            at: Some(
                Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()
                    + ChronoDuration::nanoseconds(987_654_321),
            ),
            label: "alpha".to_string(),
            weight: 0.25,
        }
    }

    #[test]
    fn test_encode_decode_preserves_every_field() {
        let event = sample();
        let (_, data) = encode(&event).unwrap();

        let mut decoded = Event::default();
        decode(&mut decoded, &data.values).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_index_tuples_follow_declared_order() {
        let event = sample();
        let (meta, data) = encode(&event).unwrap();
        assert_eq!(meta.name, "Event");
        assert_eq!(data.key, 42u64.encode_field());
        assert_eq!(
            data.index("Time"),
            &[event.at.encode_field(), 42u64.encode_field()]
        );
        assert_eq!(data.index("Label"), &["alpha".to_string()]);
    }

    #[test]
    fn test_missing_key_fails() {
        let event = Event {
            id: 0,
            ..sample()
        };
        assert_eq!(
            encode(&event).unwrap_err(),
            CodecError::MissingKey { entity: "Event" }
        );
    }

    #[test]
    fn test_non_contiguous_schema_fails_encode() {
        let err = encode(&Broken { id: 1 }).unwrap_err();
        assert_eq!(
            err,
            CodecError::NonContiguousIndex {
                entity: "Broken",
                index: "Pair"
            }
        );
        assert_eq!(
            err.to_string(),
            "Non-contiguous index names for entity Broken, index Pair"
        );
    }

    #[test]
    fn test_decode_rejects_unknown_field() {
        let mut values = Values::new();
        values.insert("Bogus".to_string(), "1".to_string());
        let mut event = Event::default();
        assert!(matches!(
            decode(&mut event, &values),
            Err(CodecError::UnknownField { entity: "Event", .. })
        ));
    }

    #[test]
    fn test_decode_shared_requires_sole_owner() {
        let (_, data) = encode(&sample()).unwrap();

        let mut owned = Arc::new(Event::default());
        decode_shared(&mut owned, &data.values).unwrap();
        assert_eq!(owned.label, "alpha");

        let mut shared = Arc::new(Event::default());
        let _other = Arc::clone(&shared);
        assert_eq!(
            decode_shared(&mut shared, &data.values).unwrap_err(),
            CodecError::NonAddressable { entity: "Event" }
        );
    }

    #[test]
    fn test_data_from_rebuilds_indexes_from_stored_values() {
        let (meta, data) = encode(&sample()).unwrap();
        let blob = values_to_blob(&data.values).unwrap();
        let restored = data_from(meta, values_from_blob(&blob).unwrap());
        assert_eq!(restored.key, data.key);
        assert_eq!(restored.indexes, data.indexes);
    }

    #[test]
    fn test_encode_fields_and_index_key() {
        let at = sample().at;
        let tuple = encode_fields(&[&at, &7u64]).unwrap();
        let key = index_key(&tuple).unwrap();
        assert_eq!(key.iter().filter(|b| **b == SEGMENT_SEPARATOR).count(), 1);

        let bad = "a\u{0}b".to_string();
        assert!(matches!(
            encode_fields(&[&bad]),
            Err(CodecError::InvalidSegment { .. })
        ));
    }
}
