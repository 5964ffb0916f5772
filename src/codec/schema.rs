//! Static schema tables
//!
//! Each entity declares one `SchemaDef` constant: its name, the field holding
//! the primary key, and for every field the secondary indexes it belongs to
//! together with its 1-based position in each. `Metadata::from_def` turns the
//! table into the lookup form used by the codec and validates it.
//!
//! ```text
//! SchemaDef (static)  ──from_def──►  Metadata (cached in a OnceLock)
//!   fields[i].indexes                  indexes: name → [field; N]
//! ```

use super::CodecError;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Membership of one field in one index.
#[derive(Debug, Clone, Copy)]
pub struct IndexPos {
    pub index: &'static str,
    pub position: usize,
}

impl IndexPos {
    pub const fn new(index: &'static str, position: usize) -> Self {
        IndexPos { index, position }
    }
}

/// One field of an entity.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub indexes: &'static [IndexPos],
}

impl FieldDef {
    /// A field that participates in no index.
    pub const fn plain(name: &'static str) -> Self {
        FieldDef { name, indexes: &[] }
    }

    pub const fn indexed(name: &'static str, indexes: &'static [IndexPos]) -> Self {
        FieldDef { name, indexes }
    }
}

/// Declarative schema table for an entity type.
#[derive(Debug, Clone, Copy)]
pub struct SchemaDef {
    pub name: &'static str,
    pub key: &'static str,
    pub fields: &'static [FieldDef],
}

/// Validated entity metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: &'static str,
    pub key: &'static str,
    pub fields: Vec<&'static str>,
    /// index name → participating fields, ordered by position
    pub indexes: BTreeMap<&'static str, Vec<&'static str>>,
}

impl Metadata {
    /// Build and validate metadata from a schema table.
    ///
    /// Fails if the key field is not declared, or if any index's positions
    /// are not exactly `1..=N`.
    pub fn from_def(def: &SchemaDef) -> Result<Self, CodecError> {
        let fields: Vec<&'static str> = def.fields.iter().map(|f| f.name).collect();
        if !fields.contains(&def.key) {
            return Err(CodecError::UnknownField {
                entity: def.name,
                field: def.key.to_string(),
            });
        }

        let mut positions: BTreeMap<&'static str, Vec<(usize, &'static str)>> = BTreeMap::new();
        for field in def.fields {
            for member in field.indexes {
                positions
                    .entry(member.index)
                    .or_default()
                    .push((member.position, field.name));
            }
        }

        let mut indexes = BTreeMap::new();
        for (index, mut members) in positions {
            members.sort_by_key(|(pos, _)| *pos);
            let contiguous = members
                .iter()
                .enumerate()
                .all(|(i, (pos, _))| *pos == i + 1);
            if !contiguous {
                return Err(CodecError::NonContiguousIndex {
                    entity: def.name,
                    index,
                });
            }
            indexes.insert(index, members.into_iter().map(|(_, f)| f).collect());
        }

        Ok(Metadata {
            name: def.name,
            key: def.key,
            fields,
            indexes,
        })
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| *f == name)
    }

    /// Fields of `index`, in position order.
    pub fn index_fields(&self, index: &str) -> Option<&[&'static str]> {
        self.indexes.get(index).map(Vec::as_slice)
    }
}

/// Resolve a schema table through a per-type cache cell.
///
/// The table is validated on first use; later calls return the cached
/// result, including a cached validation error.
pub fn cached(
    cell: &'static OnceLock<Result<Metadata, CodecError>>,
    def: &SchemaDef,
) -> Result<&'static Metadata, CodecError> {
    cell.get_or_init(|| Metadata::from_def(def))
        .as_ref()
        .map_err(Clone::clone)
}
