//! Item: one entry of one feed

use crate::codec::{self, field, schema, CodecError, Entity, FieldDef, FieldValue, IndexPos, Metadata, SchemaDef, Values};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::OnceLock;

pub const ENTITY: &str = "Item";
/// (FeedID, GUID): per-feed dedup lookup
pub const INDEX_GUID: &str = "GUID";

static SCHEMA: SchemaDef = SchemaDef {
    name: ENTITY,
    key: "ID",
    fields: &[
        FieldDef::plain("ID"),
        FieldDef::indexed("FeedID", &[IndexPos::new(INDEX_GUID, 1)]),
        FieldDef::indexed("GUID", &[IndexPos::new(INDEX_GUID, 2)]),
        FieldDef::plain("Created"),
        FieldDef::plain("Updated"),
        FieldDef::plain("URL"),
        FieldDef::plain("Author"),
        FieldDef::plain("Title"),
        FieldDef::plain("Content"),
        FieldDef::plain("Hash"),
    ],
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Item {
    pub id: u64,
    pub feed_id: u64,
    pub guid: String,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub url: String,
    pub author: String,
    pub title: String,
    pub content: String,
}

impl Item {
    pub fn new(feed_id: u64, guid: &str) -> Self {
        Item {
            feed_id,
            guid: guid.to_string(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> String {
        self.id.encode_field()
    }

    /// Fingerprint of the visible content, used to tell real updates from
    /// feeds that merely bump their timestamps.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.author.as_bytes());
        hasher.update(self.content.as_bytes());
        hasher.update(self.title.as_bytes());
        hasher.update(self.url.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Index tuple locating this item by feed and GUID.
    pub fn guid_key(feed_id: u64, guid: &str) -> Result<Vec<String>, CodecError> {
        codec::encode_fields(&[&feed_id, &guid.to_string()])
    }
}

/// Index items by GUID. Stored items are unique per GUID within a feed.
pub fn group_by_guid(items: Vec<Item>) -> HashMap<String, Item> {
    items.into_iter().map(|i| (i.guid.clone(), i)).collect()
}

impl Entity for Item {
    fn metadata() -> Result<&'static Metadata, CodecError> {
        static CELL: OnceLock<Result<Metadata, CodecError>> = OnceLock::new();
        schema::cached(&CELL, &SCHEMA)
    }

    fn to_values(&self) -> Result<Values, CodecError> {
        let mut values = Values::new();
        field::put(&mut values, "ID", &self.id);
        field::put(&mut values, "FeedID", &self.feed_id);
        field::put(&mut values, "GUID", &self.guid);
        field::put(&mut values, "Created", &self.created);
        field::put(&mut values, "Updated", &self.updated);
        field::put(&mut values, "URL", &self.url);
        field::put(&mut values, "Author", &self.author);
        field::put(&mut values, "Title", &self.title);
        field::put(&mut values, "Content", &self.content);
        field::put(&mut values, "Hash", &self.hash());
        Ok(values)
    }

    // Hash is derived and not read back.
    fn apply_values(&mut self, values: &Values) -> Result<(), CodecError> {
        self.id = field::get(values, ENTITY, "ID")?;
        self.feed_id = field::get(values, ENTITY, "FeedID")?;
        self.guid = field::get(values, ENTITY, "GUID")?;
        self.created = field::get(values, ENTITY, "Created")?;
        self.updated = field::get(values, ENTITY, "Updated")?;
        self.url = field::get(values, ENTITY, "URL")?;
        self.author = field::get(values, ENTITY, "Author")?;
        self.title = field::get(values, ENTITY, "Title")?;
        self.content = field::get(values, ENTITY, "Content")?;
        Ok(())
    }
}
