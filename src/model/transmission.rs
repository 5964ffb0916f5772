//! Transmission: one fetch attempt

use crate::codec::{self, field, schema, CodecError, Entity, FieldDef, FieldValue, IndexPos, Metadata, SchemaDef, Values};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

pub const ENTITY: &str = "Transmission";
/// (FeedID, StartTime, ID): a feed's attempts in time order
pub const INDEX_FEED_TIME: &str = "FeedTime";
/// (StartTime, ID): all attempts in time order
pub const INDEX_TIME: &str = "Time";

static SCHEMA: SchemaDef = SchemaDef {
    name: ENTITY,
    key: "ID",
    fields: &[
        FieldDef::indexed(
            "ID",
            &[IndexPos::new(INDEX_FEED_TIME, 3), IndexPos::new(INDEX_TIME, 2)],
        ),
        FieldDef::indexed("FeedID", &[IndexPos::new(INDEX_FEED_TIME, 1)]),
        FieldDef::indexed(
            "StartTime",
            &[IndexPos::new(INDEX_FEED_TIME, 2), IndexPos::new(INDEX_TIME, 1)],
        ),
        FieldDef::plain("URL"),
        FieldDef::plain("Duration"),
        FieldDef::plain("Result"),
        FieldDef::plain("ResultMessage"),
        FieldDef::plain("UpdateCheck"),
        FieldDef::plain("Updated"),
        FieldDef::plain("StatusCode"),
        FieldDef::plain("ContentLength"),
        FieldDef::plain("ContentType"),
        FieldDef::plain("ETag"),
        FieldDef::plain("LastModified"),
        FieldDef::plain("Gzip"),
        FieldDef::plain("Flavor"),
        FieldDef::plain("Generator"),
        FieldDef::plain("Title"),
        FieldDef::plain("LastUpdated"),
        FieldDef::plain("ItemCount"),
        FieldDef::plain("NewItems"),
    ],
};

/// Outcome of a fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    #[serde(rename = "OK")]
    Ok,
    /// Permanent redirect; the feed URL was updated
    #[serde(rename = "MV")]
    Redirect,
    /// Transport failure before a response arrived
    #[serde(rename = "EC")]
    ClientError,
    /// HTTP status >= 400
    #[serde(rename = "ES")]
    ServerError,
    /// Document could not be parsed
    #[serde(rename = "FP")]
    ParseError,
    /// Document parsed but carried unusable dates
    #[serde(rename = "FT")]
    TimeError,
}

impl ResultCode {
    pub fn code(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::Redirect => "MV",
            ResultCode::ClientError => "EC",
            ResultCode::ServerError => "ES",
            ResultCode::ParseError => "FP",
            ResultCode::TimeError => "FT",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "OK" => Some(ResultCode::Ok),
            "MV" => Some(ResultCode::Redirect),
            "EC" => Some(ResultCode::ClientError),
            "ES" => Some(ResultCode::ServerError),
            "FP" => Some(ResultCode::ParseError),
            "FT" => Some(ResultCode::TimeError),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, ResultCode::Ok | ResultCode::Redirect)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl FieldValue for Option<ResultCode> {
    fn encode_field(&self) -> String {
        self.map(|r| r.code().to_string()).unwrap_or_default()
    }

    fn decode_field(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Ok(None);
        }
        ResultCode::from_code(raw)
            .map(Some)
            .ok_or_else(|| format!("unknown result code {:?}", raw))
    }
}

/// How an attempt decided whether content changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateCheck {
    /// Server answered 304 Not Modified
    #[serde(rename = "NM")]
    Http304,
    /// Full document fetched and its entries inspected
    #[serde(rename = "LU")]
    FeedInspection,
}

impl UpdateCheck {
    pub fn code(&self) -> &'static str {
        match self {
            UpdateCheck::Http304 => "NM",
            UpdateCheck::FeedInspection => "LU",
        }
    }
}

impl FieldValue for Option<UpdateCheck> {
    fn encode_field(&self) -> String {
        self.map(|u| u.code().to_string()).unwrap_or_default()
    }

    fn decode_field(raw: &str) -> Result<Self, String> {
        match raw {
            "" => Ok(None),
            "NM" => Ok(Some(UpdateCheck::Http304)),
            "LU" => Ok(Some(UpdateCheck::FeedInspection)),
            other => Err(format!("unknown update check {:?}", other)),
        }
    }
}

/// Log record of one fetch attempt. Append-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transmission {
    pub id: u64,
    pub feed_id: u64,
    pub url: String,
    pub start_time: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub result: Option<ResultCode>,
    pub result_message: String,
    pub update_check: Option<UpdateCheck>,
    /// Whether the attempt brought new or changed content
    pub updated: bool,

    // HTTP
    pub status_code: u16,
    pub content_length: u64,
    pub content_type: String,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub gzip: bool,

    // Feed document as seen by this attempt
    pub flavor: String,
    pub generator: String,
    pub title: String,
    pub last_updated: Option<DateTime<Utc>>,

    pub item_count: u32,
    pub new_items: u32,
}

impl Transmission {
    pub fn new(feed_id: u64, url: &str, start_time: DateTime<Utc>) -> Self {
        Transmission {
            feed_id,
            url: url.to_string(),
            start_time: Some(start_time),
            ..Default::default()
        }
    }

    /// Key of this record in the primary bucket.
    pub fn key(&self) -> String {
        self.id.encode_field()
    }
}

impl Entity for Transmission {
    fn metadata() -> Result<&'static Metadata, CodecError> {
        static CELL: OnceLock<Result<Metadata, CodecError>> = OnceLock::new();
        schema::cached(&CELL, &SCHEMA)
    }

    fn to_values(&self) -> Result<Values, CodecError> {
        let mut values = Values::new();
        field::put(&mut values, "ID", &self.id);
        field::put(&mut values, "FeedID", &self.feed_id);
        field::put(&mut values, "StartTime", &self.start_time);
        field::put(&mut values, "URL", &self.url);
        field::put(&mut values, "Duration", &self.duration);
        field::put(&mut values, "Result", &self.result);
        field::put(&mut values, "ResultMessage", &self.result_message);
        field::put(&mut values, "UpdateCheck", &self.update_check);
        field::put(&mut values, "Updated", &self.updated);
        field::put(&mut values, "StatusCode", &self.status_code);
        field::put(&mut values, "ContentLength", &self.content_length);
        field::put(&mut values, "ContentType", &self.content_type);
        field::put(&mut values, "ETag", &self.etag);
        field::put(&mut values, "LastModified", &self.last_modified);
        field::put(&mut values, "Gzip", &self.gzip);
        field::put(&mut values, "Flavor", &self.flavor);
        field::put(&mut values, "Generator", &self.generator);
        field::put(&mut values, "Title", &self.title);
        field::put(&mut values, "LastUpdated", &self.last_updated);
        field::put(&mut values, "ItemCount", &self.item_count);
        field::put(&mut values, "NewItems", &self.new_items);
        Ok(values)
    }

    fn apply_values(&mut self, values: &Values) -> Result<(), CodecError> {
        self.id = field::get(values, ENTITY, "ID")?;
        self.feed_id = field::get(values, ENTITY, "FeedID")?;
        self.start_time = field::get(values, ENTITY, "StartTime")?;
        self.url = field::get(values, ENTITY, "URL")?;
        self.duration = field::get(values, ENTITY, "Duration")?;
        self.result = field::get(values, ENTITY, "Result")?;
        self.result_message = field::get(values, ENTITY, "ResultMessage")?;
        self.update_check = field::get(values, ENTITY, "UpdateCheck")?;
        self.updated = field::get(values, ENTITY, "Updated")?;
        self.status_code = field::get(values, ENTITY, "StatusCode")?;
        self.content_length = field::get(values, ENTITY, "ContentLength")?;
        self.content_type = field::get(values, ENTITY, "ContentType")?;
        self.etag = field::get(values, ENTITY, "ETag")?;
        self.last_modified = field::get(values, ENTITY, "LastModified")?;
        self.gzip = field::get(values, ENTITY, "Gzip")?;
        self.flavor = field::get(values, ENTITY, "Flavor")?;
        self.generator = field::get(values, ENTITY, "Generator")?;
        self.title = field::get(values, ENTITY, "Title")?;
        self.last_updated = field::get(values, ENTITY, "LastUpdated")?;
        self.item_count = field::get(values, ENTITY, "ItemCount")?;
        self.new_items = field::get(values, ENTITY, "NewItems")?;
        Ok(())
    }
}

/// Index tuple of a feed's attempts from `since` onward.
pub fn feed_time_bound(feed_id: u64, since: Option<DateTime<Utc>>) -> Result<Vec<String>, CodecError> {
    codec::encode_fields(&[&feed_id, &since])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Transmission {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Transmission {
            id: 7,
            result: Some(ResultCode::TimeError),
            update_check: Some(UpdateCheck::FeedInspection),
            status_code: 200,
            duration: Duration::from_millis(350),
            gzip: true,
            item_count: 3,
            ..Transmission::new(2, "http://example.com/feed", start)
        }
    }

    #[test]
    fn test_codec_preserves_every_field() {
        let t = sample();
        let (_, data) = codec::encode(&t).unwrap();
        let mut back = Transmission::default();
        codec::decode(&mut back, &data.values).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_indexes_follow_declared_order() {
        let t = sample();
        let (_, data) = codec::encode(&t).unwrap();
        assert_eq!(
            data.index(INDEX_FEED_TIME),
            &[2u64.encode_field(), t.start_time.encode_field(), 7u64.encode_field()]
        );
        assert_eq!(
            data.index(INDEX_TIME),
            &[t.start_time.encode_field(), 7u64.encode_field()]
        );
    }

    #[test]
    fn test_result_codes_round_trip_through_field() {
        for code in ["OK", "MV", "EC", "ES", "FP", "FT"] {
            let parsed = Option::<ResultCode>::decode_field(code).unwrap();
            assert_eq!(parsed.encode_field(), code);
        }
        assert!(Option::<ResultCode>::decode_field("??").is_err());
        assert!(ResultCode::ServerError.is_error());
        assert!(!ResultCode::Redirect.is_error());
    }

    #[test]
    fn test_embeds_as_json() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"result\":\"FT\""));
        let back: Transmission = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample());
    }
}
