//! Feed: the scheduling unit

use super::backoff;
use super::transmission::{ResultCode, Transmission};
use crate::codec::{field, schema, CodecError, Entity, FieldDef, FieldValue, IndexPos, Metadata, SchemaDef, Values};
use chrono::{DateTime, SubsecRound, Utc};
use std::sync::OnceLock;

pub const ENTITY: &str = "Feed";
/// (NextFetch, ID): the scheduling index
pub const INDEX_NEXT_FETCH: &str = "NextFetch";
/// (URL): uniqueness lookup
pub const INDEX_URL: &str = "URL";

static SCHEMA: SchemaDef = SchemaDef {
    name: ENTITY,
    key: "ID",
    fields: &[
        FieldDef::indexed("ID", &[IndexPos::new(INDEX_NEXT_FETCH, 2)]),
        FieldDef::indexed("URL", &[IndexPos::new(INDEX_URL, 1)]),
        FieldDef::plain("Title"),
        FieldDef::plain("Flavor"),
        FieldDef::plain("Generator"),
        FieldDef::plain("Icon"),
        FieldDef::plain("Hub"),
        FieldDef::plain("SiteURL"),
        FieldDef::plain("ETag"),
        FieldDef::plain("LastModified"),
        FieldDef::plain("LastUpdated"),
        FieldDef::indexed("NextFetch", &[IndexPos::new(INDEX_NEXT_FETCH, 1)]),
        FieldDef::plain("Last"),
        FieldDef::plain("Last200"),
        FieldDef::plain("Status"),
        FieldDef::plain("StatusMessage"),
        FieldDef::plain("StatusSince"),
    ],
};

/// A subscribed feed and its fetch state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feed {
    pub id: u64,
    pub url: String,
    pub title: String,
    pub flavor: String,
    pub generator: String,
    pub icon: String,
    pub hub: String,
    pub site_url: String,
    /// Conditional-request validators from the last good response
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
    /// Most recent content change observed
    pub last_updated: Option<DateTime<Utc>>,
    pub next_fetch: Option<DateTime<Utc>>,
    /// Most recent attempt
    pub last: Option<Transmission>,
    /// Most recent attempt that returned content
    pub last200: Option<Transmission>,
    pub status: Option<ResultCode>,
    pub status_message: String,
    pub status_since: Option<DateTime<Utc>>,
}

impl Feed {
    /// New feed, due immediately.
    pub fn new(url: &str, now: DateTime<Utc>) -> Self {
        Feed {
            url: url.to_string(),
            next_fetch: Some(now.trunc_subsecs(0)),
            ..Default::default()
        }
    }

    /// Key of this record in the primary bucket.
    pub fn key(&self) -> String {
        self.id.encode_field()
    }

    /// Record the outcome of an attempt. `status_since` only moves when the
    /// status changes.
    pub fn set_status(&mut self, result: ResultCode, message: &str, now: DateTime<Utc>) {
        if self.status != Some(result) || self.status_since.is_none() {
            self.status_since = Some(now);
        }
        self.status = Some(result);
        self.status_message = message.to_string();
    }

    /// Interval until the next attempt, given the current status.
    pub fn fetch_interval(&self, now: DateTime<Utc>) -> chrono::Duration {
        match self.status {
            Some(ResultCode::Redirect) => backoff::redirect_interval(),
            Some(code) if code.is_error() => {
                backoff::fetch_interval(backoff::elapsed(self.status_since, now))
            }
            _ => backoff::fetch_interval(backoff::elapsed(self.last_updated, now)),
        }
    }

    /// Reschedule from `now` according to the current status.
    pub fn schedule_next_fetch(&mut self, now: DateTime<Utc>) {
        let interval = self.fetch_interval(now);
        self.next_fetch = Some(backoff::next_fetch(now, interval));
    }

    /// Push `next_fetch` to exactly `interval` after `now`.
    pub fn adjust_fetch_time(&mut self, now: DateTime<Utc>, interval: chrono::Duration) {
        self.next_fetch = Some(backoff::next_fetch(now, interval));
    }
}

impl Entity for Feed {
    fn metadata() -> Result<&'static Metadata, CodecError> {
        static CELL: OnceLock<Result<Metadata, CodecError>> = OnceLock::new();
        schema::cached(&CELL, &SCHEMA)
    }

    fn to_values(&self) -> Result<Values, CodecError> {
        let mut values = Values::new();
        field::put(&mut values, "ID", &self.id);
        field::put(&mut values, "URL", &self.url);
        field::put(&mut values, "Title", &self.title);
        field::put(&mut values, "Flavor", &self.flavor);
        field::put(&mut values, "Generator", &self.generator);
        field::put(&mut values, "Icon", &self.icon);
        field::put(&mut values, "Hub", &self.hub);
        field::put(&mut values, "SiteURL", &self.site_url);
        field::put(&mut values, "ETag", &self.etag);
        field::put(&mut values, "LastModified", &self.last_modified);
        field::put(&mut values, "LastUpdated", &self.last_updated);
        field::put(&mut values, "NextFetch", &self.next_fetch);
        field::put_json(&mut values, "Last", &self.last)?;
        field::put_json(&mut values, "Last200", &self.last200)?;
        field::put(&mut values, "Status", &self.status);
        field::put(&mut values, "StatusMessage", &self.status_message);
        field::put(&mut values, "StatusSince", &self.status_since);
        Ok(values)
    }

    fn apply_values(&mut self, values: &Values) -> Result<(), CodecError> {
        self.id = field::get(values, ENTITY, "ID")?;
        self.url = field::get(values, ENTITY, "URL")?;
        self.title = field::get(values, ENTITY, "Title")?;
        self.flavor = field::get(values, ENTITY, "Flavor")?;
        self.generator = field::get(values, ENTITY, "Generator")?;
        self.icon = field::get(values, ENTITY, "Icon")?;
        self.hub = field::get(values, ENTITY, "Hub")?;
        self.site_url = field::get(values, ENTITY, "SiteURL")?;
        self.etag = field::get(values, ENTITY, "ETag")?;
        self.last_modified = field::get(values, ENTITY, "LastModified")?;
        self.last_updated = field::get(values, ENTITY, "LastUpdated")?;
        self.next_fetch = field::get(values, ENTITY, "NextFetch")?;
        self.last = field::get_json(values, ENTITY, "Last")?;
        self.last200 = field::get_json(values, ENTITY, "Last200")?;
        self.status = field::get(values, ENTITY, "Status")?;
        self.status_message = field::get(values, ENTITY, "StatusMessage")?;
        self.status_since = field::get(values, ENTITY, "StatusSince")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn ok_feed(last_updated: DateTime<Utc>) -> Feed {
        let mut feed = Feed::new("http://example.com/feed", now());
        feed.id = 1;
        feed.last_updated = Some(last_updated);
        feed.set_status(ResultCode::Ok, "", now());
        feed
    }

    #[test]
    fn test_backoff_after_success() {
        for (age, expected) in [
            (Duration::minutes(20), Duration::minutes(10)),
            (Duration::hours(10), Duration::hours(1)),
            (Duration::hours(100), Duration::hours(24)),
        ] {
            let mut feed = ok_feed(now() - age);
            feed.schedule_next_fetch(now());
            assert_eq!(feed.next_fetch, Some(now() + expected), "age {:?}", age);
        }
    }

    #[test]
    fn test_redirect_always_one_second() {
        for age in [Duration::minutes(1), Duration::hours(100)] {
            let mut feed = ok_feed(now() - age);
            feed.set_status(ResultCode::Redirect, "moved", now());
            feed.schedule_next_fetch(now());
            assert_eq!(feed.next_fetch, Some(now() + Duration::seconds(1)));
        }
    }

    #[test]
    fn test_errors_back_off_from_status_since() {
        let mut feed = ok_feed(now() - Duration::minutes(5));
        feed.set_status(ResultCode::ServerError, "503", now() - Duration::hours(100));
        // Repeating the same error keeps the original start of the error state.
        feed.set_status(ResultCode::ServerError, "503", now());
        assert_eq!(feed.status_since, Some(now() - Duration::hours(100)));
        feed.schedule_next_fetch(now());
        assert_eq!(feed.next_fetch, Some(now() + Duration::hours(24)));
    }

    #[test]
    fn test_codec_preserves_embedded_transmissions() {
        let mut feed = ok_feed(now());
        feed.last = Some(Transmission::new(1, &feed.url, now()));
        let (_, data) = codec::encode(&feed).unwrap();
        let mut back = Feed::default();
        codec::decode(&mut back, &data.values).unwrap();
        assert_eq!(back, feed);
        assert_eq!(
            data.index(INDEX_NEXT_FETCH),
            &[feed.next_fetch.encode_field(), 1u64.encode_field()]
        );
    }

    #[test]
    fn test_new_feed_without_id_cannot_encode() {
        let feed = Feed::new("http://example.com/", now());
        assert_eq!(
            codec::encode(&feed).unwrap_err(),
            CodecError::MissingKey { entity: "Feed" }
        );
    }
}
