//! Response → Harvest mapping
//!
//! Pure: takes what came back from the network (or the transport error) and
//! produces the Harvest, so the mapping is testable without a server.
//!
//! | Outcome                    | Result | Update check   |
//! |----------------------------|--------|----------------|
//! | transport error            | EC     |                |
//! | 301 / 308                  | MV     |                |
//! | 304                        | OK     | NM             |
//! | 200, parsed                | OK     | LU             |
//! | 200, bad date              | FT     |                |
//! | 200, unparseable           | FP     |                |
//! | >= 400 or other            | ES     |                |

use crate::codec;
use crate::model::{Feed, Harvest, Item, ResultCode, Transmission, UpdateCheck};
use crate::parser::{ParseError, ParsedFeed, ParserSet, REL_ALTERNATE, REL_HUB, REL_ICON};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use std::io::Read;
use tracing::debug;

/// Response headers the mapping cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub content_type: String,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub location: String,
    /// `Content-Encoding: gzip`
    pub gzip: bool,
    /// Body was longer than the fetch limit and was not kept
    pub oversized: bool,
}

/// What the network produced for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Transport(String),
    Response {
        status: u16,
        meta: ResponseMeta,
        body: Bytes,
    },
}

/// Build the Harvest for one attempt on `feed`.
///
/// Bodies longer than `max_body` bytes, before or after gzip inflation, are
/// rejected as unparseable.
pub fn build_harvest(
    mut feed: Feed,
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
    outcome: Outcome,
    parsers: &ParserSet,
    max_body: usize,
) -> Harvest {
    let mut t = Transmission::new(feed.id, &feed.url, started);
    let mut items = Vec::new();

    match outcome {
        Outcome::Transport(message) => {
            t.result = Some(ResultCode::ClientError);
            t.result_message = message;
        }
        Outcome::Response { status, meta, body } => {
            t.status_code = status;
            match status {
                301 | 308 if !meta.location.is_empty() => {
                    t.result = Some(ResultCode::Redirect);
                    t.result_message = format!("{} moved {}", feed.url, meta.location);
                    feed.url = meta.location;
                }
                304 => {
                    t.result = Some(ResultCode::Ok);
                    t.update_check = Some(UpdateCheck::Http304);
                    t.etag = meta.etag;
                    t.last_modified = meta.last_modified;
                }
                200 => {
                    t.content_type = meta.content_type.clone();
                    t.etag = meta.etag.clone();
                    t.last_modified = meta.last_modified;
                    t.gzip = meta.gzip;
                    match decode_body(&meta, body, max_body).and_then(|b| {
                        let len = b.len() as u64;
                        parsers.parse(&meta.content_type, &b).map(|p| (len, p))
                    }) {
                        Ok((len, parsed)) => {
                            t.result = Some(ResultCode::Ok);
                            t.update_check = Some(UpdateCheck::FeedInspection);
                            t.content_length = len;
                            t.flavor = parsed.flavor.clone();
                            t.generator = parsed.generator.clone();
                            t.title = parsed.title.clone();
                            feed.etag = meta.etag;
                            feed.last_modified = meta.last_modified;
                            items = adopt(&mut feed, parsed);
                        }
                        Err(ParseError::Time(message)) => {
                            t.result = Some(ResultCode::TimeError);
                            t.result_message = message;
                        }
                        Err(e) => {
                            t.result = Some(ResultCode::ParseError);
                            t.result_message = e.to_string();
                        }
                    }
                }
                _ => {
                    t.result = Some(ResultCode::ServerError);
                    t.result_message = format!("HTTP status {}", status);
                }
            }
        }
    }

    t.duration = (finished - started).to_std().unwrap_or_default();
    let result = t.result.unwrap_or(ResultCode::ServerError);
    feed.set_status(result, &t.result_message, finished);

    Harvest {
        feed,
        transmission: t,
        items,
    }
}

fn decode_body(meta: &ResponseMeta, body: Bytes, max_body: usize) -> Result<Bytes, ParseError> {
    let too_large = || ParseError::Syntax(format!("body exceeds {} bytes", max_body));
    if meta.oversized || body.len() > max_body {
        return Err(too_large());
    }
    if !meta.gzip {
        return Ok(body);
    }
    let mut out = Vec::with_capacity((body.len() * 4).min(max_body));
    GzDecoder::new(&body[..])
        .take(max_body as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ParseError::Syntax(format!("gzip: {}", e)))?;
    if out.len() > max_body {
        return Err(too_large());
    }
    Ok(Bytes::from(out))
}

/// Copy document metadata onto the feed and turn entries into items.
fn adopt(feed: &mut Feed, parsed: ParsedFeed) -> Vec<Item> {
    if !parsed.title.is_empty() {
        feed.title = parsed.title.clone();
    }
    feed.flavor = parsed.flavor.clone();
    feed.generator = parsed.generator.clone();
    feed.icon = parsed.link(REL_ICON).unwrap_or_default().to_string();
    feed.hub = parsed.link(REL_HUB).unwrap_or_default().to_string();
    if let Some(site) = parsed.link(REL_ALTERNATE) {
        feed.site_url = site.to_string();
    }

    let feed_author = parsed.author.as_ref().map(|a| a.display().to_string());
    let mut items = Vec::with_capacity(parsed.entries.len());
    for entry in &parsed.entries {
        let url = entry.link(REL_ALTERNATE).unwrap_or_default();
        let guid = if entry.id.is_empty() { url } else { entry.id.as_str() };
        if guid.is_empty() {
            debug!(feed = feed.id, title = %entry.title, "entry without id or link skipped");
            continue;
        }
        if !codec::is_indexable(guid) {
            debug!(feed = feed.id, guid = ?guid, "entry id contains NUL, skipped");
            continue;
        }
        let mut item = Item::new(feed.id, guid);
        item.created = entry.created;
        item.updated = entry.updated.or(entry.created);
        item.url = url.to_string();
        item.title = entry.title.clone();
        item.author = entry
            .author
            .as_ref()
            .map(|a| a.display().to_string())
            .or_else(|| feed_author.clone())
            .unwrap_or_default();
        item.content = if entry.content.is_empty() {
            entry.summary.clone()
        } else {
            entry.content.clone()
        };
        items.push(item);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const DOC: &str = r#"{"version": "https://jsonfeed.org/version/1.1", "title": "T",
        "home_page_url": "https://site/",
        "authors": [{"name": "Feed Author"}],
        "items": [
            {"id": "a", "url": "https://site/a", "summary": "sum", "date_published": "2024-01-01T00:00:00Z"},
            {"id": "", "url": "https://site/b", "content_text": "body"},
            {"id": "", "title": "orphan"}
        ]}"#;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn feed() -> Feed {
        let mut feed = Feed::new("http://old/", t0());
        feed.id = 4;
        feed
    }

    fn ok_response(body: Vec<u8>, gzip: bool) -> Outcome {
        Outcome::Response {
            status: 200,
            meta: ResponseMeta {
                content_type: "application/feed+json".into(),
                etag: "\"v1\"".into(),
                gzip,
                ..Default::default()
            },
            body: Bytes::from(body),
        }
    }

    const LIMIT: usize = 64 * 1024;

    fn harvest_limited(outcome: Outcome, max_body: usize) -> Harvest {
        build_harvest(
            feed(),
            t0(),
            t0() + Duration::milliseconds(250),
            outcome,
            &ParserSet::bundled(),
            max_body,
        )
    }

    fn harvest(outcome: Outcome) -> Harvest {
        harvest_limited(outcome, LIMIT)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_ok_maps_entries_to_items() {
        let h = harvest(ok_response(DOC.as_bytes().to_vec(), false));
        assert_eq!(h.transmission.result, Some(ResultCode::Ok));
        assert_eq!(h.transmission.update_check, Some(UpdateCheck::FeedInspection));
        assert_eq!(h.transmission.duration, std::time::Duration::from_millis(250));
        assert_eq!(h.feed.title, "T");
        assert_eq!(h.feed.etag, "\"v1\"");
        assert_eq!(h.feed.site_url, "https://site/");
        assert_eq!(h.feed.status, Some(ResultCode::Ok));

        assert_eq!(h.items.len(), 2);
        assert_eq!(h.items[0].guid, "a");
        assert_eq!(h.items[0].content, "sum");
        assert_eq!(h.items[0].author, "Feed Author");
        assert_eq!(h.items[0].updated, h.items[0].created);
        // Falls back to the link when the entry has no id.
        assert_eq!(h.items[1].guid, "https://site/b");
        assert!(h.items.iter().all(|i| i.feed_id == 4));
    }

    #[test]
    fn test_gzip_body_is_inflated() {
        let h = harvest(ok_response(gzip(DOC.as_bytes()), true));
        assert_eq!(h.transmission.result, Some(ResultCode::Ok));
        assert!(h.transmission.gzip);
        assert_eq!(h.transmission.content_length, DOC.len() as u64);
    }

    #[test]
    fn test_permanent_redirect_updates_url() {
        let h = harvest(Outcome::Response {
            status: 301,
            meta: ResponseMeta {
                location: "http://new/".into(),
                ..Default::default()
            },
            body: Bytes::new(),
        });
        assert_eq!(h.transmission.result, Some(ResultCode::Redirect));
        assert_eq!(h.feed.url, "http://new/");
        assert_eq!(h.transmission.url, "http://old/");
    }

    #[test]
    fn test_not_modified() {
        let h = harvest(Outcome::Response {
            status: 304,
            meta: ResponseMeta::default(),
            body: Bytes::new(),
        });
        assert_eq!(h.transmission.result, Some(ResultCode::Ok));
        assert_eq!(h.transmission.update_check, Some(UpdateCheck::Http304));
        assert!(h.items.is_empty());
    }

    #[test]
    fn test_error_outcomes() {
        let h = harvest(Outcome::Transport("connection refused".into()));
        assert_eq!(h.transmission.result, Some(ResultCode::ClientError));
        assert_eq!(h.feed.status_message, "connection refused");

        let h = harvest(Outcome::Response {
            status: 503,
            meta: ResponseMeta::default(),
            body: Bytes::new(),
        });
        assert_eq!(h.transmission.result, Some(ResultCode::ServerError));

        let h = harvest(ok_response(b"{oops".to_vec(), false));
        assert_eq!(h.transmission.result, Some(ResultCode::ParseError));

        let bad_date = r#"{"version": "https://jsonfeed.org/version/1",
            "items": [{"id": "x", "date_modified": "soon"}]}"#;
        let h = harvest(ok_response(bad_date.as_bytes().to_vec(), false));
        assert_eq!(h.transmission.result, Some(ResultCode::TimeError));
        assert!(h.items.is_empty());
    }

    #[test]
    fn test_redirect_without_location_is_server_error() {
        let h = harvest(Outcome::Response {
            status: 308,
            meta: ResponseMeta::default(),
            body: Bytes::new(),
        });
        assert_eq!(h.transmission.result, Some(ResultCode::ServerError));
        assert_eq!(h.feed.url, "http://old/");
    }

    #[test]
    fn test_nul_in_entry_id_skips_only_that_entry() {
        let doc = r#"{"version": "https://jsonfeed.org/version/1.1", "title": "T",
            "items": [
                {"id": "good", "url": "https://site/good"},
                {"id": "a\u0000b", "url": "https://site/bad"}
            ]}"#;
        let h = harvest(ok_response(doc.as_bytes().to_vec(), false));
        assert_eq!(h.transmission.result, Some(ResultCode::Ok));
        let guids: Vec<_> = h.items.iter().map(|i| i.guid.as_str()).collect();
        assert_eq!(guids, vec!["good"]);
    }

    #[test]
    fn test_oversized_body_is_parse_error() {
        let h = harvest_limited(ok_response(DOC.as_bytes().to_vec(), false), DOC.len() - 1);
        assert_eq!(h.transmission.result, Some(ResultCode::ParseError));
        assert!(h.transmission.result_message.contains("exceeds"));
        assert!(h.items.is_empty());

        let h = harvest_limited(ok_response(DOC.as_bytes().to_vec(), false), DOC.len());
        assert_eq!(h.transmission.result, Some(ResultCode::Ok));

        // The fetcher stopped reading and kept nothing.
        let h = harvest(Outcome::Response {
            status: 200,
            meta: ResponseMeta {
                content_type: "application/feed+json".into(),
                oversized: true,
                ..Default::default()
            },
            body: Bytes::new(),
        });
        assert_eq!(h.transmission.result, Some(ResultCode::ParseError));
    }

    #[test]
    fn test_gzip_bomb_is_cut_off() {
        let inflated = vec![b' '; 4 * LIMIT];
        let compressed = gzip(&inflated);
        assert!(compressed.len() < LIMIT);
        let h = harvest(ok_response(compressed, true));
        assert_eq!(h.transmission.result, Some(ResultCode::ParseError));
        assert!(h.transmission.result_message.contains("exceeds"));
    }

    #[test]
    fn test_rss_response_maps_to_items() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Blog</title><link>https://blog.example/</link><description>d</description>
  <item><title>Hello</title><link>https://blog.example/hello</link>
    <guid>https://blog.example/hello</guid>
    <pubDate>Wed, 01 May 2024 00:00:00 GMT</pubDate></item>
</channel></rss>"#;
        let h = harvest(Outcome::Response {
            status: 200,
            meta: ResponseMeta {
                content_type: "application/rss+xml".into(),
                ..Default::default()
            },
            body: Bytes::from(rss.as_bytes().to_vec()),
        });
        assert_eq!(h.transmission.result, Some(ResultCode::Ok));
        assert_eq!(h.feed.flavor, "rss2.0");
        assert_eq!(h.feed.title, "Blog");
        assert_eq!(h.feed.site_url, "https://blog.example/");
        assert_eq!(h.items.len(), 1);
        assert_eq!(h.items[0].guid, "https://blog.example/hello");
        assert_eq!(h.items[0].created, Some(t0()));
    }
}
