//! HTTP fetcher on reqwest

use super::harvest::{build_harvest, Outcome, ResponseMeta};
use super::Fetcher;
use crate::clock::SharedClock;
use crate::config::FetchConfig;
use crate::model::{Feed, Harvest};
use crate::parser::ParserSet;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap};
use reqwest::redirect::{Attempt, Policy};
use reqwest::StatusCode;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Temporary redirects followed before giving up.
pub const MAX_REDIRECTS: usize = 10;

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Fetches feeds with conditional GETs.
///
/// Permanent redirects are not followed: they come back as the 301/308
/// response so the feed's URL can be updated.
pub struct HttpFetcher {
    client: reqwest::Client,
    parsers: Arc<ParserSet>,
    clock: SharedClock,
    max_body: usize,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig, parsers: ParserSet, clock: SharedClock) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .redirect(Policy::custom(redirect_policy))
            .build()?;
        Ok(HttpFetcher {
            client,
            parsers: Arc::new(parsers),
            clock,
            max_body: config.max_body_bytes,
        })
    }

    async fn request(&self, feed: &Feed) -> Outcome {
        let mut request = self
            .client
            .get(&feed.url)
            .header(header::ACCEPT_ENCODING, "gzip");
        if !feed.etag.is_empty() {
            request = request.header(header::IF_NONE_MATCH, feed.etag.as_str());
        }
        if let Some(t) = feed.last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, t.format(HTTP_DATE).to_string());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return Outcome::Transport(e.to_string()),
        };
        let status = response.status().as_u16();
        let mut meta = response_meta(response.headers());
        match read_body(response, self.max_body).await {
            Ok((body, oversized)) => {
                meta.oversized = oversized;
                Outcome::Response { status, meta, body }
            }
            Err(e) => Outcome::Transport(e.to_string()),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, feed: Feed) -> Pin<Box<dyn Future<Output = Harvest> + Send + 'a>> {
        Box::pin(async move {
            let started = self.clock.now();
            let outcome = self.request(&feed).await;
            let finished = self.clock.now();
            build_harvest(feed, started, finished, outcome, &self.parsers, self.max_body)
        })
    }
}

/// Read at most `max_body` bytes. The flag is set when the body is longer,
/// either by its declared length or by what actually arrived.
async fn read_body(mut response: reqwest::Response, max_body: usize) -> Result<(Bytes, bool), reqwest::Error> {
    if response.content_length().is_some_and(|n| n > max_body as u64) {
        debug!(url = %response.url(), limit = max_body, "declared body too large, not read");
        return Ok((Bytes::new(), true));
    }
    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > max_body {
            return Ok((Bytes::new(), true));
        }
        body.extend_from_slice(&chunk);
    }
    Ok((body.freeze(), false))
}

fn redirect_policy(attempt: Attempt) -> reqwest::redirect::Action {
    match attempt.status() {
        StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT => attempt.stop(),
        _ if attempt.previous().len() > MAX_REDIRECTS => attempt.error("too many redirects"),
        _ => attempt.follow(),
    }
}

fn response_meta(headers: &HeaderMap) -> ResponseMeta {
    let get = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim()
            .to_string()
    };
    ResponseMeta {
        content_type: get(header::CONTENT_TYPE),
        etag: get(header::ETAG),
        last_modified: parse_http_date(&get(header::LAST_MODIFIED)),
        location: get(header::LOCATION),
        gzip: get(header::CONTENT_ENCODING).eq_ignore_ascii_case("gzip"),
        oversized: false,
    }
}

fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
