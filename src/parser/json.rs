//! JSON Feed 1.0 / 1.1

use super::{FeedParser, Link, ParseError, ParsedEntry, ParsedFeed, Person, REL_ALTERNATE, REL_HUB, REL_ICON};
use chrono::{DateTime, Utc};
use serde::Deserialize;

const VERSION_PREFIX: &str = "https://jsonfeed.org/version/";

#[derive(Debug, Deserialize)]
struct Document {
    version: String,
    #[serde(default)]
    title: String,
    home_page_url: Option<String>,
    feed_url: Option<String>,
    icon: Option<String>,
    favicon: Option<String>,
    author: Option<Author>,
    #[serde(default)]
    authors: Vec<Author>,
    #[serde(default)]
    hubs: Vec<Hub>,
    #[serde(default)]
    items: Vec<DocumentItem>,
}

#[derive(Debug, Deserialize)]
struct Author {
    name: Option<String>,
    url: Option<String>,
}

impl From<&Author> for Person {
    fn from(a: &Author) -> Self {
        Person {
            name: a.name.clone().unwrap_or_default(),
            email: String::new(),
            uri: a.url.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Hub {
    url: String,
}

#[derive(Debug, Deserialize)]
struct DocumentItem {
    id: serde_json::Value,
    url: Option<String>,
    external_url: Option<String>,
    #[serde(default)]
    title: String,
    content_html: Option<String>,
    content_text: Option<String>,
    summary: Option<String>,
    date_published: Option<String>,
    date_modified: Option<String>,
    author: Option<Author>,
    #[serde(default)]
    authors: Vec<Author>,
}

/// Parser for https://jsonfeed.org documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFeedParser;

impl FeedParser for JsonFeedParser {
    fn accepts(&self, content_type: &str, body: &[u8]) -> bool {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("json") {
            return true;
        }
        // Servers often label JSON feeds as text/plain or octet-stream.
        body.iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|b| *b == b'{')
    }

    fn parse(&self, body: &[u8]) -> Result<ParsedFeed, ParseError> {
        let doc: Document =
            serde_json::from_slice(body).map_err(|e| ParseError::Syntax(e.to_string()))?;
        let version = doc
            .version
            .strip_prefix(VERSION_PREFIX)
            .ok_or_else(|| ParseError::Syntax(format!("not a JSON Feed: version {:?}", doc.version)))?;

        let mut links = Vec::new();
        push_link(&mut links, REL_ALTERNATE, &doc.home_page_url);
        push_link(&mut links, "self", &doc.feed_url);
        push_link(&mut links, REL_ICON, &doc.icon.clone().or(doc.favicon.clone()));
        for hub in &doc.hubs {
            push_link(&mut links, REL_HUB, &Some(hub.url.clone()));
        }

        let author = first_author(&doc.author, &doc.authors);
        let entries = doc
            .items
            .iter()
            .map(parse_item)
            .collect::<Result<Vec<_>, _>>()?;
        // JSON Feed carries no document-level date; use the newest entry.
        let updated = entries.iter().filter_map(|e| e.updated).max();

        Ok(ParsedFeed {
            id: doc.feed_url.clone().unwrap_or_default(),
            flavor: format!("json{}", version),
            generator: String::new(),
            title: doc.title,
            updated,
            author,
            links,
            entries,
        })
    }
}

fn parse_item(item: &DocumentItem) -> Result<ParsedEntry, ParseError> {
    let id = match &item.id {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => return Err(ParseError::Syntax(format!("invalid item id {}", other))),
    };
    let created = parse_date(&item.date_published)?;
    let updated = parse_date(&item.date_modified)?.or(created);

    let mut links = Vec::new();
    push_link(&mut links, REL_ALTERNATE, &item.url);
    push_link(&mut links, "related", &item.external_url);

    Ok(ParsedEntry {
        id,
        title: item.title.clone(),
        created,
        updated,
        author: first_author(&item.author, &item.authors),
        links,
        summary: item.summary.clone().unwrap_or_default(),
        content: item
            .content_html
            .clone()
            .or_else(|| item.content_text.clone())
            .unwrap_or_default(),
    })
}

fn parse_date(raw: &Option<String>) -> Result<Option<DateTime<Utc>>, ParseError> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| ParseError::Time(format!("{:?}: {}", s, e))),
    }
}

fn first_author(single: &Option<Author>, many: &[Author]) -> Option<Person> {
    many.first().or(single.as_ref()).map(Person::from)
}

fn push_link(links: &mut Vec<Link>, rel: &str, href: &Option<String>) {
    if let Some(href) = href.as_deref().filter(|h| !h.is_empty()) {
        links.push(Link {
            rel: rel.to_string(),
            href: href.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = r#"{
        "version": "https://jsonfeed.org/version/1.1",
        "title": "Example",
        "home_page_url": "https://example.org/",
        "feed_url": "https://example.org/feed.json",
        "authors": [{"name": "Ada"}],
        "hubs": [{"type": "WebSub", "url": "https://hub.example/"}],
        "items": [
            {"id": "1", "url": "https://example.org/1", "title": "One",
             "content_html": "<p>one</p>", "date_published": "2024-01-01T10:00:00Z"},
            {"id": 2, "title": "Two", "content_text": "two",
             "date_published": "2024-01-02T10:00:00+02:00",
             "date_modified": "2024-01-03T00:00:00Z"}
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let feed = JsonFeedParser.parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(feed.flavor, "json1.1");
        assert_eq!(feed.title, "Example");
        assert_eq!(feed.link(REL_ALTERNATE), Some("https://example.org/"));
        assert_eq!(feed.link(REL_HUB), Some("https://hub.example/"));
        assert_eq!(feed.author.as_ref().map(|a| a.name.as_str()), Some("Ada"));
        assert_eq!(feed.entries.len(), 2);

        let one = &feed.entries[0];
        assert_eq!(one.id, "1");
        assert_eq!(one.content, "<p>one</p>");
        assert_eq!(one.updated, one.created);

        let two = &feed.entries[1];
        assert_eq!(two.id, "2");
        assert_eq!(two.created, Some(Utc.with_ymd_and_hms(2024, 1, 2, 8, 0, 0).unwrap()));
        assert_eq!(feed.updated, Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_bad_date_is_time_error() {
        let doc = r#"{"version": "https://jsonfeed.org/version/1",
            "items": [{"id": "a", "date_published": "yesterday"}]}"#;
        assert!(matches!(JsonFeedParser.parse(doc.as_bytes()), Err(ParseError::Time(_))));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(JsonFeedParser.parse(b"{not json"), Err(ParseError::Syntax(_))));
        assert!(matches!(
            JsonFeedParser.parse(br#"{"version": "2"}"#),
            Err(ParseError::Syntax(_))
        ));
    }

    #[test]
    fn test_accepts_by_type_or_sniffing() {
        assert!(JsonFeedParser.accepts("application/feed+json; charset=utf-8", b""));
        assert!(JsonFeedParser.accepts("text/plain", b"  \n{\"version\":1}"));
        assert!(!JsonFeedParser.accepts("application/rss+xml", b"<rss/>"));
    }
}
