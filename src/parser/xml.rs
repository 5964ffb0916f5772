//! Atom, RSS 0.9x/2.0 and RDF (RSS 1.0), via feed-rs

use super::{FeedParser, Link, ParseError, ParsedEntry, ParsedFeed, Person, REL_ICON};
use feed_rs::model::{self, FeedType};

/// Parser for the XML syndication dialects.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlFeedParser;

impl FeedParser for XmlFeedParser {
    fn accepts(&self, content_type: &str, body: &[u8]) -> bool {
        let ct = content_type.to_ascii_lowercase();
        if ["xml", "rss", "atom", "rdf"].iter().any(|k| ct.contains(k)) {
            return true;
        }
        let generic = ct.is_empty() || ct.starts_with("text/plain") || ct.starts_with("application/octet-stream");
        generic && looks_like_markup(body)
    }

    fn parse(&self, body: &[u8]) -> Result<ParsedFeed, ParseError> {
        let doc = feed_rs::parser::parse(body).map_err(|e| ParseError::Syntax(e.to_string()))?;

        let mut links: Vec<Link> = doc.links.iter().map(convert_link).collect();
        if let Some(icon) = doc.icon.as_ref().or(doc.logo.as_ref()) {
            links.push(Link {
                rel: REL_ICON.to_string(),
                href: icon.uri.clone(),
            });
        }

        Ok(ParsedFeed {
            id: doc.id.clone(),
            flavor: flavor(&doc.feed_type).to_string(),
            generator: doc.generator.as_ref().map(|g| g.content.clone()).unwrap_or_default(),
            title: text(&doc.title),
            updated: doc.updated,
            author: doc.authors.first().map(convert_person),
            links,
            entries: doc.entries.iter().map(convert_entry).collect(),
        })
    }
}

fn flavor(feed_type: &FeedType) -> &'static str {
    match feed_type {
        FeedType::Atom => "atom",
        FeedType::RSS0 => "rss0.9",
        FeedType::RSS1 => "rss1.0",
        FeedType::RSS2 => "rss2.0",
        FeedType::JSON => "json",
    }
}

fn convert_entry(entry: &model::Entry) -> ParsedEntry {
    let created = entry.published.or(entry.updated);
    ParsedEntry {
        id: entry.id.clone(),
        title: text(&entry.title),
        created,
        updated: entry.updated.or(created),
        author: entry.authors.first().map(convert_person),
        links: entry.links.iter().map(convert_link).collect(),
        summary: text(&entry.summary),
        content: entry
            .content
            .as_ref()
            .and_then(|c| c.body.clone())
            .unwrap_or_default(),
    }
}

fn convert_link(link: &model::Link) -> Link {
    Link {
        rel: link.rel.clone().unwrap_or_default(),
        href: link.href.clone(),
    }
}

fn convert_person(person: &model::Person) -> Person {
    Person {
        name: person.name.clone(),
        email: person.email.clone().unwrap_or_default(),
        uri: person.uri.clone().unwrap_or_default(),
    }
}

fn text(t: &Option<model::Text>) -> String {
    t.as_ref().map(|t| t.content.trim().to_string()).unwrap_or_default()
}

fn looks_like_markup(body: &[u8]) -> bool {
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<')
}
