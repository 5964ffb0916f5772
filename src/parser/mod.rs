//! Feed document parsing boundary
//!
//! Parsers turn a fetched document into one canonical shape regardless of
//! dialect. The fetch stage only ever sees `ParsedFeed`.

pub mod json;
pub mod xml;

pub use json::JsonFeedParser;
pub use xml::XmlFeedParser;

use chrono::{DateTime, Utc};

pub const REL_ALTERNATE: &str = "alternate";
pub const REL_HUB: &str = "hub";
pub const REL_ICON: &str = "icon";

/// Error type for parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Not a well-formed document of the dialect
    Syntax(String),
    /// A date could not be interpreted
    Time(String),
    /// No parser for this content type
    Unsupported(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Syntax(msg) => write!(f, "cannot parse feed: {}", msg),
            ParseError::Time(msg) => write!(f, "cannot parse feed date: {}", msg),
            ParseError::Unsupported(ct) => write!(f, "unsupported content type {:?}", ct),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Person {
    pub name: String,
    pub email: String,
    pub uri: String,
}

impl Person {
    /// Display form: name, else email, else uri.
    pub fn display(&self) -> &str {
        [&self.name, &self.email, &self.uri]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

fn find_link<'a>(links: &'a [Link], rel: &str) -> Option<&'a str> {
    links
        .iter()
        .find(|l| l.rel == rel || (rel == REL_ALTERNATE && l.rel.is_empty()))
        .map(|l| l.href.as_str())
}

/// Canonical feed document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub id: String,
    /// Dialect and version, e.g. `json1.1`
    pub flavor: String,
    pub generator: String,
    pub title: String,
    pub updated: Option<DateTime<Utc>>,
    pub author: Option<Person>,
    pub links: Vec<Link>,
    pub entries: Vec<ParsedEntry>,
}

impl ParsedFeed {
    pub fn link(&self, rel: &str) -> Option<&str> {
        find_link(&self.links, rel)
    }
}

/// Canonical entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEntry {
    pub id: String,
    pub title: String,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub author: Option<Person>,
    pub links: Vec<Link>,
    pub summary: String,
    pub content: String,
}

impl ParsedEntry {
    pub fn link(&self, rel: &str) -> Option<&str> {
        find_link(&self.links, rel)
    }
}

/// Dialect parser.
pub trait FeedParser: Send + Sync + 'static {
    /// Whether this parser handles `content_type` / `body`.
    fn accepts(&self, content_type: &str, body: &[u8]) -> bool;

    fn parse(&self, body: &[u8]) -> Result<ParsedFeed, ParseError>;
}

/// Tries each registered parser in order.
#[derive(Default)]
pub struct ParserSet {
    parsers: Vec<Box<dyn FeedParser>>,
}

impl ParserSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding every bundled parser: JSON Feed, then Atom/RSS/RDF.
    pub fn bundled() -> Self {
        Self::new().with(JsonFeedParser).with(XmlFeedParser)
    }

    pub fn with(mut self, parser: impl FeedParser) -> Self {
        self.parsers.push(Box::new(parser));
        self
    }

    pub fn parse(&self, content_type: &str, body: &[u8]) -> Result<ParsedFeed, ParseError> {
        match self.parsers.iter().find(|p| p.accepts(content_type, body)) {
            Some(parser) => parser.parse(body),
            None => Err(ParseError::Unsupported(content_type.to_string())),
        }
    }
}
