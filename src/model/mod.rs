//! Persisted entities and the in-flight Harvest
//!
//! ```text
//! Feed ──1:n── Transmission   (one per fetch attempt, append-only)
//!   │
//!   └──1:n── Item             (one per entry GUID, updated in place)
//! ```

pub mod backoff;
pub mod feed;
pub mod item;
pub mod transmission;

pub use feed::Feed;
pub use item::Item;
pub use transmission::{ResultCode, Transmission, UpdateCheck};

/// Output of one fetch attempt, consumed once by the reaper.
#[derive(Debug, Clone, PartialEq)]
pub struct Harvest {
    pub feed: Feed,
    pub transmission: Transmission,
    pub items: Vec<Item>,
}

impl Harvest {
    pub fn new(feed: Feed, transmission: Transmission) -> Self {
        Harvest {
            feed,
            transmission,
            items: Vec::new(),
        }
    }
}
