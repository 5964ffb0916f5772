//! feedreaper
//!
//! Feed aggregation backend: a poller picks feeds whose next fetch time has
//! passed, fetch workers retrieve and parse them, and a reaper reconciles the
//! results into an embedded transactional store.
//!
//! ```text
//! Poller ──► FetchService ──► Reaper ──► Repository ──► Store (journal + snapshot)
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod fetch;
pub mod model;
pub mod observability;
pub mod parser;
pub mod pipeline;
pub mod poller;
pub mod reaper;
pub mod repository;
pub mod store;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use model::{Feed, Harvest, Item, ResultCode, Transmission};
pub use pipeline::Pipeline;
pub use repository::{Repository, RepositoryError};
pub use store::{Store, StoreError, StoreOptions};
