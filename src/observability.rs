//! Logging setup
//!
//! One global `tracing` subscriber, installed by the binary. Components do not
//! reach for globals: each receives a `Span` at construction and runs its work
//! inside it, so every record carries `component=<name>`.

use crate::config::LoggingConfig;
use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

/// Span tagging all records of one component.
pub fn component_span(component: &'static str) -> Span {
    tracing::info_span!("component", component)
}
