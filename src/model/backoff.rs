//! Adaptive fetch interval
//!
//! ```text
//! elapsed since last change     next interval
//!   < 30m                        10m
//!   30m ..= 72h                  1h
//!   > 72h                        24h
//! permanent redirect             1s
//! ```
//!
//! For successful fetches "last change" is the feed's `last_updated`; for
//! error outcomes it is `status_since`, so a feed that has been broken for
//! days backs off to the daily ceiling.

use chrono::{DateTime, Duration, SubsecRound, Utc};

pub fn recent_threshold() -> Duration {
    Duration::minutes(30)
}

pub fn stale_threshold() -> Duration {
    Duration::hours(72)
}

pub fn fast_interval() -> Duration {
    Duration::minutes(10)
}

pub fn normal_interval() -> Duration {
    Duration::hours(1)
}

pub fn slow_interval() -> Duration {
    Duration::hours(24)
}

pub fn redirect_interval() -> Duration {
    Duration::seconds(1)
}

/// Interval for a feed whose reference event happened `elapsed` ago.
pub fn fetch_interval(elapsed: Duration) -> Duration {
    if elapsed < recent_threshold() {
        fast_interval()
    } else if elapsed > stale_threshold() {
        slow_interval()
    } else {
        normal_interval()
    }
}

/// Time since `since`. An unknown reference counts as just now.
pub fn elapsed(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    match since {
        Some(t) => now - t,
        None => Duration::zero(),
    }
}

/// `now` truncated to whole seconds, plus `interval`.
pub fn next_fetch(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    now.trunc_subsecs(0) + interval
}
