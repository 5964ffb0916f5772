//! Pipeline wiring
//!
//! ```text
//! Poller ──mpsc<Feed>──► FetchService ──mpsc<Harvest>──► Reaper ──► Store
//! ```
//!
//! Stopping runs upstream first: the poller stops producing, fetch workers
//! finish what is queued, then the reaper applies every harvest already
//! produced. Nothing fetched is lost to a shutdown.

use crate::clock::SharedClock;
use crate::config::Config;
use crate::fetch::{FetchService, Fetcher};
use crate::observability::component_span;
use crate::poller::{InFlight, Poller, PollerState};
use crate::reaper::Reaper;
use crate::repository::{Repository, RepositoryError};
use crate::store::Store;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Counters from every stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub passes: u64,
    pub dispatched: u64,
    pub fetched: u64,
    pub reaped: u64,
    pub reap_failures: u64,
}

pub struct Pipeline {
    repo: Repository,
    poller: Poller,
    fetch: FetchService,
    reaper: Reaper,
}

impl Pipeline {
    /// Open the repository on `store` and start all three stages.
    pub fn start(
        store: Arc<Store>,
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        clock: SharedClock,
    ) -> Result<Self, RepositoryError> {
        let repo = Repository::open(store.clone())?;

        let (feed_tx, feed_rx) = mpsc::channel(config.fetch.queue_depth.max(1));
        let (harvest_tx, harvest_rx) = mpsc::channel(config.reaper.queue_depth.max(1));

        let in_flight = Arc::new(InFlight::new());

        let reaper = Reaper::start(
            store,
            clock.clone(),
            in_flight.clone(),
            harvest_rx,
            component_span("reaper"),
        );
        let fetch = FetchService::start(
            config.fetch.workers,
            fetcher,
            feed_rx,
            harvest_tx,
            component_span("fetch"),
        );
        let poller = Poller::start(
            repo.clone(),
            &config.poll,
            clock,
            in_flight,
            feed_tx,
            component_span("poller"),
        );
        info!(workers = config.fetch.workers, "pipeline started");

        Ok(Pipeline {
            repo,
            poller,
            fetch,
            reaper,
        })
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn poller_state(&self) -> PollerState {
        self.poller.state()
    }

    pub fn stats(&self) -> PipelineStats {
        let poller = self.poller.stats();
        let reaper = self.reaper.stats();
        PipelineStats {
            passes: poller.passes.load(Ordering::Relaxed),
            dispatched: poller.dispatched.load(Ordering::Relaxed),
            fetched: self.fetch.fetched(),
            reaped: reaper.reaped.load(Ordering::Relaxed),
            reap_failures: reaper.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop poller, then fetch, then reaper, each after its input is drained.
    pub async fn stop(self) -> PipelineStats {
        let Pipeline {
            repo: _,
            mut poller,
            fetch,
            mut reaper,
        } = self;

        poller.stop().await;
        // The poller held the only feed sender, so workers see the queue close.
        let fetched = fetch.stop().await;
        reaper.stop().await;

        let stats = PipelineStats {
            passes: poller.stats().passes.load(Ordering::Relaxed),
            dispatched: poller.stats().dispatched.load(Ordering::Relaxed),
            fetched,
            reaped: reaper.stats().reaped.load(Ordering::Relaxed),
            reap_failures: reaper.stats().failed.load(Ordering::Relaxed),
        };
        info!(?stats, "pipeline stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::model::{Feed, Harvest, ResultCode, Transmission};
    use chrono::{TimeZone, Utc};
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    struct Canned {
        clock: Arc<ManualClock>,
    }

    impl Fetcher for Canned {
        fn fetch<'a>(&'a self, mut feed: Feed) -> Pin<Box<dyn Future<Output = Harvest> + Send + 'a>> {
            Box::pin(async move {
                let now = self.clock.now();
                let mut t = Transmission::new(feed.id, &feed.url, now);
                t.result = Some(ResultCode::Ok);
                t.status_code = 200;
                feed.set_status(ResultCode::Ok, "", now);
                Harvest::new(feed, t)
            })
        }
    }

    #[tokio::test]
    async fn test_start_stop_reaps_every_dispatched_feed() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let repo = Repository::open(store.clone()).unwrap();
        for i in 0..6 {
            repo.add_feed(&format!("http://feed/{}", i), clock.now()).unwrap();
        }

        let mut config = Config::test();
        config.poll.batch_limit = 10;
        config.poll.interval = Duration::from_secs(60);
        let fetcher = Arc::new(Canned { clock: clock.clone() });
        let pipeline = Pipeline::start(store, &config, fetcher, clock.clone()).unwrap();

        for _ in 0..500 {
            if pipeline.stats().dispatched >= 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = pipeline.stop().await;
        assert_eq!(stats.dispatched, 6);
        assert_eq!(stats.reaped, 6);
        assert_eq!(stats.reap_failures, 0);

        for feed in repo.list_feeds().unwrap() {
            assert!(feed.last.is_some());
            assert!(feed.next_fetch > Some(clock.now()));
        }
        assert!(repo.feeds_due(clock.now()).unwrap().is_empty());
    }
}
