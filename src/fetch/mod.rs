//! Fetch stage
//!
//! ```text
//!              ┌─ worker 0 ─┐
//! feeds ──mpsc─┼─ worker 1 ─┼──mpsc──► harvests
//!              └─ worker N ─┘
//! ```
//!
//! Workers share one receiver and never touch the store. Each feed taken off
//! the queue yields exactly one Harvest, whatever happened on the network.

pub mod harvest;
pub mod http;

pub use harvest::{build_harvest, Outcome, ResponseMeta};
pub use http::HttpFetcher;

use crate::model::{Feed, Harvest};
use futures::future::join_all;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument, Span};

/// Retrieves one feed and reports the attempt.
///
/// Failures are part of the Harvest (as a result code), never an `Err`.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, feed: Feed) -> Pin<Box<dyn Future<Output = Harvest> + Send + 'a>>;
}

/// Fetch worker pool.
pub struct FetchService {
    workers: Vec<JoinHandle<()>>,
    fetched: Arc<AtomicU64>,
    span: Span,
}

impl FetchService {
    /// Spawn `workers` tasks reading `input` and writing `output`.
    pub fn start(
        workers: usize,
        fetcher: Arc<dyn Fetcher>,
        input: mpsc::Receiver<Feed>,
        output: mpsc::Sender<Harvest>,
        span: Span,
    ) -> Self {
        debug_assert!(workers > 0, "Precondition: at least one fetch worker");

        let input = Arc::new(Mutex::new(input));
        let fetched = Arc::new(AtomicU64::new(0));
        let handles = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(
                    run_worker(id, fetcher.clone(), input.clone(), output.clone(), fetched.clone())
                        .instrument(span.clone()),
                )
            })
            .collect();
        span.in_scope(|| info!(workers, "fetch service started"));

        FetchService {
            workers: handles,
            fetched,
            span,
        }
    }

    /// Harvests handed on so far.
    pub fn fetched(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }

    /// Wait for every worker to finish.
    ///
    /// Workers exit once the input channel is closed and drained, so every
    /// sender of the input must be dropped first; queued feeds are still
    /// fetched. Returns the final count of harvests handed on.
    pub async fn stop(self) -> u64 {
        for result in join_all(self.workers).await {
            if let Err(e) = result {
                self.span.in_scope(|| error!(error = %e, "fetch worker panicked"));
            }
        }
        let fetched = self.fetched.load(Ordering::Relaxed);
        self.span.in_scope(|| info!(fetched, "fetch service stopped"));
        fetched
    }
}

async fn run_worker(
    id: usize,
    fetcher: Arc<dyn Fetcher>,
    input: Arc<Mutex<mpsc::Receiver<Feed>>>,
    output: mpsc::Sender<Harvest>,
    fetched: Arc<AtomicU64>,
) {
    debug!(worker = id, "fetch worker started");
    loop {
        let next = input.lock().await.recv().await;
        let Some(feed) = next else { break };

        let harvest = fetcher.fetch(feed).await;
        debug!(
            worker = id,
            feed = harvest.feed.id,
            result = ?harvest.transmission.result,
            status = harvest.transmission.status_code,
            items = harvest.items.len(),
            url = %harvest.feed.url,
            "fetched"
        );
        // Blocks while the reaper is behind, throttling the pipeline.
        if let Err(e) = output.send(harvest).await {
            error!(worker = id, feed = e.0.feed.id, "reaper gone, harvest dropped");
            break;
        }
        fetched.fetch_add(1, Ordering::Relaxed);
    }
    debug!(worker = id, "fetch worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResultCode, Transmission};
    use chrono::Utc;

    struct Echo;

    impl Fetcher for Echo {
        fn fetch<'a>(&'a self, feed: Feed) -> Pin<Box<dyn Future<Output = Harvest> + Send + 'a>> {
            Box::pin(async move {
                let mut t = Transmission::new(feed.id, &feed.url, Utc::now());
                t.result = Some(ResultCode::Ok);
                Harvest::new(feed, t)
            })
        }
    }

    fn feed(id: u64) -> Feed {
        Feed {
            id,
            url: format!("http://feed/{}", id),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_every_queued_feed_yields_one_harvest() {
        let (feed_tx, feed_rx) = mpsc::channel(2);
        let (harvest_tx, mut harvest_rx) = mpsc::channel(100);
        let service = FetchService::start(3, Arc::new(Echo), feed_rx, harvest_tx, Span::none());

        for id in 1..=20 {
            feed_tx.send(feed(id)).await.unwrap();
        }
        drop(feed_tx);
        assert_eq!(service.stop().await, 20);

        let mut ids = Vec::new();
        while let Some(h) = harvest_rx.recv().await {
            ids.push(h.feed.id);
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_worker_stops_when_output_closed() {
        let (feed_tx, feed_rx) = mpsc::channel(4);
        let (harvest_tx, harvest_rx) = mpsc::channel(1);
        drop(harvest_rx);
        let service = FetchService::start(1, Arc::new(Echo), feed_rx, harvest_tx, Span::none());
        feed_tx.send(feed(1)).await.unwrap();
        drop(feed_tx);
        assert_eq!(service.stop().await, 0);
    }
}
