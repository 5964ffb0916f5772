//! Poller
//!
//! Timer-driven scheduler that hands due feeds to the fetch stage.
//!
//! ```text
//!            start()                tick (no pass in flight)
//! Stopped ───────────► Idle ─────────────────────────────► Polling
//!    ▲                  ▲  ◄──────── pass complete ─────────  │
//!    │                  │                                     │
//!    └──── stop(): cancel, await in-flight pass + loop ◄──────┘
//! ```
//!
//! The first pass runs immediately on start. A tick that arrives while a pass
//! is still running is dropped, never queued. A pass reads the due list in
//! one short read transaction and only then starts handing feeds over, so
//! no transaction is held while the fetch stage applies backpressure.
//!
//! A dispatched feed stays due until the reaper reschedules it. Dispatched
//! ids are recorded in [`InFlight`] and skipped by later passes until the
//! reaper releases them.

use crate::clock::SharedClock;
use crate::config::PollConfig;
use crate::model::Feed;
use crate::repository::Repository;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollerState {
    Stopped = 0,
    Idle = 1,
    Polling = 2,
}

impl PollerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PollerState::Idle,
            2 => PollerState::Polling,
            _ => PollerState::Stopped,
        }
    }
}

/// Ids of feeds handed to the fetch stage whose harvest is not yet reaped.
#[derive(Debug, Default)]
pub struct InFlight {
    ids: Mutex<HashSet<u64>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` in flight. False if it already was.
    pub fn claim(&self, id: u64) -> bool {
        self.ids.lock().insert(id)
    }

    pub fn release(&self, id: u64) {
        self.ids.lock().remove(&id);
    }

    pub fn snapshot(&self) -> HashSet<u64> {
        self.ids.lock().clone()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.ids.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

/// Counters for observation.
#[derive(Debug, Default)]
pub struct PollerStats {
    pub passes: AtomicU64,
    pub dispatched: AtomicU64,
    pub ticks_dropped: AtomicU64,
    pub errors: AtomicU64,
}

struct Shared {
    repo: Repository,
    clock: SharedClock,
    in_flight: Arc<InFlight>,
    batch_limit: usize,
    state: AtomicU8,
    stats: PollerStats,
}

impl Shared {
    fn set_state(&self, state: PollerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

pub struct Poller {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    span: Span,
}

impl Poller {
    /// Start the control loop. Due feeds not already in `in_flight` are
    /// claimed and sent on `output`.
    pub fn start(
        repo: Repository,
        config: &PollConfig,
        clock: SharedClock,
        in_flight: Arc<InFlight>,
        output: mpsc::Sender<Feed>,
        span: Span,
    ) -> Self {
        let shared = Arc::new(Shared {
            repo,
            clock,
            in_flight,
            batch_limit: config.batch_limit,
            state: AtomicU8::new(PollerState::Idle as u8),
            stats: PollerStats::default(),
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            run(shared.clone(), config.interval, output, cancel.clone()).instrument(span.clone()),
        );
        span.in_scope(|| info!(interval = ?config.interval, batch_limit = config.batch_limit, "poller started"));

        Poller {
            shared,
            cancel,
            handle: Some(handle),
            span,
        }
    }

    pub fn state(&self) -> PollerState {
        PollerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> &PollerStats {
        &self.shared.stats
    }

    /// Signal the loop to exit and wait for it and any in-flight pass.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            self.span.in_scope(|| warn!("poller already stopped"));
            return;
        };
        self.cancel.cancel();
        if let Err(e) = handle.await {
            self.span.in_scope(|| error!(error = %e, "poller loop panicked"));
        }
        self.shared.set_state(PollerState::Stopped);
        self.span.in_scope(|| {
            info!(
                passes = self.shared.stats.passes.load(Ordering::Relaxed),
                dispatched = self.shared.stats.dispatched.load(Ordering::Relaxed),
                "poller stopped"
            )
        });
    }
}

async fn run(
    shared: Arc<Shared>,
    interval: std::time::Duration,
    output: mpsc::Sender<Feed>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pass: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            // First tick completes immediately.
            _ = ticker.tick() => {
                if pass.as_ref().is_some_and(|h| !h.is_finished()) {
                    shared.stats.ticks_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("poll pass still running, tick dropped");
                    continue;
                }
                shared.set_state(PollerState::Polling);
                pass = Some(tokio::spawn(
                    poll_pass(shared.clone(), output.clone()).instrument(Span::current()),
                ));
            }
        }
    }

    if let Some(pass) = pass {
        if let Err(e) = pass.await {
            error!(error = %e, "poll pass panicked");
        }
    }
    debug!("poller loop exited");
}

/// One pass: read the due list, then dispatch up to `batch_limit` feeds.
async fn poll_pass(shared: Arc<Shared>, output: mpsc::Sender<Feed>) {
    let now = shared.clock.now();
    // Taken before the read: a feed released after this point was committed
    // with its new schedule, so the due list below will not contain it.
    let busy = shared.in_flight.snapshot();
    let repo = shared.repo.clone();
    let due = tokio::task::spawn_blocking(move || repo.feeds_due(now)).await;

    match due {
        Ok(Ok(feeds)) => {
            let total = feeds.len();
            let batch: Vec<Feed> = feeds
                .into_iter()
                .filter(|f| !busy.contains(&f.id))
                .take(shared.batch_limit)
                .collect();
            debug!(
                due = total,
                in_flight = busy.len(),
                dispatching = batch.len(),
                "poll pass"
            );
            for feed in batch {
                let id = feed.id;
                if !shared.in_flight.claim(id) {
                    continue;
                }
                if output.send(feed).await.is_err() {
                    shared.in_flight.release(id);
                    warn!("fetch stage gone, poll pass abandoned");
                    break;
                }
                shared.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(Err(e)) => {
            shared.stats.errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "cannot read due feeds");
        }
        Err(e) => {
            shared.stats.errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "due-feed query panicked");
        }
    }

    shared.stats.passes.fetch_add(1, Ordering::Relaxed);
    shared.set_state(PollerState::Idle);
}
