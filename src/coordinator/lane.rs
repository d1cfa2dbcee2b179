//! Lane scheduler and trigger forwarders.
//!
//! Each started collection runs two lanes, pull and push. A lane is one task
//! looping over:
//!
//! ```text
//! wait for: shutdown | trigger | timer ─► begin_pass ─► pass ─► finish_pass
//! ```
//!
//! Triggers are a [`Notify`]: it stores at most one permit, so any number
//! of triggers that arrive during a pass collapse into exactly one follow-up
//! pass, and a lane can never run two passes at once.
//!
//! The timer is the fallback interval after a clean pass, or the failure
//! backoff after a failed one. It doubles per consecutive failure up to the
//! ceiling and resets on success.

use super::collection::CollectionReplica;
use super::types::Lane;
use crate::config::ScheduleConfig;
use crate::error::Result;
use crate::metrics;
use crate::puller::Puller;
use crate::pusher::Pusher;
use crate::realtime::ListenerNotice;
use crate::resilience::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tracing::{debug, warn};

/// The pass a lane runs.
pub(crate) enum LaneWork {
    Pull(Arc<Puller>),
    Push(Arc<Pusher>),
}

impl LaneWork {
    fn lane(&self) -> Lane {
        match self {
            LaneWork::Pull(_) => Lane::Pull,
            LaneWork::Push(_) => Lane::Push,
        }
    }

    /// Run one pass. `Ok(false)` means it completed but left work behind
    /// (apply failures, rejections).
    async fn run(&self, collection: &str) -> Result<bool> {
        match self {
            LaneWork::Pull(puller) => puller.pull_collection(collection).await.map(|r| r.is_clean()),
            LaneWork::Push(pusher) => pusher.push_pending(collection).await.map(|r| r.is_clean()),
        }
    }
}

pub(crate) struct LaneContext {
    pub collection: String,
    pub epoch: u64,
    pub replica: Arc<CollectionReplica>,
    pub trigger: Arc<Notify>,
    pub schedule: ScheduleConfig,
}

/// Consecutive-failure tracking for one lane.
struct Backoff {
    failures: u32,
}

impl Backoff {
    fn next_delay(&self, schedule: &ScheduleConfig) -> Duration {
        if self.failures == 0 {
            schedule.fallback_interval_duration()
        } else {
            schedule.backoff_for_failures(self.failures)
        }
    }

    fn record(&mut self, ok: bool) {
        self.failures = if ok { 0 } else { self.failures.saturating_add(1) };
    }
}

enum Wake {
    Shutdown,
    Trigger,
    Timer,
}

async fn wait_turn(trigger: &Notify, delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> Wake {
    tokio::select! {
        biased;
        _ = shutdown_rx.changed() => Wake::Shutdown,
        _ = trigger.notified() => Wake::Trigger,
        _ = tokio::time::sleep(delay) => Wake::Timer,
    }
}

/// Run a lane until shutdown or until the replica's epoch ends.
///
/// `gate`, when set, must resolve before the first pass (the push lane waits
/// for the initial pull). `on_first_pass` is signalled after the first pass.
pub(crate) async fn run_lane(
    ctx: LaneContext,
    work: LaneWork,
    gate: Option<oneshot::Receiver<()>>,
    mut on_first_pass: Option<oneshot::Sender<()>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let lane = work.lane();
    let lane_name = lane.to_string();

    if let Some(gate) = gate {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            // A dropped sender means the other lane ended; carry on either way.
            _ = gate => {}
        }
    }

    let mut backoff = Backoff { failures: 0 };
    let mut immediate = true;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if !immediate {
            let delay = backoff.next_delay(&ctx.schedule);
            match wait_turn(&ctx.trigger, delay, &mut shutdown_rx).await {
                Wake::Shutdown => break,
                Wake::Trigger => {}
                Wake::Timer => metrics::record_trigger(&ctx.collection, &lane_name, "timer"),
            }
        }
        immediate = false;

        if !ctx.replica.begin_pass(ctx.epoch, lane) {
            break;
        }

        let outcome = work.run(&ctx.collection).await;
        let ok = match &outcome {
            Ok(clean) => *clean,
            Err(e) => {
                metrics::record_pass_failure(&ctx.collection, &lane_name, e.kind());
                warn!(
                    lane = %lane,
                    error = %e,
                    retryable = e.is_retryable(),
                    failures = backoff.failures + 1,
                    "Pass failed"
                );
                false
            }
        };

        if !ctx.replica.finish_pass(ctx.epoch, lane, ok) {
            debug!(lane = %lane, "Stopped during pass, discarding outcome");
            break;
        }
        backoff.record(ok);

        if let Some(tx) = on_first_pass.take() {
            let _ = tx.send(());
        }
    }

    debug!(lane = %lane, "Lane exiting");
}

/// Turn listener notices into pull triggers.
///
/// Events for the collection and reconnects (which may have missed events)
/// trigger; everything else is logged.
pub(crate) async fn forward_notices(
    collection: String,
    mut notices: mpsc::UnboundedReceiver<ListenerNotice>,
    trigger: Arc<Notify>,
    limiter: Option<Arc<RateLimiter>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let notice = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            notice = notices.recv() => notice,
        };

        let source = match notice {
            None => break,
            Some(ListenerNotice::Event(event)) if event.collection_path == collection => "realtime",
            Some(ListenerNotice::Event(event)) => {
                debug!(other = %event.collection_path, "Ignoring event for another collection");
                continue;
            }
            Some(ListenerNotice::Connected { resumed: true }) => "reconnect",
            Some(ListenerNotice::Connected { resumed: false }) => {
                debug!("Realtime connected");
                continue;
            }
            Some(ListenerNotice::Dropped { reason }) => {
                debug!(reason = %reason, "Realtime dropped");
                continue;
            }
        };

        if let Some(limiter) = &limiter {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = limiter.acquire() => {}
            }
        }

        metrics::record_trigger(&collection, "pull", source);
        trigger.notify_one();
    }
}

/// Turn outbox enqueues for the collection into push triggers.
pub(crate) async fn forward_enqueues(
    collection: String,
    mut enqueued: broadcast::Receiver<String>,
    trigger: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            received = enqueued.recv() => received,
        };

        match received {
            Ok(path) if path == collection => {
                metrics::record_trigger(&collection, "push", "outbox");
                trigger.notify_one();
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Some enqueue may have been ours; pushing an empty outbox is cheap.
                debug!(skipped, "Enqueue notifications lagged");
                trigger.notify_one();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
