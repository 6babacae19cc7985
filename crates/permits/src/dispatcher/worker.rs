//! Dispatch and stats reporting loops

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::Inner;
use crate::stats::StatsReporter;
use crate::task::DispatchTask;

/// Pull envelopes from the buffer while under the concurrency limit
///
/// A worker takes an item only while the counter is strictly below
/// `concurrency_limit`, one tighter than "at or below", which is what keeps
/// the overshoot within `dispatch_workers - 1`.
///
/// The counter is read before waiting for an item and incremented only after
/// one is taken, so concurrent workers may together overshoot the limit by
/// up to `dispatch_workers - 1`.
pub(super) async fn dispatch_loop<T: DispatchTask>(
    worker: usize,
    inner: Arc<Inner<T>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker, "dispatch worker started");
    let limit = inner.config.concurrency_limit;
    let poll_interval = inner.config.poll_interval;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let level = inner.concurrency.get();
        if level >= limit {
            trace!(worker, level, limit, "concurrency limit reached, throttling");
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => continue,
                _ = shutdown_rx.changed() => break,
            }
        }

        let envelope = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            envelope = inner.buffer.pop() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        trace!(worker, id = %envelope.id, "dispatching task");
        inner.dispatch(envelope);
    }

    debug!(worker, "dispatch worker exited");
}

/// Emit a stats snapshot every `stats_interval`
pub(super) async fn report_loop<T: DispatchTask>(
    inner: Arc<Inner<T>>,
    reporter: Arc<StatsReporter>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(inner.config.stats_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                reporter
                    .report(
                        &inner.stats,
                        inner.config.kind,
                        inner.concurrency.get(),
                        inner.buffer.len(),
                    )
                    .await;
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("stats reporter exited");
}
