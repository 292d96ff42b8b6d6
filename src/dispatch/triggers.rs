//! Dispatch triggers.
//!
//! Completions pump their own lane directly. Everything else that can
//! unblock a queue arrives here: snapshot changes (debounced per provider),
//! a periodic retry tick, and the aging sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Scheduler;
use crate::capacity::{CapacityChange, SnapshotBoard};

/// Run until cancelled.
pub async fn run_dispatch_triggers(
    scheduler: Arc<Scheduler>,
    board: Arc<SnapshotBoard>,
    cancel: CancellationToken,
) {
    let config = scheduler.config().clone();
    let debounce = Duration::from_millis(config.trigger_debounce_ms);
    let mut changes = board.subscribe();
    let mut retry = tokio::time::interval(Duration::from_secs(config.retry_tick_secs.max(1)));
    let mut aging = tokio::time::interval(Duration::from_secs(config.aging_sweep_interval_secs.max(1)));
    retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    aging.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        retry_tick_secs = config.retry_tick_secs,
        aging_step_secs = config.aging_step_secs,
        "Dispatch triggers started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = retry.tick() => scheduler.pump_all(),
            _ = aging.tick() => {
                scheduler.age_queues();
                // A promoted request may now head its queue.
                scheduler.pump_all();
            }
            change = changes.recv() => match change {
                Ok(change) => {
                    let mut providers = HashSet::new();
                    providers.insert(change.provider_id().to_string());
                    let lagged = collect_burst(&mut changes, &mut providers, debounce).await;
                    if lagged {
                        scheduler.pump_all();
                    } else {
                        for provider_id in &providers {
                            debug!(provider = %provider_id, "Snapshot changed, pumping lanes");
                            scheduler.pump_provider(provider_id);
                        }
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Snapshot change feed lagged, pumping every lane");
                    scheduler.pump_all();
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    info!("Dispatch triggers stopped");
}

/// Absorb further changes that arrive within `window`. Returns true if the
/// receiver lagged and the set is incomplete.
async fn collect_burst(
    changes: &mut tokio::sync::broadcast::Receiver<CapacityChange>,
    providers: &mut HashSet<String>,
    window: Duration,
) -> bool {
    if window.is_zero() {
        return false;
    }
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, changes.recv()).await {
            Ok(Ok(change)) => {
                providers.insert(change.provider_id().to_string());
            }
            Ok(Err(RecvError::Lagged(_))) => return true,
            Ok(Err(RecvError::Closed)) | Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_debounced_into_one_set() {
        let board = SnapshotBoard::new();
        let mut rx = board.subscribe();
        let tx_board = Arc::new(board);

        let publisher = Arc::clone(&tx_board);
        tokio::spawn(async move {
            for id in ["a", "b", "a"] {
                publisher.remove(id);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let first = rx.recv().await.unwrap();
        let mut providers = HashSet::from([first.provider_id().to_string()]);
        let lagged = collect_burst(&mut rx, &mut providers, Duration::from_millis(100)).await;

        assert!(!lagged);
        assert_eq!(providers.len(), 2);
    }
}
