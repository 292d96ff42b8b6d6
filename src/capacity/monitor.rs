//! Per-provider poll tasks and the supervisor that keeps them in step with
//! the catalog.
//!
//! Each provider gets its own task. A failed poll leaves the previous
//! snapshot on the board; its age is what health reporting looks at.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CapacityProbe, ProbeReading, SnapshotBoard};
use crate::catalog::CatalogStore;
use crate::config::defaults::PROBE_MAX_BACKOFF_EXPONENT;
use crate::config::CapacityConfig;
use crate::storage::SnapshotStore;
use crate::types::{Provider, ProviderId, ProviderKind, ProviderSnapshot, QuotaSnapshot};

/// Poll one provider until cancelled.
pub async fn run_provider_monitor(
    provider: Provider,
    probe: Arc<dyn CapacityProbe>,
    board: Arc<SnapshotBoard>,
    history: Option<Arc<SnapshotStore>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut consecutive_failures: u32 = 0;
    info!(provider = %provider.id, kind = %provider.kind, interval_secs = interval.as_secs(), "Capacity monitor started");

    loop {
        let wait = match probe.probe(&provider).await {
            Ok(reading) => {
                if consecutive_failures > 0 {
                    info!(provider = %provider.id, consecutive_failures, "Probe recovered");
                }
                consecutive_failures = 0;
                publish(&provider, reading, &board, history.as_deref());
                interval
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let backoff = 1u32 << consecutive_failures.min(PROBE_MAX_BACKOFF_EXPONENT);
                let wait = interval.saturating_mul(backoff).min(Duration::from_secs(300));
                warn!(
                    provider = %provider.id,
                    error = %e,
                    consecutive_failures,
                    next_retry_secs = wait.as_secs(),
                    "Probe failed, keeping previous snapshot"
                );
                wait
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    info!(provider = %provider.id, "Capacity monitor stopped");
}

/// Turn a reading into a snapshot, persist it (capacity only) and publish it.
pub fn publish(
    provider: &Provider,
    reading: ProbeReading,
    board: &SnapshotBoard,
    history: Option<&SnapshotStore>,
) {
    let taken_at = Utc::now();
    match reading {
        ProbeReading::Capacity { total_mb, used_mb, loaded } => {
            let mut snapshot = ProviderSnapshot {
                provider_id: provider.id.clone(),
                seq: 0,
                taken_at,
                total_mb,
                used_mb,
                loaded,
            };
            if let Some(store) = history {
                // History is observability only; the board still gets the snapshot.
                if let Err(e) = store.append(&mut snapshot) {
                    warn!(provider = %provider.id, error = %e, "Failed to persist capacity snapshot");
                }
            }
            debug!(
                provider = %provider.id,
                used_mb = snapshot.used_mb,
                headroom_mb = snapshot.headroom_mb(),
                loaded = snapshot.loaded.len(),
                "Capacity snapshot"
            );
            board.publish_capacity(snapshot);
        }
        ProbeReading::Quota { remaining_requests, remaining_tokens } => {
            debug!(provider = %provider.id, ?remaining_requests, ?remaining_tokens, "Quota snapshot");
            board.publish_quota(QuotaSnapshot {
                provider_id: provider.id.clone(),
                taken_at,
                remaining_requests,
                remaining_tokens,
            });
        }
    }
}

struct MonitorTask {
    provider: Provider,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps exactly one poll task per catalog provider.
pub struct MonitorSupervisor {
    catalog: Arc<CatalogStore>,
    probe: Arc<dyn CapacityProbe>,
    board: Arc<SnapshotBoard>,
    history: Option<Arc<SnapshotStore>>,
    config: CapacityConfig,
    tasks: HashMap<ProviderId, MonitorTask>,
    seen_version: Option<u64>,
}

impl MonitorSupervisor {
    pub fn new(
        catalog: Arc<CatalogStore>,
        probe: Arc<dyn CapacityProbe>,
        board: Arc<SnapshotBoard>,
        history: Option<Arc<SnapshotStore>>,
        config: CapacityConfig,
    ) -> Self {
        Self {
            catalog,
            probe,
            board,
            history,
            config,
            tasks: HashMap::new(),
            seen_version: None,
        }
    }

    fn interval_for(&self, kind: ProviderKind) -> Duration {
        match kind {
            ProviderKind::LocalCapacity => Duration::from_secs(self.config.poll_interval_secs),
            ProviderKind::RateLimited => Duration::from_secs(self.config.quota_poll_interval_secs),
        }
    }

    /// Start tasks for new providers, stop them for removed ones, and restart
    /// any whose record changed (credential rotation).
    pub fn reconcile(&mut self, parent: &CancellationToken) {
        let catalog = self.catalog.snapshot();
        if self.seen_version == Some(catalog.version()) {
            return;
        }
        self.seen_version = Some(catalog.version());

        let stale: Vec<ProviderId> = self
            .tasks
            .iter()
            .filter(|(id, task)| catalog.provider(id) != Some(&task.provider))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(task) = self.tasks.remove(&id) {
                task.cancel.cancel();
                task.handle.abort();
                if catalog.provider(&id).is_none() {
                    self.board.remove(&id);
                    info!(provider = %id, "Provider removed, monitor stopped");
                }
            }
        }

        for provider in catalog.providers() {
            if self.tasks.contains_key(&provider.id) {
                continue;
            }
            let cancel = parent.child_token();
            let handle = tokio::spawn(run_provider_monitor(
                provider.clone(),
                Arc::clone(&self.probe),
                Arc::clone(&self.board),
                self.history.clone(),
                self.interval_for(provider.kind),
                cancel.clone(),
            ));
            self.tasks.insert(
                provider.id.clone(),
                MonitorTask {
                    provider: provider.clone(),
                    cancel,
                    handle,
                },
            );
        }
    }

    pub fn monitored(&self) -> usize {
        self.tasks.len()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.reconcile_interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.reconcile(&cancel),
            }
        }
        for (_, task) in self.tasks.drain() {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
        info!("Monitor supervisor stopped");
    }
}

/// Periodically delete snapshots older than the retention window.
pub async fn run_snapshot_retention(
    store: Arc<SnapshotStore>,
    retention_days: u32,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
                if let Err(e) = store.prune_before(cutoff) {
                    warn!(error = %e, "Snapshot retention sweep failed");
                }
            }
        }
    }
}
