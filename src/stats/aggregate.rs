//! Pull-based request aggregates.

use chrono::{DateTime, Utc};
use serde::Serialize;
use statrs::statistics::{Data, OrderStatistics};
use std::collections::BTreeMap;

use super::buckets::BucketPlan;
use crate::types::{ModelId, ProviderKind, ProviderSnapshot, RequestEvent, RequestState};

/// One time bucket of request activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestBucket {
    pub start: DateTime<Utc>,
    pub cloud: u64,
    pub local: u64,
    /// Includes rejected requests, which have no provider
    pub total: u64,
    pub avg_run_secs: Option<f64>,
    /// Mean used capacity across snapshots taken in the bucket
    pub avg_capacity_mb: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelBreakdown {
    pub model_id: ModelId,
    pub total: u64,
    pub complete: u64,
    pub error: u64,
    pub timeout: u64,
    pub in_progress: u64,
    pub cold_starts: u64,
    pub avg_queue_secs: Option<f64>,
    pub avg_run_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DepthPercentiles {
    pub samples: usize,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p99: Option<f64>,
}

/// Runtime split by cold versus warm start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StartSplit {
    pub cold_count: u64,
    pub warm_count: u64,
    pub cold_avg_run_secs: Option<f64>,
    pub warm_avg_run_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestStats {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket_secs: i64,
    pub buckets: Vec<RequestBucket>,
    pub status_counts: BTreeMap<RequestState, u64>,
    pub models: Vec<ModelBreakdown>,
    pub queue_depth: DepthPercentiles,
    pub starts: StartSplit,
    pub avg_queue_secs: Option<f64>,
    pub avg_run_secs: Option<f64>,
    pub total: u64,
}

#[derive(Default)]
struct Mean {
    sum: f64,
    n: u64,
}

impl Mean {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.n += 1;
    }

    fn get(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }
}

/// Aggregate requests enqueued in `[start, end)`. `events` holds the latest
/// row per request; `snapshots` feeds the per-bucket capacity average.
pub fn aggregate_requests(
    events: &[RequestEvent],
    snapshots: &[ProviderSnapshot],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    bucket_count: u32,
) -> RequestStats {
    let plan = BucketPlan::new(start, end, bucket_count);
    let mut buckets: Vec<RequestBucket> = (0..plan.count)
        .map(|i| RequestBucket {
            start: plan.start_of(i),
            ..Default::default()
        })
        .collect();
    let mut bucket_runs: Vec<Mean> = (0..plan.count).map(|_| Mean::default()).collect();
    let mut bucket_capacity: Vec<Mean> = (0..plan.count).map(|_| Mean::default()).collect();

    let mut status_counts = BTreeMap::new();
    let mut models: BTreeMap<ModelId, (ModelBreakdown, Mean, Mean)> = BTreeMap::new();
    let mut depths = Vec::new();
    let (mut queue_all, mut run_all) = (Mean::default(), Mean::default());
    let (mut cold_runs, mut warm_runs) = (Mean::default(), Mean::default());
    let mut starts = StartSplit::default();
    let mut total = 0;

    for event in events {
        if event.enqueued_at < start || event.enqueued_at >= end {
            continue;
        }
        total += 1;
        *status_counts.entry(event.state).or_insert(0) += 1;
        let run_secs = event.run_secs();
        let queue_secs = event.queue_secs();

        if let Some(i) = plan.index_of(event.enqueued_at) {
            let bucket = &mut buckets[i];
            bucket.total += 1;
            match event.provider_kind() {
                Some(ProviderKind::RateLimited) => bucket.cloud += 1,
                Some(ProviderKind::LocalCapacity) => bucket.local += 1,
                None => {}
            }
            if let Some(r) = run_secs {
                bucket_runs[i].add(r);
            }
        }

        let Some(model_id) = event.model_id() else {
            continue;
        };
        depths.push(f64::from(event.queue_depth_at_enqueue));
        if let Some(q) = queue_secs {
            queue_all.add(q);
        }
        if let Some(r) = run_secs {
            run_all.add(r);
        }
        match event.decision.cold_start {
            Some(true) => {
                starts.cold_count += 1;
                if let Some(r) = run_secs {
                    cold_runs.add(r);
                }
            }
            Some(false) => {
                starts.warm_count += 1;
                if let Some(r) = run_secs {
                    warm_runs.add(r);
                }
            }
            None => {}
        }

        let (entry, queue_mean, run_mean) = models
            .entry(model_id.to_string())
            .or_insert_with(|| {
                let breakdown = ModelBreakdown {
                    model_id: model_id.to_string(),
                    ..Default::default()
                };
                (breakdown, Mean::default(), Mean::default())
            });
        entry.total += 1;
        match event.state {
            RequestState::Complete => entry.complete += 1,
            RequestState::Error => entry.error += 1,
            RequestState::Timeout => entry.timeout += 1,
            RequestState::Queued | RequestState::Scheduled => entry.in_progress += 1,
            RequestState::Rejected => {}
        }
        if event.decision.cold_start == Some(true) {
            entry.cold_starts += 1;
        }
        if let Some(q) = queue_secs {
            queue_mean.add(q);
        }
        if let Some(r) = run_secs {
            run_mean.add(r);
        }
    }

    for snapshot in snapshots {
        if let Some(i) = plan.index_of(snapshot.taken_at) {
            bucket_capacity[i].add(snapshot.used_mb as f64);
        }
    }
    for (i, bucket) in buckets.iter_mut().enumerate() {
        bucket.avg_run_secs = bucket_runs[i].get();
        bucket.avg_capacity_mb = bucket_capacity[i].get();
    }

    starts.cold_avg_run_secs = cold_runs.get();
    starts.warm_avg_run_secs = warm_runs.get();

    RequestStats {
        start,
        end,
        bucket_secs: plan.width_secs,
        buckets,
        status_counts,
        models: models
            .into_values()
            .map(|(mut breakdown, queue, run)| {
                breakdown.avg_queue_secs = queue.get();
                breakdown.avg_run_secs = run.get();
                breakdown
            })
            .collect(),
        queue_depth: depth_percentiles(depths),
        starts,
        avg_queue_secs: queue_all.get(),
        avg_run_secs: run_all.get(),
        total,
    }
}

fn depth_percentiles(samples: Vec<f64>) -> DepthPercentiles {
    if samples.is_empty() {
        return DepthPercentiles::default();
    }
    let n = samples.len();
    let mut data = Data::new(samples);
    DepthPercentiles {
        samples: n,
        p50: Some(data.percentile(50)),
        p90: Some(data.percentile(90)),
        p99: Some(data.percentile(99)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DecisionContext, EventSeed, RejectReason, Route, TerminalStatus};
    use chrono::{Duration, TimeZone};

    fn seed(id: &str) -> EventSeed {
        EventSeed {
            request_id: id.to_string(),
            policy_id: Some("default".into()),
            topic: "chat".into(),
            priority: 0,
            timeout_secs: None,
            failover_of: None,
        }
    }

    fn finished(
        id: &str,
        model: &str,
        kind: ProviderKind,
        at: DateTime<Utc>,
        depth: u32,
        cold: bool,
        run_secs: i64,
    ) -> RequestEvent {
        let route = Route {
            model_id: model.into(),
            provider_id: format!("{model}-host"),
            provider_kind: kind,
        };
        let decision = DecisionContext {
            cold_start: Some(cold),
            ..Default::default()
        };
        let mut event = RequestEvent::queued(seed(id), route, depth, decision.clone(), at);
        event
            .mark_scheduled(at + Duration::seconds(2), 0, decision)
            .unwrap();
        event
            .finish(
                TerminalStatus::Success,
                at + Duration::seconds(2 + run_secs),
                None,
            )
            .unwrap();
        event
    }

    #[test]
    fn test_aggregate_splits_by_kind_status_and_model() {
        let t0 = Utc.with_ymd_and_hms(2026, 5, 4, 0, 0, 0).unwrap();
        let events = vec![
            finished("a", "llama", ProviderKind::LocalCapacity, t0, 1, true, 10),
            finished("b", "llama", ProviderKind::LocalCapacity, t0 + Duration::minutes(30), 3, false, 4),
            finished("c", "gpt", ProviderKind::RateLimited, t0 + Duration::hours(1), 1, false, 2),
            RequestEvent::rejected(seed("d"), RejectReason::NoTagMatch, t0 + Duration::hours(1)),
        ];
        let snapshots = vec![ProviderSnapshot {
            provider_id: "llama-host".into(),
            seq: 1,
            taken_at: t0 + Duration::minutes(5),
            total_mb: 8000,
            used_mb: 3000,
            loaded: vec![],
        }];

        let stats = aggregate_requests(&events, &snapshots, t0, t0 + Duration::hours(2), 2);

        assert_eq!(stats.bucket_secs, 3600);
        assert_eq!(stats.buckets.len(), 2);
        assert_eq!(stats.buckets[0].local, 2);
        assert_eq!(stats.buckets[0].avg_run_secs, Some(7.0));
        assert_eq!(stats.buckets[0].avg_capacity_mb, Some(3000.0));
        assert_eq!(stats.buckets[1].cloud, 1);
        assert_eq!(stats.buckets[1].total, 2);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.status_counts[&RequestState::Complete], 3);
        assert_eq!(stats.status_counts[&RequestState::Rejected], 1);

        assert_eq!(stats.models.len(), 2);
        assert_eq!(stats.models[1].model_id, "llama");
        assert_eq!(stats.models[1].cold_starts, 1);
        assert_eq!(stats.models[1].avg_queue_secs, Some(2.0));

        assert_eq!(stats.starts.cold_count, 1);
        assert_eq!(stats.starts.warm_count, 2);
        assert_eq!(stats.starts.warm_avg_run_secs, Some(3.0));
        assert_eq!(stats.queue_depth.samples, 3);
        assert!(stats.queue_depth.p99.unwrap() >= stats.queue_depth.p50.unwrap());
    }

    #[test]
    fn test_empty_range_has_no_averages() {
        let t0 = Utc::now();
        let stats = aggregate_requests(&[], &[], t0, t0 + Duration::hours(1), 24);
        assert_eq!(stats.total, 0);
        assert!(stats.buckets.iter().all(|b| b.avg_run_secs.is_none()));
        assert_eq!(stats.queue_depth, DepthPercentiles::default());
    }
}
