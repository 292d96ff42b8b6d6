//! Per-provider capacity over one calendar day (UTC).

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::buckets::BucketPlan;
use crate::types::{ModelId, ProviderId, ProviderSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityPoint {
    pub start: DateTime<Utc>,
    pub samples: usize,
    pub used_mb: Option<f64>,
    pub remaining_mb: Option<f64>,
    /// Models loaded in the last snapshot of the bucket
    pub loaded_models: Vec<ModelId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCapacitySeries {
    pub provider_id: ProviderId,
    pub points: Vec<CapacityPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityDay {
    pub day: NaiveDate,
    pub bucket_secs: i64,
    pub providers: Vec<ProviderCapacitySeries>,
}

/// `[00:00, 24:00)` UTC of `day`.
pub fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day.and_time(chrono::NaiveTime::MIN).and_utc();
    (start, start + Duration::days(1))
}

/// Bucket the day's snapshots per provider. Input order does not matter.
pub fn capacity_for_day(snapshots: &[ProviderSnapshot], day: NaiveDate, bucket_count: u32) -> CapacityDay {
    let (start, end) = day_bounds(day);
    let plan = BucketPlan::new(start, end, bucket_count);

    let mut by_provider: BTreeMap<&str, Vec<&ProviderSnapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        if plan.index_of(snapshot.taken_at).is_some() {
            by_provider.entry(snapshot.provider_id.as_str()).or_default().push(snapshot);
        }
    }

    let providers = by_provider
        .into_iter()
        .map(|(provider_id, mut rows)| {
            rows.sort_by_key(|s| (s.taken_at, s.seq));
            let mut points: Vec<CapacityPoint> = (0..plan.count)
                .map(|i| CapacityPoint {
                    start: plan.start_of(i),
                    samples: 0,
                    used_mb: None,
                    remaining_mb: None,
                    loaded_models: Vec::new(),
                })
                .collect();
            let mut sums = vec![(0.0_f64, 0.0_f64); plan.count];

            for snapshot in rows {
                let Some(i) = plan.index_of(snapshot.taken_at) else {
                    continue;
                };
                sums[i].0 += snapshot.used_mb as f64;
                sums[i].1 += snapshot.headroom_mb() as f64;
                let point = &mut points[i];
                point.samples += 1;
                point.loaded_models = snapshot.loaded.iter().map(|m| m.model_id.clone()).collect();
            }
            for (point, (used, remaining)) in points.iter_mut().zip(sums) {
                if point.samples > 0 {
                    let n = point.samples as f64;
                    point.used_mb = Some(used / n);
                    point.remaining_mb = Some(remaining / n);
                }
            }
            ProviderCapacitySeries {
                provider_id: provider_id.to_string(),
                points,
            }
        })
        .collect();

    CapacityDay {
        day,
        bucket_secs: plan.width_secs,
        providers,
    }
}
