//! Bucket width selection.
//!
//! A requested bucket count is a target, not a contract: the width is
//! rounded up to the next human-friendly interval and buckets are aligned
//! to multiples of that width since the Unix epoch.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// Candidate widths in seconds, ascending.
const NICE_WIDTHS: &[i64] = &[
    1,
    5,
    10,
    15,
    30,
    MINUTE,
    5 * MINUTE,
    10 * MINUTE,
    15 * MINUTE,
    30 * MINUTE,
    HOUR,
    2 * HOUR,
    3 * HOUR,
    6 * HOUR,
    12 * HOUR,
    DAY,
    7 * DAY,
];

/// Smallest friendly width whose bucket count over `range_secs` does not
/// exceed `target`. Beyond a week, whole days.
pub fn nice_width_secs(range_secs: i64, target: u32) -> i64 {
    let target = i64::from(target.max(1));
    let raw = (range_secs.max(1) + target - 1) / target;
    NICE_WIDTHS
        .iter()
        .copied()
        .find(|w| *w >= raw)
        .unwrap_or_else(|| ((raw + DAY - 1) / DAY) * DAY)
}

/// Aligned bucket layout over `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketPlan {
    pub origin: DateTime<Utc>,
    pub width_secs: i64,
    pub count: usize,
}

impl BucketPlan {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, target: u32) -> Self {
        let range = (end - start).num_seconds().max(1);
        let width_secs = nice_width_secs(range, target);
        let aligned = start.timestamp().div_euclid(width_secs) * width_secs;
        let origin = Utc.timestamp_opt(aligned, 0).single().unwrap_or(start);
        let span = (end - origin).num_seconds().max(1);
        let count = usize::try_from((span + width_secs - 1) / width_secs).unwrap_or(0);
        Self {
            origin,
            width_secs,
            count,
        }
    }

    /// Bucket containing `at`, if inside the plan.
    pub fn index_of(&self, at: DateTime<Utc>) -> Option<usize> {
        let offset = (at - self.origin).num_seconds();
        if offset < 0 {
            return None;
        }
        let index = usize::try_from(offset / self.width_secs).ok()?;
        (index < self.count).then_some(index)
    }

    pub fn start_of(&self, index: usize) -> DateTime<Utc> {
        let offset = i64::try_from(index).unwrap_or(i64::MAX / 2) * self.width_secs;
        self.origin + Duration::seconds(offset)
    }
}
