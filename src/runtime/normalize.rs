//! Window normalization and utilization arithmetic.
//!
//! These functions are pure: they take the intervals a store returned for a
//! window and produce a gap-free cover of that window. Missing data counts as
//! `Offline`.

use crate::db::{RuntimeInterval, RuntimeSummary, Status};

use chrono::{DateTime, Duration, Utc};

/// Clip `intervals` (ordered by start) to `[from, to]` and fill every gap
/// with a synthesized `Offline` interval.
///
/// An interval without an end is treated as running until `to`. The result
/// is ordered, non-overlapping, and covers the window exactly. It is empty
/// only when `from >= to`.
pub fn normalize(
    device_id: i64,
    intervals: &[RuntimeInterval],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<RuntimeInterval> {
    if from >= to {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(intervals.len() * 2 + 1);
    let mut cursor = from;

    for interval in intervals {
        let start = interval.start_time.max(cursor);
        let end = interval.end_time.unwrap_or(to).min(to);
        if start >= end {
            continue;
        }

        if start > cursor {
            out.push(RuntimeInterval::closed(device_id, Status::Offline, cursor, start));
        }
        out.push(RuntimeInterval::closed(device_id, interval.status, start, end));
        cursor = end;
    }

    if cursor < to {
        out.push(RuntimeInterval::closed(device_id, Status::Offline, cursor, to));
    }

    out
}

/// Normalize and compute the per-status utilization of `[from, to)`.
pub fn summarize(
    device_id: i64,
    intervals: &[RuntimeInterval],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> RuntimeSummary {
    if from >= to {
        return RuntimeSummary::default();
    }

    let normalized = normalize(device_id, intervals, from, to);
    let total = seconds(to - from);

    let mut per_status = [0.0f64; 4];
    for interval in &normalized {
        per_status[interval.status.code() as usize] += seconds(interval.duration());
    }

    let share = |status: Status| round2(per_status[status.code() as usize] / total);

    RuntimeSummary {
        offline_utilization: share(Status::Offline),
        standby_utilization: share(Status::Standby),
        running_utilization: share(Status::Running),
        alarm_utilization: share(Status::Alarm),
        intervals: normalized,
    }
}

/// Unrounded fraction of `[from, to)` spent in `status`.
pub fn fraction(
    device_id: i64,
    intervals: &[RuntimeInterval],
    status: Status,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> f64 {
    if from >= to {
        return 0.0;
    }
    let spent: f64 = normalize(device_id, intervals, from, to)
        .iter()
        .filter(|i| i.status == status)
        .map(|i| seconds(i.duration()))
        .sum();
    spent / seconds(to - from)
}

/// Round half away from zero to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn seconds(d: Duration) -> f64 {
    match d.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => d.num_milliseconds() as f64 / 1000.0,
    }
}
