//! Runtime timeline engine.
//!
//! Turns a stream of status observations into stored runtime intervals and
//! answers utilization and summary queries over arbitrary windows.

mod normalize;

pub use normalize::*;

use crate::db::{DbError, RuntimeInterval, RuntimeStore, RuntimeSummary, Status};
use crate::hub::{Subscription, SubscriptionHub};

use chrono::{DateTime, Local, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Timeline error types.
#[derive(Error, Debug)]
pub enum TimelineError {
    #[error("store error: {0}")]
    Store(#[from] DbError),
    #[error("observation at {timestamp} for device {device_id} is older than its latest interval boundary {boundary}")]
    OutOfOrder {
        device_id: i64,
        timestamp: DateTime<Utc>,
        boundary: DateTime<Utc>,
    },
}

/// Tracks the open interval of every device and answers window queries.
pub struct RuntimeTimeline {
    store: Arc<dyn RuntimeStore>,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    summaries: SubscriptionHub<RuntimeSummary>,
}

impl RuntimeTimeline {
    pub fn new(store: Arc<dyn RuntimeStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            summaries: SubscriptionHub::new(),
        }
    }

    fn device_lock(&self, device_id: i64) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(device_id).or_default().clone()
    }

    /// Record that `device_id` was seen in `status` at `timestamp`.
    ///
    /// Timestamps must be non-decreasing per device; an observation earlier
    /// than the latest stored boundary is rejected without touching the store.
    pub fn on_status_observed(
        &self,
        device_id: i64,
        status: Status,
        timestamp: DateTime<Utc>,
    ) -> Result<(), TimelineError> {
        {
            let lock = self.device_lock(device_id);
            let _guard = match lock.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.apply(device_id, status, timestamp)?;
        }

        if self.summaries.has_subscribers(device_id) {
            match self.get_summary(device_id, None, Some(timestamp)) {
                Ok(summary) => {
                    self.summaries.publish(device_id, &summary);
                }
                Err(e) => {
                    tracing::warn!(device_id, "Failed to build runtime summary: {}", e);
                }
            }
        }

        Ok(())
    }

    fn apply(&self, device_id: i64, status: Status, timestamp: DateTime<Utc>) -> Result<(), TimelineError> {
        let Some(last) = self.store.get_latest(device_id)? else {
            self.store.append(&RuntimeInterval::open(device_id, status, timestamp))?;
            tracing::debug!(device_id, ?status, "Opened first runtime interval");
            return Ok(());
        };

        let boundary = last.end_time.unwrap_or(last.start_time);
        if timestamp < boundary {
            return Err(TimelineError::OutOfOrder {
                device_id,
                timestamp,
                boundary,
            });
        }

        if last.status == status {
            // Same status: extend.
            let extended = RuntimeInterval::closed(device_id, status, last.start_time, timestamp);
            self.store.update_most_recent(&extended)?;
        } else if timestamp == last.start_time {
            // The previous interval never gained any duration; relabel it.
            self.store
                .update_most_recent(&RuntimeInterval::open(device_id, status, timestamp))?;
            tracing::debug!(device_id, from = ?last.status, to = ?status, "Relabelled empty runtime interval");
        } else {
            let closed = RuntimeInterval::closed(device_id, last.status, last.start_time, timestamp);
            let opened = RuntimeInterval::open(device_id, status, timestamp);
            self.store.transition(&closed, &opened)?;
            tracing::debug!(device_id, from = ?last.status, to = ?status, "Runtime status changed");
        }

        Ok(())
    }

    /// Normalized runtime breakdown for `[from, to)`.
    ///
    /// `from` defaults to local start of day. `to` defaults to now and is
    /// clamped to now when it lies in the future.
    pub fn get_summary(
        &self,
        device_id: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<RuntimeSummary, TimelineError> {
        let now = Utc::now();
        let from = from.unwrap_or_else(|| start_of_day(now));
        let to = clamp_to_now(to, now);
        if from >= to {
            return Ok(RuntimeSummary::default());
        }

        let intervals = self.store.query_range(device_id, from, to)?;
        Ok(summarize(device_id, &intervals, from, to))
    }

    /// Running fraction of `[from, to)`, unrounded.
    ///
    /// Unlike [`get_summary`](Self::get_summary), `from` defaults to the start
    /// of the earliest stored interval. Returns 0.0 when there is no data or
    /// the window is empty.
    pub fn get_utilization(
        &self,
        device_id: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<f64, TimelineError> {
        let now = Utc::now();
        let to = clamp_to_now(to, now);
        let from = match from {
            Some(from) => from,
            None => match self.store.get_earliest(device_id)? {
                Some(earliest) => earliest.start_time,
                None => return Ok(0.0),
            },
        };
        if from >= to {
            return Ok(0.0);
        }

        let intervals = self.store.query_range(device_id, from, to)?;
        if intervals.is_empty() {
            return Ok(0.0);
        }
        Ok(fraction(device_id, &intervals, Status::Running, from, to))
    }

    /// Receive a fresh summary (today so far) after every observation.
    pub fn subscribe_summary<F>(&self, device_id: i64, handler: F) -> Subscription
    where
        F: Fn(&RuntimeSummary) + Send + Sync + 'static,
    {
        self.summaries.subscribe(device_id, handler)
    }
}

fn clamp_to_now(to: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match to {
        Some(to) if to < now => to,
        _ => now,
    }
}

/// Local midnight of the day containing `now`, expressed in UTC.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_timezone(&Local)
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or(now)
}
