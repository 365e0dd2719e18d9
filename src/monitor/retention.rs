//! Retention manager for pruning old runtime history.

use crate::db::RuntimeStore;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Deletes closed runtime intervals older than the retention window.
pub struct RetentionManager {
    store: Arc<dyn RuntimeStore>,
    retention_days: u32,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn RuntimeStore>, retention_days: u32) -> Self {
        Self {
            store,
            retention_days,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the background sweep. A retention of 0 days disables it.
    pub fn start(&self) {
        if self.retention_days == 0 {
            tracing::info!("RetentionManager: disabled");
            return;
        }

        let store = self.store.clone();
        let stop = self.stop.clone();
        let retention = ChronoDuration::days(i64::from(self.retention_days));

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(store.as_ref(), retention);
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn process_retention(store: &dyn RuntimeStore, retention: ChronoDuration) -> usize {
    let cutoff = Utc::now() - retention;
    match store.delete_closed_before(cutoff) {
        Ok(deleted) => {
            if deleted > 0 {
                tracing::info!("RetentionManager: Deleted {} intervals ended before {}", deleted, cutoff);
            }
            deleted
        }
        Err(e) => {
            tracing::error!("RetentionManager: Failed to delete old intervals: {}", e);
            0
        }
    }
}
