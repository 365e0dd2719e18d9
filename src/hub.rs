//! Per-device callback registry with synchronous fan-out.
//!
//! Handlers are invoked in registration order on the publishing thread. A
//! `Subscription` handle deregisters its handler exactly once, either through
//! `release` or on drop; after `release` returns the handler is never invoked
//! again, including when it is released from inside its own invocation.

use parking_lot::ReentrantMutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Handler<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    // Held for the whole invocation. Re-entrant so a handler can release itself.
    active: ReentrantMutex<Cell<bool>>,
    handler: Handler<T>,
}

struct Topic<T> {
    entries: Mutex<Vec<Arc<Entry<T>>>>,
}

impl<T> Topic<T> {
    fn snapshot(&self) -> Vec<Arc<Entry<T>>> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn remove(&self, id: u64) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.retain(|e| e.id != id);
    }

    fn push(&self, entry: Arc<Entry<T>>) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push(entry);
    }

    fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Registry of handlers keyed by device id.
pub struct SubscriptionHub<T> {
    topics: Mutex<HashMap<i64, Arc<Topic<T>>>>,
    next_id: AtomicU64,
}

impl<T: 'static> SubscriptionHub<T> {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn topic(&self, device_id: i64) -> Option<Arc<Topic<T>>> {
        let topics = match self.topics.lock() {
            Ok(topics) => topics,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics.get(&device_id).cloned()
    }

    /// Register `handler` for payloads published on `device_id`.
    pub fn subscribe<F>(&self, device_id: i64, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let topic = {
            let mut topics = match self.topics.lock() {
                Ok(topics) => topics,
                Err(poisoned) => poisoned.into_inner(),
            };
            topics
                .entry(device_id)
                .or_insert_with(|| {
                    Arc::new(Topic {
                        entries: Mutex::new(Vec::new()),
                    })
                })
                .clone()
        };

        let entry = Arc::new(Entry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            active: ReentrantMutex::new(Cell::new(true)),
            handler: Box::new(handler),
        });
        topic.push(entry.clone());

        tracing::debug!(device_id, subscription_id = entry.id, "Subscriber registered");

        let weak_topic: Weak<Topic<T>> = Arc::downgrade(&topic);
        Subscription {
            release: Box::new(move || {
                {
                    let active = entry.active.lock();
                    if !active.replace(false) {
                        return;
                    }
                }
                if let Some(topic) = weak_topic.upgrade() {
                    topic.remove(entry.id);
                }
                tracing::debug!(device_id, subscription_id = entry.id, "Subscriber released");
            }),
        }
    }

    /// Invoke every handler registered for `device_id`, in registration order.
    ///
    /// A panicking handler is logged and skipped; the remaining handlers still
    /// run. Returns the number of handlers invoked.
    pub fn publish(&self, device_id: i64, payload: &T) -> usize {
        let Some(topic) = self.topic(device_id) else {
            return 0;
        };

        let mut delivered = 0;
        for entry in topic.snapshot() {
            let active = entry.active.lock();
            if !active.get() {
                continue;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(payload)));
            match result {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::error!(device_id, subscription_id = entry.id, "Subscriber panicked during dispatch");
                }
            }
        }
        delivered
    }

    /// Whether any handler is currently registered for `device_id`.
    pub fn has_subscribers(&self, device_id: i64) -> bool {
        self.topic(device_id).map(|t| t.len() > 0).unwrap_or(false)
    }
}

impl<T: 'static> Default for SubscriptionHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`SubscriptionHub::subscribe`].
///
/// Releasing twice is a no-op. Dropping the handle releases it.
pub struct Subscription {
    release: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    pub fn release(&self) {
        (self.release)();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
