//! In-process publish/subscribe connecting state changes to sessions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Future, FutureExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::task::TaskTracker;

use crate::models::EventType;

pub type EventCallback = Arc<dyn Fn(EventType, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an [EventCallback].
pub fn callback<F, Fut>(f: F) -> EventCallback
where
    F: Fn(EventType, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event, data| f(event, data).boxed())
}

struct Inner {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(u64, EventCallback)>>,
}

/// Subscriber list plus the tasks delivering to it. Cloning shares the bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
    tracker: TaskTracker,
}

/// Removes one subscription. Only the first call has an effect.
pub struct Unsubscribe {
    bus: Weak<Inner>,
    id: u64,
    done: AtomicBool,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.write().retain(|(id, _)| *id != self.id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(Vec::new()),
            }),
            tracker: TaskTracker::new(),
        }
    }

    pub fn subscribe(&self, callback: EventCallback) -> Unsubscribe {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((id, callback));
        Unsubscribe {
            bus: Arc::downgrade(&self.inner),
            id,
            done: AtomicBool::new(false),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Deliver to a snapshot of the current subscribers, one task each.
    /// Never waits for a subscriber. Must be called inside a tokio runtime.
    pub fn publish(&self, event: EventType, data: Value) {
        let snapshot: Vec<EventCallback> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        log::debug!("publish {} to {} subscribers", event, snapshot.len());
        for cb in snapshot {
            self.tracker.spawn(cb(event, data.clone()));
        }
    }

    /// Stop accepting deliveries and wait up to `limit` for running ones.
    pub async fn close(&self, limit: Duration) {
        self.tracker.close();
        if tokio::time::timeout(limit, self.tracker.wait()).await.is_err() {
            log::warn!(
                "{} event deliveries still running after {:?}",
                self.tracker.len(),
                limit
            );
        }
    }
}
