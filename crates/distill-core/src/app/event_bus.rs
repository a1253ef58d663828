//! EventBus - in-process pub/sub for pipeline events
//!
//! Each subscription owns an unbounded channel drained by one spawned task,
//! so a subscriber sees events in emission order and its callback never runs
//! concurrently with itself. `emit` never waits on a callback.
//!
//! There is no replay: events emitted before `on` returns are not delivered
//! to that subscription.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::domain::{EventName, PipelineEvent};

type Callback = Arc<dyn Fn(PipelineEvent) -> BoxFuture<'static, ()> + Send + Sync>;

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<HashMap<EventName, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, name: EventName, id: u64) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subscribers.get_mut(&name) {
            list.retain(|s| s.id != id);
        }
    }
}

/// Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to events named `name`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on<F, Fut>(&self, name: EventName, callback: F) -> Subscription
    where
        F: Fn(PipelineEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Arc::new(move |event| Box::pin(callback(event)));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel::<PipelineEvent>();

        let drain_cancelled = Arc::clone(&cancelled);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if drain_cancelled.load(Ordering::Acquire) {
                    break;
                }
                callback(event).await;
            }
            trace!(subscription = id, "subscription drained");
        });

        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name)
            .or_default()
            .push(Subscriber { id, tx });
        debug!(event = %name, subscription = id, "subscribed");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            name,
            id,
            cancelled,
        }
    }

    /// Queue `event` for every live subscriber of its name. Returns how many
    /// subscribers it was queued for.
    pub fn emit(&self, event: PipelineEvent) -> usize {
        let name = event.name();
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subscribers.get_mut(&name) else {
            trace!(event = %name, unit_id = %event.unit_id, "no subscribers");
            return 0;
        };
        list.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for s in list.iter() {
            if s.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(event = %name, unit_id = %event.unit_id, delivered, "emitted");
        delivered
    }

    pub fn subscriber_count(&self, name: EventName) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .map(|list| list.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// Handle returned by [`EventBus::on`]. Dropping it cancels the subscription.
pub struct Subscription {
    bus: Weak<Inner>,
    name: EventName,
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl Subscription {
    pub fn event(&self) -> EventName {
        self.name
    }

    /// Stop delivery. A callback already running finishes; queued events are
    /// discarded.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(self.name, self.id);
        }
        debug!(event = %self.name, subscription = self.id, "unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
