//! Change notifications for job store writes.
//!
//! Notifications are hints: a subscriber that falls behind loses its oldest
//! hints, and publishing never blocks the writer. Consumers are expected to
//! fall back to polling the store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::models::JobKey;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventKind {
    Created,
    Updated,
    Released,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub key: JobKey,
    pub kind: JobEventKind,
}

struct SubscriberQueue {
    events: VecDeque<JobEvent>,
    dropped: u64,
    wakeup: Arc<Notify>,
}

struct Registry {
    capacity: usize,
    next_id: u64,
    subscribers: HashMap<u64, SubscriberQueue>,
}

/// Owned subscriber registry. Cloning shares the registry.
#[derive(Clone)]
pub struct JobNotifier {
    registry: Arc<Mutex<Registry>>,
}

impl Default for JobNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl JobNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                capacity: capacity.max(1),
                next_id: 0,
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Register a new subscriber. Dropping the returned handle unsubscribes it.
    pub fn subscribe(&self) -> JobSubscription {
        let wakeup = Arc::new(Notify::new());
        let mut registry = self.registry.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        let capacity = registry.capacity;
        registry.subscribers.insert(
            id,
            SubscriberQueue {
                events: VecDeque::with_capacity(capacity),
                dropped: 0,
                wakeup: wakeup.clone(),
            },
        );
        JobSubscription {
            id,
            registry: self.registry.clone(),
            wakeup,
        }
    }

    /// Deliver `event` to every subscriber, discarding each full queue's oldest entry.
    pub fn publish(&self, event: JobEvent) {
        let mut registry = self.registry.lock().unwrap();
        let capacity = registry.capacity;
        for queue in registry.subscribers.values_mut() {
            if queue.events.len() >= capacity {
                queue.events.pop_front();
                queue.dropped += 1;
            }
            queue.events.push_back(event.clone());
            queue.wakeup.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().unwrap().subscribers.len()
    }
}

/// A subscriber's end of the notification stream.
pub struct JobSubscription {
    id: u64,
    registry: Arc<Mutex<Registry>>,
    wakeup: Arc<Notify>,
}

impl JobSubscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> JobEvent {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            // notify_one stores a permit when nobody is waiting, so a publish
            // between try_recv and here is not lost.
            self.wakeup.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<JobEvent> {
        let mut registry = self.registry.lock().unwrap();
        registry
            .subscribers
            .get_mut(&self.id)
            .and_then(|queue| queue.events.pop_front())
    }

    /// Discard everything queued so far, returning how many events were pending.
    pub fn drain(&mut self) -> usize {
        let mut registry = self.registry.lock().unwrap();
        registry
            .subscribers
            .get_mut(&self.id)
            .map(|queue| {
                let pending = queue.events.len();
                queue.events.clear();
                pending
            })
            .unwrap_or(0)
    }

    /// Number of events discarded because this subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        let registry = self.registry.lock().unwrap();
        registry
            .subscribers
            .get(&self.id)
            .map(|queue| queue.dropped)
            .unwrap_or(0)
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.subscribers.remove(&self.id);
        }
    }
}
