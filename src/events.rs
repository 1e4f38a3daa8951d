//! In-process pub/sub for typed run events. Each subscription is a bounded
//! ring buffer: a slow subscriber never stalls the publisher, and a full
//! buffer evicts its oldest event (logged, counted) to make room for the
//! new one. The history sink subscribes with a larger buffer since losing
//! an event there is not acceptable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

/// Default bounded-channel capacity for an ordinary subscriber.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;
/// Capacity used by the history sink, which must not lose events under
/// ordinary load.
pub const HISTORY_SINK_CAPACITY: usize = 8192;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: String,
    /// Assigned by the history store on insert; zero until persisted.
    pub seq: u64,
    pub time: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub unit: Option<String>,
    pub task: Option<usize>,
    pub pr: Option<u64>,
    pub payload: Value,
    pub error: Option<String>,
}

impl Event {
    pub fn new(run_id: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            run_id: run_id.into(),
            seq: 0,
            time: chrono::Utc::now(),
            event_type: event_type.into(),
            unit: None,
            task: None,
            pr: None,
            payload,
            error: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_task(mut self, task: usize) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_pr(mut self, pr: u64) -> Self {
        self.pr = Some(pr);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Ring buffer backing one subscription. Shared between the `EventBus`
/// (which holds only a `Weak` reference, so a dropped `Subscriber` is
/// reclaimed by `prune_closed`) and the `Subscriber` itself.
struct Ring {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl Ring {
    fn push(&self, event: Event) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("event subscriber buffer full, dropping oldest event to admit {:?}", event.event_type);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

struct Subscription {
    ring: Weak<Ring>,
    type_prefix: Option<String>,
}

/// Fan-out conduit for one run's events. Not a source of truth: the
/// authoritative ordering is assigned by `crate::history::HistoryStore`
/// on insert, not by this bus.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscription>>,
}

pub struct Subscriber {
    ring: Arc<Ring>,
}

impl Subscriber {
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.ring.queue.lock().pop_front() {
                return Some(event);
            }
            self.ring.notify.notified().await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, capacity: usize, type_prefix: Option<String>) -> Subscriber {
        let ring = Arc::new(Ring {
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        self.subscribers.lock().push(Subscription {
            ring: Arc::downgrade(&ring),
            type_prefix,
        });
        Subscriber { ring }
    }

    /// Publishes to every matching subscriber. Never blocks on a slow
    /// subscriber: a full ring evicts its oldest event instead.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock();
        for sub in subscribers.iter() {
            if let Some(prefix) = &sub.type_prefix {
                if !event.event_type.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if let Some(ring) = sub.ring.upgrade() {
                ring.push(event.clone());
            }
        }
    }

    /// Removes subscriptions whose `Subscriber` has been dropped, used
    /// periodically so a long-lived bus doesn't accumulate dead entries.
    pub fn prune_closed(&self) {
        self.subscribers.lock().retain(|sub| sub.ring.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn subscriber_receives_matching_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(DEFAULT_SUBSCRIBER_CAPACITY, Some("unit.".into()));
        bus.publish(Event::new("run_1", "unit.started", json!({})).with_unit("a"));
        bus.publish(Event::new("run_1", "run.completed", json!({})));
        let got = sub.recv().await.unwrap();
        assert_eq!(got.event_type, "unit.started");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_without_blocking_publish() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(1, None);
        bus.publish(Event::new("run_1", "a", json!({})));
        bus.publish(Event::new("run_1", "b", json!({})));
        assert_eq!(sub.dropped(), 1);
        let got = sub.recv().await.unwrap();
        assert_eq!(got.event_type, "b");
    }

    #[tokio::test]
    async fn prune_closed_removes_dropped_subscribers() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe(4, None);
        }
        bus.prune_closed();
        assert_eq!(bus.subscribers.lock().len(), 0);
    }
}
