//! A synchronous pub-sub event bus, parallel to the `metrics` facade used
//! elsewhere: this carries structured lifecycle events for callers that want
//! to react to them (e.g. a demo binary wiring up its own audit log), while
//! `metrics::counter!`/`gauge!` carry the ambient numeric telemetry.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::errors::RateLimitKeyType;
use crate::Channel;

pub type SubscriptionId = u64;

#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    ItemEnqueued { item_id: Uuid, channel: Channel },
    ItemProcessing { item_id: Uuid, channel: Channel, attempt: u32 },
    ItemSent { item_id: Uuid, channel: Channel, attempts: u32 },
    ItemFailed { item_id: Uuid, channel: Channel, attempts: u32, error: String },
    ItemRetrying { item_id: Uuid, channel: Channel, attempts: u32, next_attempt_at: DateTime<Utc> },
    ItemDeadLettered { item_id: Uuid, channel: Channel, attempts: u32, error: String },
    ProcessorStarted,
    ProcessorStopped,
    ProcessorPaused,
    ProcessorResumed,
    RateLimitAllowed { key: String, key_type: RateLimitKeyType },
    RateLimitDenied { key: String, key_type: RateLimitKeyType, retry_after_ms: u64 },
    RateLimitOverride { key: String, priority: crate::Priority },
    RateLimitBucketCreated { key: String, key_type: RateLimitKeyType },
    DedupEntryAdded { key: String, channel: Channel },
    DedupDuplicateBlocked { key: String, channel: Channel, duplicate_count: u64 },
    DedupEntryExpired { key: String },
    DedupCacheCleanup { removed: u64 },
    DedupConfigUpdated,
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// A fan-out bus: listeners never see each other's panics, and a panicking
/// listener does not poison the bus for subsequent `emit` calls.
#[derive(Default)]
pub struct EventBus {
    listeners: DashMap<SubscriptionId, Listener>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listener_count", &self.listeners.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self { listeners: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    pub fn on<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, Arc::new(listener));
        id
    }

    pub fn off(&self, id: SubscriptionId) {
        self.listeners.remove(&id);
    }

    pub fn emit(&self, kind: EventKind) {
        let event = Event { timestamp: Utc::now(), kind };
        for entry in self.listeners.iter() {
            let listener = entry.value().clone();
            let event_ref = &event;
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event_ref))).is_err() {
                tracing::warn!("event listener panicked, isolating and continuing");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_all_listeners() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        bus.on(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        bus.on(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(EventKind::ProcessorStarted);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));
        let reached2 = reached.clone();
        bus.on(|_| panic!("boom"));
        bus.on(move |_| {
            reached2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(EventKind::ProcessorStopped);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_listener() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let id = bus.on(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        bus.off(id);
        bus.emit(EventKind::ProcessorStarted);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
