//! Sliding-window duplicate suppression.
//!
//! Grounded on the teacher's per-key `DashMap` tracking pattern
//! (`fc-router::pool` `message_group_queues`/`failed_batch_groups`): an
//! independent, concurrently-accessed entry per key, no whole-map lock held
//! across an `.await`.

pub mod key_gen;

pub use key_gen::{DefaultKeyGenerator, KeyGenerator};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use notify_common::{events::EventKind, Channel, EventBus, NotificationPayload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub channel: Channel,
    pub expires_at: DateTime<Utc>,
    pub original_item_id: Option<uuid::Uuid>,
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub window_by_channel: HashMap<Channel, Duration>,
    pub default_window: Duration,
    pub max_entries: usize,
    pub include_correlation_id: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        let mut window_by_channel = HashMap::new();
        window_by_channel.insert(Channel::Email, Duration::hours(1));
        window_by_channel.insert(Channel::Sms, Duration::hours(1));
        window_by_channel.insert(Channel::Telegram, Duration::minutes(5));
        window_by_channel.insert(Channel::Discord, Duration::minutes(5));
        window_by_channel.insert(Channel::Push, Duration::minutes(2));
        Self {
            window_by_channel,
            default_window: Duration::minutes(5),
            max_entries: 100_000,
            include_correlation_id: false,
        }
    }
}

impl DedupConfig {
    pub fn window_for(&self, channel: Channel) -> Duration {
        self.window_by_channel.get(&channel).copied().unwrap_or(self.default_window)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupStats {
    pub entry_count: u64,
    pub duplicates_blocked: u64,
    pub entries_recorded: u64,
}

#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// Fingerprints `payload` (folding in `correlation_id` when configured)
    /// and returns `true` if the fingerprint has an unexpired entry (a
    /// duplicate).
    async fn check(&self, payload: &NotificationPayload, correlation_id: Option<&str>) -> bool;

    /// Record `payload` as seen, extending its window. `original_item_id`
    /// is carried onto the stored entry so the original enqueued item can
    /// be traced from a later duplicate hit.
    async fn record(&self, payload: &NotificationPayload, correlation_id: Option<&str>, original_item_id: Option<uuid::Uuid>);

    /// Atomically check-then-record: returns `true` the first time a
    /// payload's fingerprint is seen (not a duplicate, now recorded),
    /// `false` on every subsequent call within the window (a duplicate, not
    /// re-recorded as new but its counters are bumped).
    async fn check_and_record(&self, payload: &NotificationPayload, correlation_id: Option<&str>) -> bool;

    async fn has(&self, key: &str) -> bool;

    async fn remove(&self, key: &str);

    /// Evict expired entries and, if over `max_entries`, the oldest
    /// remaining ones by `first_seen`. Returns the number removed.
    async fn cleanup(&self) -> u64;

    async fn get_stats(&self) -> DedupStats;

    async fn clear(&self);

    fn update_config(&self, config: DedupConfig);

    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;
}

/// Reference `Deduplicator`: a sharded `DashMap<String, DedupEntry>` guarded
/// per-entry, with a `RwLock<DedupConfig>` for hot config updates.
pub struct SlidingWindowDeduplicator {
    entries: DashMap<String, DedupEntry>,
    config: parking_lot::RwLock<DedupConfig>,
    enabled: AtomicBool,
    duplicates_blocked: AtomicU64,
    entries_recorded: AtomicU64,
    clock: Arc<dyn notify_common::Clock>,
    events: Option<Arc<EventBus>>,
    key_gen: Arc<dyn KeyGenerator>,
}

impl SlidingWindowDeduplicator {
    pub fn new(clock: Arc<dyn notify_common::Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            config: parking_lot::RwLock::new(DedupConfig::default()),
            enabled: AtomicBool::new(true),
            duplicates_blocked: AtomicU64::new(0),
            entries_recorded: AtomicU64::new(0),
            clock,
            events: None,
            key_gen: Arc::new(DefaultKeyGenerator::default()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_config(self, config: DedupConfig) -> Self {
        *self.config.write() = config;
        self
    }

    pub fn with_key_gen(mut self, key_gen: Arc<dyn KeyGenerator>) -> Self {
        self.key_gen = key_gen;
        self
    }

    fn fingerprint(&self, payload: &NotificationPayload, correlation_id: Option<&str>) -> String {
        let correlation_id = if self.config.read().include_correlation_id { correlation_id } else { None };
        self.key_gen.generate_key(payload, correlation_id)
    }

    fn emit(&self, kind: EventKind) {
        if let Some(bus) = &self.events {
            bus.emit(kind);
        }
    }

    fn is_live(entry: &DedupEntry, now: DateTime<Utc>) -> bool {
        entry.expires_at > now
    }
}

#[async_trait]
impl Deduplicator for SlidingWindowDeduplicator {
    async fn check(&self, payload: &NotificationPayload, correlation_id: Option<&str>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let key = self.fingerprint(payload, correlation_id);
        let now = self.clock.now();
        match self.entries.get(&key) {
            Some(entry) => Self::is_live(&entry, now),
            None => false,
        }
    }

    async fn record(&self, payload: &NotificationPayload, correlation_id: Option<&str>, original_item_id: Option<uuid::Uuid>) {
        if !self.is_enabled() {
            return;
        }
        let channel = payload.channel();
        let key = self.fingerprint(payload, correlation_id);
        let now = self.clock.now();
        let window = self.config.read().window_for(channel);
        self.entries
            .entry(key.clone())
            .and_modify(|entry| {
                entry.last_seen = now;
                entry.count += 1;
                entry.expires_at = now + window;
            })
            .or_insert_with(|| {
                self.entries_recorded.fetch_add(1, Ordering::Relaxed);
                DedupEntry { first_seen: now, last_seen: now, count: 1, channel, expires_at: now + window, original_item_id }
            });
        self.emit(EventKind::DedupEntryAdded { key, channel });
    }

    async fn check_and_record(&self, payload: &NotificationPayload, correlation_id: Option<&str>) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let channel = payload.channel();
        let key = self.fingerprint(payload, correlation_id);
        let now = self.clock.now();
        let window = self.config.read().window_for(channel);

        let mut is_new = false;
        let mut duplicate_count = 0u64;
        self.entries
            .entry(key.clone())
            .and_modify(|entry| {
                if Self::is_live(entry, now) {
                    entry.count += 1;
                    entry.last_seen = now;
                    duplicate_count = entry.count;
                } else {
                    // Expired entry reused as a fresh window.
                    entry.first_seen = now;
                    entry.last_seen = now;
                    entry.count = 1;
                    entry.channel = channel;
                    entry.expires_at = now + window;
                    entry.original_item_id = None;
                    is_new = true;
                }
            })
            .or_insert_with(|| {
                is_new = true;
                DedupEntry { first_seen: now, last_seen: now, count: 1, channel, expires_at: now + window, original_item_id: None }
            });

        if is_new {
            self.entries_recorded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("notify_dedup.entries_recorded_total", "channel" => channel.as_str()).increment(1);
            self.emit(EventKind::DedupEntryAdded { key, channel });
            true
        } else {
            self.duplicates_blocked.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("notify_dedup.duplicates_blocked_total", "channel" => channel.as_str()).increment(1);
            self.emit(EventKind::DedupDuplicateBlocked { key, channel, duplicate_count });
            false
        }
    }

    async fn has(&self, key: &str) -> bool {
        self.check(key).await
    }

    async fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn cleanup(&self) -> u64 {
        let now = self.clock.now();
        let expired_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !Self::is_live(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &expired_keys {
            self.entries.remove(key);
            self.emit(EventKind::DedupEntryExpired { key: key.clone() });
        }
        let mut removed = expired_keys.len() as u64;

        let max_entries = self.config.read().max_entries;
        if self.entries.len() > max_entries {
            let overflow = self.entries.len() - max_entries;
            let mut oldest: Vec<(String, DateTime<Utc>)> = self
                .entries
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().first_seen))
                .collect();
            oldest.sort_by_key(|(_, first_seen)| *first_seen);
            for (key, _) in oldest.into_iter().take(overflow) {
                self.entries.remove(&key);
                removed += 1;
            }
        }

        if removed > 0 {
            self.emit(EventKind::DedupCacheCleanup { removed });
        }
        removed
    }

    async fn get_stats(&self) -> DedupStats {
        DedupStats {
            entry_count: self.entries.len() as u64,
            duplicates_blocked: self.duplicates_blocked.load(Ordering::Relaxed),
            entries_recorded: self.entries_recorded.load(Ordering::Relaxed),
        }
    }

    async fn clear(&self) {
        self.entries.clear();
    }

    fn update_config(&self, config: DedupConfig) {
        *self.config.write() = config;
        self.emit(EventKind::DedupConfigUpdated);
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_common::{PayloadHeader, TestClock};

    fn deduplicator() -> (SlidingWindowDeduplicator, TestClock) {
        let clock = TestClock::at_epoch();
        let dedup = SlidingWindowDeduplicator::new(Arc::new(clock.clone()));
        (dedup, clock)
    }

    fn email(to: &str) -> NotificationPayload {
        NotificationPayload::Email { header: PayloadHeader::new("S", "B"), to: vec![to.to_string()], cc: vec![] }
    }

    fn telegram(chat_id: &str) -> NotificationPayload {
        NotificationPayload::Telegram { header: PayloadHeader::new("S", "B"), chat_id: chat_id.to_string(), parse_mode: None }
    }

    fn push(device_token: &str) -> NotificationPayload {
        NotificationPayload::Push { header: PayloadHeader::new("S", "B"), device_tokens: vec![device_token.to_string()] }
    }

    #[tokio::test]
    async fn first_call_is_not_a_duplicate() {
        let (dedup, _clock) = deduplicator();
        assert!(dedup.check_and_record(&email("a@x.com"), None).await);
    }

    #[tokio::test]
    async fn second_call_within_window_is_blocked() {
        let (dedup, _clock) = deduplicator();
        assert!(dedup.check_and_record(&email("a@x.com"), None).await);
        assert!(!dedup.check_and_record(&email("a@x.com"), None).await);
        let stats = dedup.get_stats().await;
        assert_eq!(stats.duplicates_blocked, 1);
    }

    #[tokio::test]
    async fn equivalent_payload_with_different_case_and_whitespace_is_blocked() {
        let (dedup, _clock) = deduplicator();
        assert!(dedup.check_and_record(&email("  User@Example.com "), None).await);
        assert!(!dedup.check_and_record(&email("user@example.com"), None).await);
    }

    #[tokio::test]
    async fn call_after_window_expiry_is_not_a_duplicate() {
        let (dedup, clock) = deduplicator();
        assert!(dedup.check_and_record(&telegram("c1"), None).await);
        clock.advance(Duration::minutes(6));
        assert!(dedup.check_and_record(&telegram("c1"), None).await);
    }

    #[tokio::test]
    async fn concurrent_racers_only_one_wins() {
        let (dedup, _clock) = deduplicator();
        let dedup = Arc::new(dedup);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let dedup = dedup.clone();
            handles.push(tokio::spawn(async move { dedup.check_and_record(&email("race@x.com"), None).await }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn disabled_deduplicator_never_blocks() {
        let (dedup, _clock) = deduplicator();
        dedup.set_enabled(false);
        assert!(dedup.check_and_record(&email("a@x.com"), None).await);
        assert!(dedup.check_and_record(&email("a@x.com"), None).await);
    }

    #[tokio::test]
    async fn cleanup_evicts_expired_entries() {
        let (dedup, clock) = deduplicator();
        dedup.record(&push("tok1"), None, None).await;
        clock.advance(Duration::minutes(3));
        let removed = dedup.cleanup().await;
        assert_eq!(removed, 1);
        assert_eq!(dedup.get_stats().await.entry_count, 0);
    }
}
