//! Hierarchical rate limiting: GLOBAL, CHANNEL, RECIPIENT, USER and
//! CHANNEL_RECIPIENT buckets evaluated in that order, with priority
//! override and hot-swappable per-scope configuration.
//!
//! `BucketRegistry` generalizes two teacher patterns at once: the
//! per-endpoint keyed registry shape of
//! `fc-router::circuit_breaker_registry` (a map of independent stateful
//! trackers behind a lock) and the hot-swappable
//! `parking_lot::RwLock<Option<Arc<governor::RateLimiter<..>>>>` construction
//! from `fc-router::pool::ProcessPool`.

mod bucket;

pub use bucket::{BucketConfig, WindowConfig};
use bucket::{Bucket, Decision};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use notify_common::errors::RateLimitKeyType;
use notify_common::{events::EventKind, Channel, EventBus, Priority};
use notify_dedup::KeyGenerator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    key_type: RateLimitKeyType,
    discriminator: String,
}

impl BucketKey {
    fn new(key_type: RateLimitKeyType, discriminator: impl Into<String>) -> Self {
        Self { key_type, discriminator: discriminator.into() }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitContext {
    pub priority: Priority,
    pub user_id: Option<String>,
}

impl Default for RateLimitContext {
    fn default() -> Self {
        Self { priority: Priority::Normal, user_id: None }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub global: Option<BucketConfig>,
    pub per_channel: Option<BucketConfig>,
    pub per_recipient: Option<BucketConfig>,
    pub per_user: Option<BucketConfig>,
    pub per_channel_recipient: Option<BucketConfig>,
    pub override_enabled: bool,
    pub override_threshold: Priority,
    pub bucket_ttl: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            global: None,
            per_channel: None,
            per_recipient: None,
            per_user: None,
            per_channel_recipient: None,
            override_enabled: true,
            override_threshold: Priority::Critical,
            bucket_ttl: Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub admitted: bool,
    pub key_type: Option<RateLimitKeyType>,
    pub retry_after_ms: u64,
    pub priority_override: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimitStats {
    pub bucket_count: u64,
    pub allowed: u64,
    pub denied: u64,
    pub priority_overrides: u64,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(
        &self,
        payload: &notify_common::NotificationPayload,
        ctx: &RateLimitContext,
    ) -> RateLimitDecision;

    async fn is_rate_limited(&self, payload: &notify_common::NotificationPayload, ctx: &RateLimitContext) -> bool {
        !self.check(payload, ctx).await.admitted
    }

    /// Same admission evaluation, used at the queue-input boundary before
    /// an item is even persisted (spec's `checkQueueInput`).
    async fn check_queue_input(
        &self,
        payload: &notify_common::NotificationPayload,
        ctx: &RateLimitContext,
    ) -> RateLimitDecision {
        self.check(payload, ctx).await
    }

    async fn get_remaining(&self, key_type: RateLimitKeyType, discriminator: &str) -> Option<f64>;

    async fn get_reset_time(&self, key_type: RateLimitKeyType, discriminator: &str) -> Option<DateTime<Utc>>;

    async fn get_stats(&self) -> RateLimitStats;

    /// Evict buckets idle longer than `bucket_ttl`. Returns the count
    /// removed.
    async fn cleanup(&self) -> u64;

    fn update_config(&self, config: RateLimiterConfig);
}

pub struct HierarchicalRateLimiter {
    buckets: DashMap<BucketKey, Arc<Bucket>>,
    config: parking_lot::RwLock<RateLimiterConfig>,
    key_gen: Arc<dyn KeyGenerator>,
    clock: Arc<dyn notify_common::Clock>,
    events: Option<Arc<EventBus>>,
    allowed: AtomicU64,
    denied: AtomicU64,
    priority_overrides: AtomicU64,
}

impl HierarchicalRateLimiter {
    pub fn new(clock: Arc<dyn notify_common::Clock>, key_gen: Arc<dyn KeyGenerator>) -> Self {
        Self {
            buckets: DashMap::new(),
            config: parking_lot::RwLock::new(RateLimiterConfig::default()),
            key_gen,
            clock,
            events: None,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            priority_overrides: AtomicU64::new(0),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_config(self, config: RateLimiterConfig) -> Self {
        *self.config.write() = config;
        self
    }

    fn emit(&self, kind: EventKind) {
        if let Some(bus) = &self.events {
            bus.emit(kind);
        }
    }

    fn bucket_for(&self, key: BucketKey, config: &BucketConfig, now: DateTime<Utc>) -> Arc<Bucket> {
        let key_type = key.key_type;
        let discriminator = key.discriminator.clone();
        let mut created = false;
        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| {
                created = true;
                Arc::new(Bucket::new(config.clone(), now))
            })
            .value()
            .clone();
        if created {
            self.emit(EventKind::RateLimitBucketCreated { key: discriminator, key_type });
        }
        bucket
    }

    fn evaluate_scope(
        &self,
        key_type: RateLimitKeyType,
        discriminator: String,
        config: &Option<BucketConfig>,
        now: DateTime<Utc>,
    ) -> Option<(RateLimitKeyType, Decision)> {
        let config = config.as_ref()?;
        let key = BucketKey::new(key_type, discriminator);
        let bucket = self.bucket_for(key, config, now);
        Some((key_type, bucket.try_admit(now)))
    }
}

#[async_trait]
impl RateLimiter for HierarchicalRateLimiter {
    async fn check(
        &self,
        payload: &notify_common::NotificationPayload,
        ctx: &RateLimitContext,
    ) -> RateLimitDecision {
        let now = self.clock.now();
        let config = self.config.read().clone();

        if config.override_enabled && ctx.priority >= config.override_threshold {
            self.priority_overrides.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("notify_ratelimit.priority_overrides_total").increment(1);
            self.emit(EventKind::RateLimitOverride { key: "*".to_string(), priority: ctx.priority });
            return RateLimitDecision { admitted: true, key_type: None, retry_after_ms: 0, priority_override: true };
        }

        let channel = payload.channel();
        let recipient_key = self.key_gen.generate_key(payload, None);

        let scopes: Vec<(RateLimitKeyType, String, &Option<BucketConfig>)> = vec![
            (RateLimitKeyType::Global, "global".to_string(), &config.global),
            (RateLimitKeyType::Channel, channel.as_str().to_string(), &config.per_channel),
            (RateLimitKeyType::Recipient, recipient_key.clone(), &config.per_recipient),
            (
                RateLimitKeyType::User,
                ctx.user_id.clone().unwrap_or_default(),
                if ctx.user_id.is_some() { &config.per_user } else { &NONE_BUCKET_CONFIG },
            ),
            (
                RateLimitKeyType::ChannelRecipient,
                format!("{}:{}", channel.as_str(), recipient_key),
                &config.per_channel_recipient,
            ),
        ];

        for (key_type, discriminator, bucket_config) in scopes {
            if let Some((key_type, decision)) = self.evaluate_scope(key_type, discriminator.clone(), bucket_config, now) {
                if let Decision::Deny { retry_after_ms } = decision {
                    self.denied.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("notify_ratelimit.denied_total", "scope" => key_type.to_string()).increment(1);
                    self.emit(EventKind::RateLimitDenied { key: discriminator, key_type, retry_after_ms });
                    return RateLimitDecision {
                        admitted: false,
                        key_type: Some(key_type),
                        retry_after_ms,
                        priority_override: false,
                    };
                }
            }
        }

        self.allowed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("notify_ratelimit.allowed_total").increment(1);
        self.emit(EventKind::RateLimitAllowed {
            key: format!("{}:{}", channel.as_str(), recipient_key),
            key_type: RateLimitKeyType::ChannelRecipient,
        });
        RateLimitDecision { admitted: true, key_type: None, retry_after_ms: 0, priority_override: false }
    }

    async fn get_remaining(&self, key_type: RateLimitKeyType, discriminator: &str) -> Option<f64> {
        let now = self.clock.now();
        self.buckets
            .get(&BucketKey::new(key_type, discriminator.to_string()))
            .map(|bucket| bucket.value().remaining(now))
    }

    async fn get_reset_time(&self, key_type: RateLimitKeyType, discriminator: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.buckets
            .get(&BucketKey::new(key_type, discriminator.to_string()))
            .map(|bucket| bucket.value().reset_time(now))
    }

    async fn get_stats(&self) -> RateLimitStats {
        RateLimitStats {
            bucket_count: self.buckets.len() as u64,
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            priority_overrides: self.priority_overrides.load(Ordering::Relaxed),
        }
    }

    async fn cleanup(&self) -> u64 {
        let now = self.clock.now();
        let ttl = self.config.read().bucket_ttl;
        let stale: Vec<BucketKey> = self
            .buckets
            .iter()
            .filter(|entry| entry.value().idle_since(now) > ttl)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &stale {
            self.buckets.remove(key);
        }
        stale.len() as u64
    }

    fn update_config(&self, config: RateLimiterConfig) {
        *self.config.write() = config;
    }
}

// A `None` bucket config used when a scope's context key (e.g. `userId`) is
// absent for this candidate, so the scope is simply skipped.
const NONE_BUCKET_CONFIG: Option<BucketConfig> = None;

#[cfg(test)]
mod tests {
    use super::*;
    use notify_common::{NotificationPayload, PayloadHeader, TestClock};
    use notify_dedup::DefaultKeyGenerator;

    fn limiter() -> (HierarchicalRateLimiter, TestClock) {
        let clock = TestClock::at_epoch();
        let limiter = HierarchicalRateLimiter::new(Arc::new(clock.clone()), Arc::new(DefaultKeyGenerator::default()));
        (limiter, clock)
    }

    fn sms_payload() -> NotificationPayload {
        NotificationPayload::Sms {
            header: PayloadHeader::new("t", "b"),
            phone_numbers: vec!["+15551234567".to_string()],
        }
    }

    #[tokio::test]
    async fn global_bucket_denies_after_exhaustion_with_retry_after() {
        let (limiter, _clock) = limiter();
        let config = RateLimiterConfig {
            global: Some(BucketConfig { max_tokens: 1.0, refill_rate_per_second: 0.5, window: None, use_governor: false }),
            ..RateLimiterConfig::default()
        };
        limiter.update_config(config);
        let ctx = RateLimitContext::default();

        let first = limiter.check(&sms_payload(), &ctx).await;
        assert!(first.admitted);

        let second = limiter.check(&sms_payload(), &ctx).await;
        assert!(!second.admitted);
        assert_eq!(second.key_type, Some(RateLimitKeyType::Global));
        assert!(second.retry_after_ms >= 1900 && second.retry_after_ms <= 2100);
    }

    #[tokio::test]
    async fn priority_override_bypasses_without_decrementing() {
        let (limiter, _clock) = limiter();
        let config = RateLimiterConfig {
            global: Some(BucketConfig { max_tokens: 1.0, refill_rate_per_second: 0.5, window: None, use_governor: false }),
            ..RateLimiterConfig::default()
        };
        limiter.update_config(config);

        let normal_ctx = RateLimitContext { priority: Priority::Normal, user_id: None };
        let critical_ctx = RateLimitContext { priority: Priority::Critical, user_id: None };

        assert!(limiter.check(&sms_payload(), &normal_ctx).await.admitted);
        let overridden = limiter.check(&sms_payload(), &critical_ctx).await;
        assert!(overridden.admitted);
        assert!(overridden.priority_override);

        // Token was already exhausted by the first NORMAL call; override must
        // not have touched it, so a second NORMAL call still gets denied.
        let second_normal = limiter.check(&sms_payload(), &normal_ctx).await;
        assert!(!second_normal.admitted);
    }

    #[tokio::test]
    async fn admitted_check_emits_rate_limit_allowed() {
        let (limiter, _clock) = limiter();
        let events = Arc::new(EventBus::new());
        let limiter = limiter.with_events(events.clone());

        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen_flag = seen.clone();
        events.on(move |event| {
            if matches!(event.kind, EventKind::RateLimitAllowed { .. }) {
                seen_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        });

        assert!(limiter.check(&sms_payload(), &RateLimitContext::default()).await.admitted);
        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cleanup_evicts_idle_buckets() {
        let (limiter, clock) = limiter();
        let config = RateLimiterConfig {
            per_channel: Some(BucketConfig { max_tokens: 5.0, refill_rate_per_second: 1.0, window: None, use_governor: false }),
            bucket_ttl: Duration::seconds(30),
            ..RateLimiterConfig::default()
        };
        limiter.update_config(config);
        limiter.check(&sms_payload(), &RateLimitContext::default()).await;
        clock.advance(Duration::seconds(60));
        let removed = limiter.cleanup().await;
        assert_eq!(removed, 1);
    }
}
