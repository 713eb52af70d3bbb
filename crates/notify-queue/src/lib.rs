//! The queue facade: the single root object applications construct. Owns
//! one `Storage`, one `Deduplicator`, one `RateLimiter`, one
//! `HandlerRegistry`, and the `Processor` that ties them together, mirroring
//! the teacher's pattern of one top-level `RouterConfig`-driven object
//! wiring independently-testable subsystems together.

pub mod config;
pub mod default_instance;
pub mod error;

pub use config::NotifyConfig;
pub use default_instance::{default_instance, reset_default_instance_for_test};
pub use error::{ErrorCode, NotifyError};

use std::sync::Arc;

use chrono::Utc;
use notify_common::errors::ValidationError;
use notify_common::{
    Channel, Clock, Event, EventBus, NotificationPayload, NotificationRequest, NotificationStatus, PayloadHeader,
    Priority, QueueItem, QueueStats, SubscriptionId, SystemClock,
};
use notify_dedup::{DefaultKeyGenerator, Deduplicator, SlidingWindowDeduplicator};
use notify_handlers::{ChannelHandler, HandlerRegistry, HandlerStatus};
use notify_processor::{Processor, ProcessorConfig, ProcessorState};
use notify_ratelimit::{HierarchicalRateLimiter, RateLimitContext, RateLimiter};
use notify_storage::{InMemoryStorage, Storage};
use uuid::Uuid;

/// Filter accepted by `find`/`count`. `None` fields match anything.
/// `limit`/`offset` page the matched set; both are applied by `find` after
/// filtering, `offset` first.
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub status: Option<NotificationStatus>,
    pub channel: Option<Channel>,
    pub priority: Option<Priority>,
    pub correlation_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl QueueFilter {
    fn matches(&self, item: &QueueItem) -> bool {
        self.status.map(|s| s == item.status).unwrap_or(true)
            && self.channel.map(|c| c == item.channel()).unwrap_or(true)
            && self.priority.map(|p| p == item.priority).unwrap_or(true)
            && self.correlation_id.as_deref().map(|cid| item.correlation_id.as_deref() == Some(cid)).unwrap_or(true)
    }
}

pub struct NotificationQueue {
    storage: Arc<dyn Storage>,
    dedup: Arc<dyn Deduplicator>,
    rate_limiter: Arc<dyn RateLimiter>,
    handlers: Arc<HandlerRegistry>,
    processor: Arc<Processor>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl NotificationQueue {
    /// Build a queue with the in-memory reference backends, wired per
    /// `config`. Returns `FatalConfigError` if `config.processor.concurrency
    /// == 0`, the one init-time validation spec.md §7 calls for.
    pub fn new(config: NotifyConfig) -> Result<Arc<Self>, NotifyError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: NotifyConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>, NotifyError> {
        if config.processor.concurrency == 0 {
            return Err(NotifyError::fatal_config("processor.concurrency must be at least 1"));
        }

        let events = Arc::new(EventBus::new());
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let key_gen = Arc::new(DefaultKeyGenerator::default());
        let dedup: Arc<dyn Deduplicator> = Arc::new(
            SlidingWindowDeduplicator::new(clock.clone())
                .with_events(events.clone())
                .with_config(config.dedup.clone())
                .with_key_gen(key_gen.clone()),
        );
        let rate_limiter: Arc<dyn RateLimiter> = Arc::new(
            HierarchicalRateLimiter::new(clock.clone(), key_gen)
                .with_events(events.clone())
                .with_config(config.rate_limiter.clone()),
        );
        let handlers = Arc::new(HandlerRegistry::new());
        let processor = Arc::new(Processor::new(
            config.processor.clone(),
            storage.clone(),
            handlers.clone(),
            Some(rate_limiter.clone()),
            Some(events.clone()),
            clock.clone(),
        ));

        Ok(Arc::new(Self { storage, dedup, rate_limiter, handlers, processor, events, clock }))
    }

    fn build_item(&self, request: NotificationRequest) -> Result<QueueItem, ValidationError> {
        request.payload.validate()?;
        let now = self.clock.now();
        Ok(QueueItem {
            id: Uuid::new_v4(),
            payload: request.payload,
            priority: request.priority,
            status: NotificationStatus::Pending,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(notify_common::DEFAULT_MAX_ATTEMPTS),
            created_at: now,
            scheduled_at: request.scheduled_at,
            processing_started_at: None,
            completed_at: None,
            expires_at: request.expires_at,
            error: None,
            correlation_id: request.correlation_id,
        })
    }

    /// Enqueue a single notification. Rejects malformed payloads
    /// synchronously (`ValidationError`); never rejects for rate-limit
    /// reasons (spec.md §7 "enqueue never rejects for rate reasons").
    pub async fn add(&self, request: NotificationRequest) -> Result<QueueItem, NotifyError> {
        let item = self.build_item(request)?;
        self.storage.insert(item.clone()).await?;
        metrics::counter!("notify_queue.items_enqueued", "channel" => item.channel().as_str()).increment(1);
        self.events.emit(notify_common::events::EventKind::ItemEnqueued { item_id: item.id, channel: item.channel() });
        Ok(item)
    }

    pub async fn add_email(
        &self,
        to: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<QueueItem, NotifyError> {
        let payload = NotificationPayload::Email { header: PayloadHeader::new(title, body), to: vec![to.into()], cc: vec![] };
        self.add(NotificationRequest::new(payload)).await
    }

    pub async fn add_chat(
        &self,
        chat_id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<QueueItem, NotifyError> {
        let payload = NotificationPayload::Telegram { header: PayloadHeader::new(title, body), chat_id: chat_id.into(), parse_mode: None };
        self.add(NotificationRequest::new(payload)).await
    }

    pub async fn add_webhook(
        &self,
        webhook_url: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<QueueItem, NotifyError> {
        let payload =
            NotificationPayload::Discord { header: PayloadHeader::new(title, body), webhook_url: webhook_url.into(), mentions: vec![] };
        self.add(NotificationRequest::new(payload)).await
    }

    pub async fn add_push(
        &self,
        device_token: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<QueueItem, NotifyError> {
        let payload = NotificationPayload::Push { header: PayloadHeader::new(title, body), device_tokens: vec![device_token.into()] };
        self.add(NotificationRequest::new(payload)).await
    }

    pub async fn add_sms(
        &self,
        phone_number: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<QueueItem, NotifyError> {
        let payload = NotificationPayload::Sms { header: PayloadHeader::new(title, body), phone_numbers: vec![phone_number.into()] };
        self.add(NotificationRequest::new(payload)).await
    }

    /// Insert each request independently, sequential not atomic: a failure
    /// partway through returns the prefix that succeeded plus the first
    /// error, mirroring the teacher's `process_batch` (not a transaction).
    pub async fn add_batch(&self, requests: Vec<NotificationRequest>) -> (Vec<QueueItem>, Option<NotifyError>) {
        let mut inserted = Vec::with_capacity(requests.len());
        for request in requests {
            match self.add(request).await {
                Ok(item) => inserted.push(item),
                Err(err) => return (inserted, Some(err)),
            }
        }
        (inserted, None)
    }

    /// Pre-enqueue dedup check/record against `request`'s channel-aware
    /// fingerprint. Paths that opt into this reject with `DuplicateBlocked`
    /// rather than enqueueing.
    pub async fn add_deduplicated(&self, request: NotificationRequest) -> Result<QueueItem, NotifyError> {
        let correlation_id = request.correlation_id.clone();
        if !self.dedup.check_and_record(&request.payload, correlation_id.as_deref()).await {
            return Err(NotifyError::duplicate_blocked("duplicate payload"));
        }
        self.add(request).await
    }

    /// Rate-limit admission check at the queue-input boundary, ahead of
    /// persistence (spec's `checkQueueInput`). Does not consume storage.
    pub async fn check_rate_limit(&self, payload: &NotificationPayload, priority: Priority) -> bool {
        let ctx = RateLimitContext { priority, user_id: None };
        self.rate_limiter.check_queue_input(payload, &ctx).await.admitted
    }

    // -- Control -----------------------------------------------------------

    pub fn start(self: &Arc<Self>) {
        self.processor.start();
    }

    pub async fn stop(self: &Arc<Self>) {
        self.processor.stop().await;
    }

    pub fn pause(&self) {
        self.processor.pause();
    }

    pub fn resume(&self) {
        self.processor.resume();
    }

    pub async fn process_pending(self: &Arc<Self>) -> u64 {
        self.processor.process_pending().await
    }

    pub async fn retry_failed(&self, limit: Option<u32>) -> u64 {
        self.processor.retry_failed(limit).await
    }

    pub async fn cleanup_expired(&self) -> u64 {
        self.processor.cleanup_expired().await
    }

    pub fn is_running(&self) -> bool {
        self.processor.status() == ProcessorState::Running
    }

    pub fn get_processor_status(&self) -> ProcessorState {
        self.processor.status()
    }

    // -- Introspection -------------------------------------------------------

    pub async fn get(&self, id: Uuid) -> Result<Option<QueueItem>, NotifyError> {
        Ok(self.storage.get(id).await?)
    }

    /// Delete a single item outright. Returns `false` if no item had `id`.
    pub async fn remove(&self, id: Uuid) -> Result<bool, NotifyError> {
        Ok(self.storage.remove(id).await?)
    }

    /// Apply an arbitrary in-place patch to one item.
    pub async fn update(&self, id: Uuid, patch: impl FnOnce(&mut QueueItem) + Send + 'static) -> Result<Option<QueueItem>, NotifyError> {
        Ok(self.storage.update(id, Box::new(patch)).await?)
    }

    /// Client-side filter over every channel's items, sorted priority
    /// descending then `created_at` ascending (matching `claim_pending`'s
    /// order), then paged by `offset`/`limit`. `notify-storage` exposes
    /// per-channel listing, not an unconstrained table scan, so this fans
    /// out across `Channel::ALL` and filters in memory.
    pub async fn find(&self, filter: QueueFilter) -> Result<Vec<QueueItem>, NotifyError> {
        const SCAN_LIMIT: u32 = 1_000_000;
        let mut matched = Vec::new();
        for channel in Channel::ALL {
            if let Some(wanted) = filter.channel {
                if wanted != channel {
                    continue;
                }
            }
            let items = self.storage.list_by_channel(channel, SCAN_LIMIT).await?;
            matched.extend(items.into_iter().filter(|item| filter.matches(item)));
        }
        matched.sort_by(|a, b| std::cmp::Reverse(a.priority).cmp(&std::cmp::Reverse(b.priority)).then(a.created_at.cmp(&b.created_at)));

        if let Some(offset) = filter.offset {
            matched = matched.into_iter().skip(offset).collect();
        }
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    /// Count of items matching `filter`, ignoring `limit`/`offset`.
    pub async fn count(&self, filter: QueueFilter) -> Result<u64, NotifyError> {
        let unpaged = QueueFilter { limit: None, offset: None, ..filter };
        Ok(self.find(unpaged).await?.len() as u64)
    }

    pub async fn get_stats(&self) -> Result<QueueStats, NotifyError> {
        Ok(self.storage.get_stats().await?)
    }

    pub async fn get_dead_letter(&self, limit: Option<u32>) -> Result<Vec<QueueItem>, NotifyError> {
        let filter = QueueFilter { status: Some(NotificationStatus::DeadLetter), ..Default::default() };
        let mut items = self.find(filter).await?;
        if let Some(limit) = limit {
            items.truncate(limit as usize);
        }
        Ok(items)
    }

    pub async fn get_queue_depth(&self) -> Result<u64, NotifyError> {
        Ok(self.get_stats().await?.queue_depth)
    }

    pub async fn get_pending_count(&self) -> Result<u64, NotifyError> {
        Ok(self.storage.count_by_status(NotificationStatus::Pending).await?)
    }

    pub async fn get_processing_count(&self) -> Result<u64, NotifyError> {
        Ok(self.storage.count_by_status(NotificationStatus::Processing).await?)
    }

    // -- Handler management --------------------------------------------------

    pub fn register_handler(&self, channel: Channel, handler: Arc<dyn ChannelHandler>) {
        self.handlers.register(channel, handler);
    }

    pub fn unregister_handler(&self, channel: Channel) {
        self.handlers.unregister(channel);
    }

    pub fn get_handlers(&self) -> Vec<HandlerStatus> {
        self.handlers.channels().into_iter().filter_map(|channel| self.handlers.get(channel)).map(|h| h.get_status()).collect()
    }

    // -- Events ----------------------------------------------------------------

    pub fn on<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    pub fn off(&self, id: SubscriptionId) {
        self.events.off(id);
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn dedup(&self) -> &Arc<dyn Deduplicator> {
        &self.dedup
    }

    pub fn rate_limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.rate_limiter
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Wipe all persisted items and counters. For tests and the default
    /// instance's `reset` affordance.
    pub async fn clear(&self) -> Result<(), NotifyError> {
        self.storage.clear().await?;
        self.dedup.clear().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_common::TestClock;
    use notify_handlers::mock::{MockHandler, SendOutcome};

    fn test_queue() -> (Arc<NotificationQueue>, TestClock) {
        let clock = TestClock::at_epoch();
        let queue = NotificationQueue::with_clock(NotifyConfig::default(), Arc::new(clock.clone())).unwrap();
        (queue, clock)
    }

    #[tokio::test]
    async fn add_rejects_invalid_payload_before_touching_storage() {
        let (queue, _clock) = test_queue();
        let payload = NotificationPayload::Email { header: PayloadHeader::new("t", "b"), to: vec![], cc: vec![] };
        let err = queue.add(NotificationRequest::new(payload)).await.unwrap_err();
        assert!(matches!(err.code, ErrorCode::Validation));
        assert_eq!(queue.get_pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn add_then_get_round_trips_with_pending_status() {
        let (queue, _clock) = test_queue();
        let item = queue.add_email("a@x.com", "S", "B").await.unwrap();
        let fetched = queue.get(item.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, NotificationStatus::Pending);
        assert_eq!(fetched.id, item.id);
    }

    #[tokio::test]
    async fn find_filters_by_correlation_id_and_pages_with_limit_and_offset() {
        let (queue, _clock) = test_queue();
        queue
            .add(NotificationRequest::new(email_payload_for_test("a")).with_correlation_id("corr-x"))
            .await
            .unwrap();
        queue
            .add(NotificationRequest::new(email_payload_for_test("b")).with_correlation_id("corr-x"))
            .await
            .unwrap();
        queue.add(NotificationRequest::new(email_payload_for_test("c")).with_correlation_id("corr-y")).await.unwrap();

        let matched = queue.find(QueueFilter { correlation_id: Some("corr-x".to_string()), ..Default::default() }).await.unwrap();
        assert_eq!(matched.len(), 2);

        let count = queue.count(QueueFilter { correlation_id: Some("corr-x".to_string()), ..Default::default() }).await.unwrap();
        assert_eq!(count, 2);

        let paged = queue.find(QueueFilter { limit: Some(1), offset: Some(1), ..Default::default() }).await.unwrap();
        assert_eq!(paged.len(), 1);
    }

    fn email_payload_for_test(body: &str) -> NotificationPayload {
        NotificationPayload::Email { header: PayloadHeader::new("t", body), to: vec!["a@x.com".to_string()], cc: vec![] }
    }

    #[tokio::test]
    async fn remove_deletes_the_item() {
        let (queue, _clock) = test_queue();
        let item = queue.add_email("a@x.com", "S", "B").await.unwrap();
        assert!(queue.remove(item.id).await.unwrap());
        assert!(queue.get(item.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_applies_a_patch_in_place() {
        let (queue, _clock) = test_queue();
        let item = queue.add_email("a@x.com", "S", "B").await.unwrap();
        let patched = queue.update(item.id, |item| item.correlation_id = Some("corr-1".to_string())).await.unwrap().unwrap();
        assert_eq!(patched.correlation_id, Some("corr-1".to_string()));
    }

    #[tokio::test]
    async fn process_pending_delivers_through_registered_handler() {
        let (queue, _clock) = test_queue();
        queue.register_handler(Channel::Email, Arc::new(MockHandler::new(vec![SendOutcome::Success]).with_channel(Channel::Email)));
        let item = queue.add_email("a@x.com", "S", "B").await.unwrap();
        let processed = queue.process_pending().await;
        assert_eq!(processed, 1);
        let fetched = queue.get(item.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn zero_concurrency_is_a_fatal_config_error() {
        let mut config = NotifyConfig::default();
        config.processor.concurrency = 0;
        assert!(NotificationQueue::new(config).is_err());
    }

    #[tokio::test]
    async fn add_deduplicated_blocks_second_independently_constructed_equal_payload() {
        let (queue, _clock) = test_queue();
        let first_payload = NotificationPayload::Email {
            header: PayloadHeader::new("S", "B"),
            to: vec!["  User@Example.com ".to_string()],
            cc: vec![],
        };
        let second_payload =
            NotificationPayload::Email { header: PayloadHeader::new("S", "B"), to: vec!["user@example.com".to_string()], cc: vec![] };
        let first = queue.add_deduplicated(NotificationRequest::new(first_payload)).await;
        assert!(first.is_ok());
        let second = queue.add_deduplicated(NotificationRequest::new(second_payload)).await;
        assert!(matches!(second.unwrap_err().code, ErrorCode::DuplicateBlocked));
    }
}
