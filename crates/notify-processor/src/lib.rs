//! Cooperative scheduler: polls storage for ready items, gates them through
//! the rate limiter, dispatches to the handler registry, and retries or
//! dead-letters on failure.
//!
//! Grounded on a synthesis of two teacher patterns: the poll/claim/dispatch
//! loop shape of `fc-outbox::enhanced_processor`'s buffering distributor, and
//! the `AtomicBool` running flag + `tokio::sync::broadcast` shutdown idiom of
//! `fc-router::lifecycle::LifecycleManager`. Concurrency is gated by a plain
//! `AtomicU32 in_flight` counter compared against `concurrency`, a more
//! literal reading of "concurrency minus in-flight" than a `Semaphore` would
//! give (see DESIGN.md).

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use notify_common::events::EventKind;
use notify_common::{Clock, EventBus, QueueItem};
use notify_handlers::HandlerRegistry;
use notify_ratelimit::{RateLimitContext, RateLimiter};
use notify_storage::Storage;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub concurrency: u32,
    pub poll_interval: StdDuration,
    pub batch_size: u32,
    pub retry_delay: StdDuration,
    pub max_retries: u32,
    pub dead_letter_enabled: bool,
    pub enable_events: bool,
    pub handler_timeout: StdDuration,
    pub shutdown_deadline: StdDuration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: StdDuration::from_millis(500),
            batch_size: 20,
            retry_delay: StdDuration::from_secs(1),
            max_retries: 3,
            dead_letter_enabled: true,
            enable_events: true,
            handler_timeout: StdDuration::from_secs(30),
            shutdown_deadline: StdDuration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Idle = 0,
    Running = 1,
    Paused = 2,
    Stopped = 3,
}

impl From<u8> for ProcessorState {
    fn from(value: u8) -> Self {
        match value {
            1 => ProcessorState::Running,
            2 => ProcessorState::Paused,
            3 => ProcessorState::Stopped,
            _ => ProcessorState::Idle,
        }
    }
}

/// The maximum backoff multiplier applied to `retry_delay`, i.e. the
/// absolute ceiling `spec.md` leaves implementation-defined.
const BACKOFF_CEILING_MULTIPLIER: u32 = 32;

fn backoff_delay(retry_delay: StdDuration, attempts: u32) -> StdDuration {
    let exponent = attempts.saturating_sub(1).min(10);
    let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let capped_multiplier = multiplier.min(BACKOFF_CEILING_MULTIPLIER as u64);
    let base_ms = retry_delay.as_millis() as u64 * capped_multiplier;

    let jitter_fraction = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered_ms = (base_ms as f64 * (1.0 + jitter_fraction)).max(0.0) as u64;

    let ceiling_ms = retry_delay.as_millis() as u64 * BACKOFF_CEILING_MULTIPLIER as u64;
    StdDuration::from_millis(jittered_ms.min(ceiling_ms))
}

pub struct Processor {
    config: RwLock<ProcessorConfig>,
    storage: Arc<dyn Storage>,
    handlers: Arc<HandlerRegistry>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    events: Option<Arc<EventBus>>,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    in_flight: Arc<AtomicU32>,
    shutdown_tx: broadcast::Sender<()>,
    loop_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        storage: Arc<dyn Storage>,
        handlers: Arc<HandlerRegistry>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        events: Option<Arc<EventBus>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            config: RwLock::new(config),
            storage,
            handlers,
            rate_limiter,
            events,
            clock,
            state: AtomicU8::new(ProcessorState::Idle as u8),
            in_flight: Arc::new(AtomicU32::new(0)),
            shutdown_tx,
            loop_handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn status(&self) -> ProcessorState {
        ProcessorState::from(self.state.load(Ordering::SeqCst))
    }

    fn emit(&self, kind: EventKind) {
        if self.config.read().enable_events {
            if let Some(bus) = &self.events {
                bus.emit(kind);
            }
        }
    }

    pub fn update_config(&self, config: ProcessorConfig) {
        *self.config.write() = config;
    }

    /// Start the polling loop. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        if self.status() == ProcessorState::Running {
            return;
        }
        self.state.store(ProcessorState::Running as u8, Ordering::SeqCst);
        self.emit(EventKind::ProcessorStarted);

        let this = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.read().poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if this.status() == ProcessorState::Running {
                            this.poll_once().await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
                if this.status() == ProcessorState::Stopped {
                    break;
                }
            }
        });
        *self.loop_handle.lock() = Some(handle);
    }

    /// Drain in-flight work, then transition to STOPPED.
    pub async fn stop(self: &Arc<Self>) {
        if self.status() == ProcessorState::Idle {
            self.state.store(ProcessorState::Stopped as u8, Ordering::SeqCst);
            return;
        }
        self.state.store(ProcessorState::Stopped as u8, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.loop_handle.lock().take() {
            let _ = tokio::time::timeout(self.config.read().shutdown_deadline, handle).await;
        }

        let deadline = self.clock.now() + chrono::Duration::from_std(self.config.read().shutdown_deadline).unwrap_or(chrono::Duration::seconds(30));
        while self.in_flight.load(Ordering::SeqCst) > 0 && self.clock.now() < deadline {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }

        self.emit(EventKind::ProcessorStopped);
    }

    pub fn pause(&self) {
        if self.status() == ProcessorState::Running {
            self.state.store(ProcessorState::Paused as u8, Ordering::SeqCst);
            self.emit(EventKind::ProcessorPaused);
        }
    }

    pub fn resume(&self) {
        if self.status() == ProcessorState::Paused {
            self.state.store(ProcessorState::Running as u8, Ordering::SeqCst);
            self.emit(EventKind::ProcessorResumed);
        }
    }

    async fn poll_once(self: &Arc<Self>) {
        let config = self.config.read().clone();
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        if in_flight >= config.concurrency {
            return;
        }
        let available = config.concurrency - in_flight;
        let limit = config.batch_size.min(available);
        if limit == 0 {
            return;
        }

        let now = self.clock.now();
        let claimed = match self.storage.claim_pending(limit, now).await {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(error = %err, "failed to claim pending items");
                return;
            }
        };

        for item in claimed {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            metrics::gauge!("notify_processor.in_flight").increment(1.0);
            let this = self.clone();
            tokio::spawn(async move {
                this.dispatch(item).await;
                this.in_flight.fetch_sub(1, Ordering::SeqCst);
                metrics::gauge!("notify_processor.in_flight").decrement(1.0);
            });
        }
    }

    async fn dispatch(self: &Arc<Self>, item: QueueItem) {
        let config = self.config.read().clone();
        let now = self.clock.now();

        if let Some(limiter) = &self.rate_limiter {
            let ctx = RateLimitContext { priority: item.priority, user_id: None };
            let decision = limiter.check(&item.payload, &ctx).await;
            if !decision.admitted {
                let next_attempt_at = now + chrono::Duration::milliseconds(decision.retry_after_ms as i64);
                let _ = self
                    .storage
                    .mark_failed(item.id, "rate limited".to_string(), true, Some(next_attempt_at), now)
                    .await;
                self.emit(EventKind::ItemRetrying {
                    item_id: item.id,
                    channel: item.channel(),
                    attempts: item.attempts,
                    next_attempt_at,
                });
                return;
            }
        }

        self.emit(EventKind::ItemProcessing { item_id: item.id, channel: item.channel(), attempt: item.attempts + 1 });

        let handler = self.handlers.get(item.channel());
        let outcome = match &handler {
            None => DispatchOutcome::Permanent("no handler registered for channel".to_string()),
            Some(handler) => {
                if !handler.is_available().await {
                    DispatchOutcome::Retryable("handler unavailable".to_string())
                } else {
                    match tokio::time::timeout(config.handler_timeout, handler.send(&item)).await {
                        Ok(Ok(())) => DispatchOutcome::Success,
                        Ok(Err(err)) if err.should_retry => DispatchOutcome::Retryable(err.message),
                        Ok(Err(err)) => DispatchOutcome::Permanent(err.message),
                        Err(_) => DispatchOutcome::Retryable("handler call timed out".to_string()),
                    }
                }
            }
        };

        self.finish(item, outcome, config).await;
    }

    async fn finish(&self, item: QueueItem, outcome: DispatchOutcome, config: ProcessorConfig) {
        let now = self.clock.now();
        match outcome {
            DispatchOutcome::Success => {
                let _ = self.storage.mark_sent(item.id, now).await;
                metrics::counter!("notify_processor.items_sent_total", "channel" => item.channel().as_str()).increment(1);
                self.emit(EventKind::ItemSent { item_id: item.id, channel: item.channel(), attempts: item.attempts + 1 });
            }
            DispatchOutcome::Retryable(error) => {
                let attempts = item.attempts + 1;
                if attempts < item.max_attempts {
                    let delay = backoff_delay(config.retry_delay, attempts);
                    let next_attempt_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    let _ = self
                        .storage
                        .mark_failed(item.id, error, true, Some(next_attempt_at), now)
                        .await;
                    metrics::counter!("notify_processor.items_retried_total", "channel" => item.channel().as_str()).increment(1);
                    self.emit(EventKind::ItemRetrying {
                        item_id: item.id,
                        channel: item.channel(),
                        attempts,
                        next_attempt_at,
                    });
                } else {
                    self.finalize_exhausted(item, error, config, now).await;
                }
            }
            DispatchOutcome::Permanent(error) => {
                self.finalize_exhausted(item, error, config, now).await;
            }
        }
    }

    async fn finalize_exhausted(&self, item: QueueItem, error: String, config: ProcessorConfig, now: DateTime<Utc>) {
        if config.dead_letter_enabled {
            let _ = self.storage.mark_dead_letter(item.id, error.clone(), now).await;
            metrics::counter!("notify_processor.items_dead_lettered_total", "channel" => item.channel().as_str()).increment(1);
            self.emit(EventKind::ItemDeadLettered {
                item_id: item.id,
                channel: item.channel(),
                attempts: item.attempts + 1,
                error,
            });
        } else {
            let _ = self.storage.mark_failed(item.id, error.clone(), false, None, now).await;
            metrics::counter!("notify_processor.items_failed_total", "channel" => item.channel().as_str()).increment(1);
            self.emit(EventKind::ItemFailed { item_id: item.id, channel: item.channel(), attempts: item.attempts + 1, error });
        }
    }

    /// Process all currently-ready items to completion, bypassing the poll
    /// cadence. Loops until a claim returns nothing.
    pub async fn process_pending(self: &Arc<Self>) -> u64 {
        let mut processed = 0u64;
        loop {
            let now = self.clock.now();
            let batch_size = self.config.read().batch_size;
            let claimed = match self.storage.claim_pending(batch_size, now).await {
                Ok(items) if !items.is_empty() => items,
                _ => break,
            };
            for item in claimed {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                self.dispatch(item).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                processed += 1;
            }
        }
        processed
    }

    /// Requeue FAILED items that still have retry budget. Returns the count
    /// requeued.
    pub async fn retry_failed(&self, limit: Option<u32>) -> u64 {
        let now = self.clock.now();
        let limit = limit.unwrap_or(u32::MAX);
        self.storage.requeue_failed(limit, now).await.unwrap_or(0)
    }

    pub async fn cleanup_expired(&self) -> u64 {
        let now = self.clock.now();
        self.storage.cleanup_expired(now).await.unwrap_or(0)
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

enum DispatchOutcome {
    Success,
    Retryable(String),
    Permanent(String),
}
