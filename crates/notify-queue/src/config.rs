//! Aggregate configuration, composing each component's closed config record
//! the way the teacher's `RouterConfig` composes `PoolConfig` /
//! `QueueConfig` / `StandbyConfig`.

use notify_dedup::DedupConfig;
use notify_processor::ProcessorConfig;
use notify_ratelimit::RateLimiterConfig;

#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub processor: ProcessorConfig,
    pub dedup: DedupConfig,
    pub rate_limiter: RateLimiterConfig,
}
