//! Storage trait and backends for queue items.
//!
//! The trait shape follows the outbox repository pattern: type-aware
//! fetch/claim operations plus granular status transitions, with an
//! in-memory implementation as the default backend.

mod in_memory;

pub use in_memory::InMemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_common::{Channel, NotificationStatus, QueueItem, QueueStats};
use uuid::Uuid;

pub use notify_common::errors::StorageError;

pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence interface for queue items. Implementations must make
/// `claim_pending` atomic per item: two concurrent callers must never both
/// claim the same id.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new item. The item's `status` must already be `Pending`.
    async fn insert(&self, item: QueueItem) -> StorageResult<()>;

    async fn get(&self, id: Uuid) -> StorageResult<Option<QueueItem>>;

    /// Select up to `limit` ready items (see `QueueItem::is_ready`) ordered
    /// by priority descending then `created_at` ascending, and atomically
    /// transition them to `Processing`. Only items actually claimed are
    /// returned.
    async fn claim_pending(&self, limit: u32, now: DateTime<Utc>) -> StorageResult<Vec<QueueItem>>;

    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<()>;

    /// Record a failed attempt. `retry` decides whether the item goes back
    /// to `Pending` (with `scheduled_at` set to `next_attempt_at`) or is
    /// dead-lettered.
    async fn mark_failed(
        &self,
        id: Uuid,
        error: String,
        retry: bool,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn mark_dead_letter(&self, id: Uuid, error: String, now: DateTime<Utc>) -> StorageResult<()>;

    /// Items stuck in `Processing` for longer than `timeout`, to be
    /// returned to `Pending` by the processor's sweep pass.
    async fn fetch_stuck(&self, timeout: chrono::Duration, now: DateTime<Utc>, limit: u32) -> StorageResult<Vec<QueueItem>>;

    async fn reset_stuck(&self, ids: Vec<Uuid>) -> StorageResult<()>;

    /// Requeue up to `limit` `Failed` items that still have retry budget
    /// (`attempts < max_attempts`) back to `Pending`. Returns the count
    /// requeued.
    async fn requeue_failed(&self, limit: u32, now: DateTime<Utc>) -> StorageResult<u64>;

    /// Remove (or mark expired) items whose `expires_at` has passed while
    /// still `Pending`. Returns the number affected.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> StorageResult<u64>;

    async fn get_stats(&self) -> StorageResult<QueueStats>;

    async fn count_by_status(&self, status: NotificationStatus) -> StorageResult<u64>;

    async fn list_by_channel(&self, channel: Channel, limit: u32) -> StorageResult<Vec<QueueItem>>;

    /// Delete a single item outright. Returns `false` if no item had `id`.
    async fn remove(&self, id: Uuid) -> StorageResult<bool>;

    /// Apply an arbitrary in-place patch to one item. Returns the patched
    /// item, or `None` if no item had `id`.
    async fn update(&self, id: Uuid, patch: Box<dyn FnOnce(&mut QueueItem) + Send>) -> StorageResult<Option<QueueItem>>;

    /// Remove everything. Intended for tests and the default-instance reset.
    async fn clear(&self) -> StorageResult<()>;
}
