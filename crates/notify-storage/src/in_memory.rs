use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use notify_common::{Channel, NotificationStatus, QueueItem, QueueStats};
use uuid::Uuid;

use crate::{Storage, StorageError, StorageResult};

/// A sharded, in-process `Storage` backend. Each item lives behind its own
/// `DashMap` entry lock, so `claim_pending` never holds a whole-map lock
/// while deciding which items to take.
#[derive(Default)]
pub struct InMemoryStorage {
    items: DashMap<Uuid, QueueItem>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self { items: DashMap::new() }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert(&self, item: QueueItem) -> StorageResult<()> {
        self.items.insert(item.id, item);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<QueueItem>> {
        Ok(self.items.get(&id).map(|entry| entry.value().clone()))
    }

    async fn claim_pending(&self, limit: u32, now: DateTime<Utc>) -> StorageResult<Vec<QueueItem>> {
        let mut candidates: Vec<(Uuid, std::cmp::Reverse<notify_common::Priority>, DateTime<Utc>)> = self
            .items
            .iter()
            .filter(|entry| entry.value().is_ready(now))
            .map(|entry| (entry.key().clone(), std::cmp::Reverse(entry.value().priority), entry.value().created_at))
            .collect();

        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
        candidates.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (id, _, _) in candidates {
            if let Some(mut entry) = self.items.get_mut(&id) {
                if entry.is_ready(now) {
                    entry.status = NotificationStatus::Processing;
                    entry.processing_started_at = Some(now);
                    claimed.push(entry.value().clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<()> {
        let mut entry = self.items.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        entry.status = NotificationStatus::Sent;
        entry.completed_at = Some(now);
        entry.error = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: String,
        retry: bool,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut entry = self.items.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        entry.attempts += 1;
        entry.error = Some(error);
        if retry {
            entry.status = NotificationStatus::Pending;
            entry.scheduled_at = next_attempt_at.or(Some(now));
            entry.processing_started_at = None;
        } else {
            entry.status = NotificationStatus::Failed;
        }
        Ok(())
    }

    async fn mark_dead_letter(&self, id: Uuid, error: String, now: DateTime<Utc>) -> StorageResult<()> {
        let mut entry = self.items.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        entry.status = NotificationStatus::DeadLetter;
        entry.error = Some(error);
        entry.completed_at = Some(now);
        Ok(())
    }

    async fn fetch_stuck(&self, timeout: Duration, now: DateTime<Utc>, limit: u32) -> StorageResult<Vec<QueueItem>> {
        let stuck: Vec<QueueItem> = self
            .items
            .iter()
            .filter(|entry| {
                entry.value().status == NotificationStatus::Processing
                    && entry
                        .value()
                        .processing_started_at
                        .map(|started| now - started > timeout)
                        .unwrap_or(false)
            })
            .take(limit as usize)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(stuck)
    }

    async fn reset_stuck(&self, ids: Vec<Uuid>) -> StorageResult<()> {
        for id in ids {
            if let Some(mut entry) = self.items.get_mut(&id) {
                if entry.status == NotificationStatus::Processing {
                    entry.status = NotificationStatus::Pending;
                    entry.processing_started_at = None;
                }
            }
        }
        Ok(())
    }

    async fn requeue_failed(&self, limit: u32, now: DateTime<Utc>) -> StorageResult<u64> {
        let candidates: Vec<Uuid> = self
            .items
            .iter()
            .filter(|entry| entry.value().status == NotificationStatus::Failed && entry.value().attempts < entry.value().max_attempts)
            .take(limit as usize)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &candidates {
            if let Some(mut entry) = self.items.get_mut(id) {
                entry.status = NotificationStatus::Pending;
                entry.scheduled_at = Some(now);
            }
        }
        Ok(candidates.len() as u64)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let expired_ids: Vec<Uuid> = self
            .items
            .iter()
            .filter(|entry| {
                entry.value().status == NotificationStatus::Pending && entry.value().is_expired(now)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired_ids {
            if let Some(mut entry) = self.items.get_mut(id) {
                entry.status = NotificationStatus::DeadLetter;
                entry.error = Some("expired before delivery".to_string());
                entry.completed_at = Some(now);
            }
        }
        Ok(expired_ids.len() as u64)
    }

    async fn get_stats(&self) -> StorageResult<QueueStats> {
        let mut stats = QueueStats::default();
        let mut sent = 0u64;
        let mut terminal = 0u64;
        for entry in self.items.iter() {
            let item = entry.value();
            stats.total += 1;
            *stats.by_status.entry(status_label(item.status).to_string()).or_insert(0) += 1;
            *stats.by_channel.entry(item.channel().as_str().to_string()).or_insert(0) += 1;
            if item.status == NotificationStatus::Pending {
                stats.queue_depth += 1;
            }
            if item.status.is_terminal() {
                terminal += 1;
                if item.status == NotificationStatus::Sent {
                    sent += 1;
                }
            }
        }
        stats.success_rate = if terminal > 0 { sent as f64 / terminal as f64 } else { 0.0 };
        Ok(stats)
    }

    async fn count_by_status(&self, status: NotificationStatus) -> StorageResult<u64> {
        Ok(self.items.iter().filter(|entry| entry.value().status == status).count() as u64)
    }

    async fn list_by_channel(&self, channel: Channel, limit: u32) -> StorageResult<Vec<QueueItem>> {
        Ok(self
            .items
            .iter()
            .filter(|entry| entry.value().channel() == channel)
            .take(limit as usize)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn remove(&self, id: Uuid) -> StorageResult<bool> {
        Ok(self.items.remove(&id).is_some())
    }

    async fn update(&self, id: Uuid, patch: Box<dyn FnOnce(&mut QueueItem) + Send>) -> StorageResult<Option<QueueItem>> {
        match self.items.get_mut(&id) {
            Some(mut entry) => {
                patch(entry.value_mut());
                Ok(Some(entry.value().clone()))
            }
            None => Ok(None),
        }
    }

    async fn clear(&self) -> StorageResult<()> {
        self.items.clear();
        Ok(())
    }
}

fn status_label(status: NotificationStatus) -> &'static str {
    match status {
        NotificationStatus::Pending => "pending",
        NotificationStatus::Processing => "processing",
        NotificationStatus::Sent => "sent",
        NotificationStatus::Failed => "failed",
        NotificationStatus::DeadLetter => "dead_letter",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_common::{NotificationPayload, PayloadHeader, Priority, DEFAULT_MAX_ATTEMPTS};

    fn sample_item(priority: Priority, created_at: DateTime<Utc>) -> QueueItem {
        QueueItem {
            id: Uuid::new_v4(),
            payload: NotificationPayload::Email {
                header: PayloadHeader::new("t", "b"),
                to: vec!["a@example.com".to_string()],
                cc: vec![],
            },
            priority,
            status: NotificationStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at,
            scheduled_at: None,
            processing_started_at: None,
            completed_at: None,
            expires_at: None,
            error: None,
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn claim_pending_orders_by_priority_then_age() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        let low = sample_item(Priority::Low, now);
        let high = sample_item(Priority::High, now + Duration::seconds(1));
        storage.insert(low.clone()).await.unwrap();
        storage.insert(high.clone()).await.unwrap();

        let claimed = storage.claim_pending(10, now + Duration::seconds(2)).await.unwrap();
        assert_eq!(claimed[0].id, high.id);
        assert_eq!(claimed[1].id, low.id);
        assert!(claimed.iter().all(|i| i.status == NotificationStatus::Processing));
    }

    #[tokio::test]
    async fn claim_pending_never_double_claims() {
        let storage = std::sync::Arc::new(InMemoryStorage::new());
        let now = Utc::now();
        for _ in 0..20 {
            storage.insert(sample_item(Priority::Normal, now)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move { storage.claim_pending(10, now).await.unwrap() }));
        }
        let mut all_ids = std::collections::HashSet::new();
        let mut total = 0;
        for handle in handles {
            let claimed = handle.await.unwrap();
            total += claimed.len();
            for item in claimed {
                assert!(all_ids.insert(item.id), "item claimed twice");
            }
        }
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn mark_failed_with_retry_reschedules() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        let item = sample_item(Priority::Normal, now);
        let id = item.id;
        storage.insert(item).await.unwrap();
        storage.claim_pending(1, now).await.unwrap();

        let next = now + Duration::seconds(60);
        storage.mark_failed(id, "timeout".to_string(), true, Some(next), now).await.unwrap();

        let stored = storage.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.scheduled_at, Some(next));
    }

    #[tokio::test]
    async fn remove_deletes_the_item_and_is_idempotent() {
        let storage = InMemoryStorage::new();
        let item = sample_item(Priority::Normal, Utc::now());
        let id = item.id;
        storage.insert(item).await.unwrap();

        assert!(storage.remove(id).await.unwrap());
        assert!(storage.get(id).await.unwrap().is_none());
        assert!(!storage.remove(id).await.unwrap());
    }

    #[tokio::test]
    async fn update_applies_an_arbitrary_patch() {
        let storage = InMemoryStorage::new();
        let item = sample_item(Priority::Normal, Utc::now());
        let id = item.id;
        storage.insert(item).await.unwrap();

        let patched = storage
            .update(id, Box::new(|item: &mut QueueItem| item.correlation_id = Some("corr-1".to_string())))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(patched.correlation_id, Some("corr-1".to_string()));
        assert_eq!(storage.get(id).await.unwrap().unwrap().correlation_id, Some("corr-1".to_string()));
    }

    #[tokio::test]
    async fn update_on_missing_id_returns_none() {
        let storage = InMemoryStorage::new();
        let result = storage.update(Uuid::new_v4(), Box::new(|_: &mut QueueItem| {})).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cleanup_expired_dead_letters_expired_pending_items() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        let mut item = sample_item(Priority::Normal, now);
        item.expires_at = Some(now - Duration::seconds(1));
        let id = item.id;
        storage.insert(item).await.unwrap();

        let removed = storage.cleanup_expired(now).await.unwrap();
        assert_eq!(removed, 1);
        let stored = storage.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::DeadLetter);
    }
}
