//! Shared types for the notification delivery pipeline.
//!
//! This crate is the dependency-free core that every other `notify-*` crate
//! builds on: the queue item and payload shapes, the lifecycle event schema,
//! the error taxonomy, a clock abstraction for deterministic tests, and
//! structured logging setup.

pub mod clock;
pub mod errors;
pub mod events;
pub mod logging;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use clock::{Clock, SystemClock, TestClock};
pub use errors::{HandlerError, RateLimitKeyType, StorageError, ValidationError};
pub use events::{Event, EventBus, EventKind, SubscriptionId};

/// The channel a notification travels over. Determines the payload shape and
/// which handler is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    Email,
    Telegram,
    Discord,
    Push,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Email,
        Channel::Telegram,
        Channel::Discord,
        Channel::Push,
        Channel::Sms,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Telegram => "telegram",
            Channel::Discord => "discord",
            Channel::Push => "push",
            Channel::Sms => "sms",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivery priority. Ordering is severity-ascending so storage can sort
/// `PENDING` items by priority descending with a plain `Ord` comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Lifecycle status of a queue item. Forms the DAG described in the data
/// model: `Pending -> Processing -> {Sent, Failed}`; `Failed -> Pending`
/// (retry) `| DeadLetter`; `Sent` and `DeadLetter` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    DeadLetter,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::DeadLetter)
    }
}

/// Fields common to every channel payload, composed in rather than inherited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PayloadHeader {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub template_id: Option<String>,
}

impl PayloadHeader {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            metadata: HashMap::new(),
            template_id: None,
        }
    }
}

/// Tagged union over the five supported channel payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum NotificationPayload {
    Email {
        #[serde(flatten)]
        header: PayloadHeader,
        to: Vec<String>,
        #[serde(default)]
        cc: Vec<String>,
    },
    Telegram {
        #[serde(flatten)]
        header: PayloadHeader,
        chat_id: String,
        #[serde(default)]
        parse_mode: Option<String>,
    },
    Discord {
        #[serde(flatten)]
        header: PayloadHeader,
        webhook_url: String,
        #[serde(default)]
        mentions: Vec<String>,
    },
    Push {
        #[serde(flatten)]
        header: PayloadHeader,
        device_tokens: Vec<String>,
    },
    Sms {
        #[serde(flatten)]
        header: PayloadHeader,
        phone_numbers: Vec<String>,
    },
}

impl NotificationPayload {
    pub fn channel(&self) -> Channel {
        match self {
            NotificationPayload::Email { .. } => Channel::Email,
            NotificationPayload::Telegram { .. } => Channel::Telegram,
            NotificationPayload::Discord { .. } => Channel::Discord,
            NotificationPayload::Push { .. } => Channel::Push,
            NotificationPayload::Sms { .. } => Channel::Sms,
        }
    }

    pub fn header(&self) -> &PayloadHeader {
        match self {
            NotificationPayload::Email { header, .. }
            | NotificationPayload::Telegram { header, .. }
            | NotificationPayload::Discord { header, .. }
            | NotificationPayload::Push { header, .. }
            | NotificationPayload::Sms { header, .. } => header,
        }
    }

    /// Validate required fields at enqueue time. Malformed payloads are
    /// rejected synchronously and never enqueued (spec.md ValidationError).
    pub fn validate(&self) -> Result<(), ValidationError> {
        let header = self.header();
        if header.title.trim().is_empty() {
            return Err(ValidationError::EmptyField("title"));
        }
        if header.body.trim().is_empty() {
            return Err(ValidationError::EmptyField("body"));
        }
        match self {
            NotificationPayload::Email { to, .. } => {
                if to.is_empty() {
                    return Err(ValidationError::MissingRecipient);
                }
                for addr in to {
                    if !is_plausible_email(addr) {
                        return Err(ValidationError::InvalidEmail(addr.clone()));
                    }
                }
            }
            NotificationPayload::Telegram { chat_id, .. } => {
                if chat_id.trim().is_empty() {
                    return Err(ValidationError::MissingRecipient);
                }
            }
            NotificationPayload::Discord { webhook_url, .. } => {
                if webhook_url.trim().is_empty() {
                    return Err(ValidationError::MissingRecipient);
                }
            }
            NotificationPayload::Push { device_tokens, .. } => {
                if device_tokens.is_empty() {
                    return Err(ValidationError::MissingRecipient);
                }
            }
            NotificationPayload::Sms { phone_numbers, .. } => {
                if phone_numbers.is_empty() {
                    return Err(ValidationError::MissingRecipient);
                }
            }
        }
        Ok(())
    }
}

fn is_plausible_email(addr: &str) -> bool {
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

/// The unit of work stored by `notify-storage` and claimed by the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub payload: NotificationPayload,
    pub priority: Priority,
    pub status: NotificationStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub correlation_id: Option<String>,
}

impl QueueItem {
    pub fn channel(&self) -> Channel {
        self.payload.channel()
    }

    /// An item is "ready" iff PENDING, its schedule has elapsed (or was
    /// never set), and it has not expired.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        if self.status != NotificationStatus::Pending {
            return false;
        }
        if let Some(scheduled_at) = self.scheduled_at {
            if scheduled_at > now {
                return false;
            }
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return false;
            }
        }
        true
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

/// Input accepted by the storage/facade `add` operations, before an id and
/// bookkeeping timestamps are assigned.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub payload: NotificationPayload,
    pub priority: Priority,
    pub max_attempts: Option<u32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
}

impl NotificationRequest {
    pub fn new(payload: NotificationPayload) -> Self {
        Self {
            payload,
            priority: Priority::default(),
            max_attempts: None,
            scheduled_at: None,
            expires_at: None,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Default max-attempts applied when a request doesn't specify one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Aggregate statistics reported by `Storage::get_stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub by_status: HashMap<String, u64>,
    pub by_channel: HashMap<String, u64>,
    pub queue_depth: u64,
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_severity_ascending() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn validate_rejects_empty_recipient() {
        let payload = NotificationPayload::Email {
            header: PayloadHeader::new("hi", "body"),
            to: vec![],
            cc: vec![],
        };
        assert!(matches!(payload.validate(), Err(ValidationError::MissingRecipient)));
    }

    #[test]
    fn validate_rejects_malformed_email() {
        let payload = NotificationPayload::Email {
            header: PayloadHeader::new("hi", "body"),
            to: vec!["not-an-email".to_string()],
            cc: vec![],
        };
        assert!(matches!(payload.validate(), Err(ValidationError::InvalidEmail(_))));
    }

    #[test]
    fn is_ready_respects_schedule_and_expiry() {
        let now = Utc::now();
        let item = QueueItem {
            id: Uuid::new_v4(),
            payload: NotificationPayload::Sms {
                header: PayloadHeader::new("t", "b"),
                phone_numbers: vec!["+15551234567".to_string()],
            },
            priority: Priority::Normal,
            status: NotificationStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: now,
            scheduled_at: Some(now + chrono::Duration::seconds(1)),
            processing_started_at: None,
            completed_at: None,
            expires_at: None,
            error: None,
            correlation_id: None,
        };
        assert!(!item.is_ready(now));
        assert!(item.is_ready(now + chrono::Duration::seconds(2)));
    }
}
