//! Channel handler contract and the registry mapping channels to handlers.

pub mod circuit_breaker;
pub mod http_webhook;
pub mod mock;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use http_webhook::{HttpWebhookConfig, HttpWebhookHandler};
pub use mock::{MockHandler, SendOutcome};

use async_trait::async_trait;
use dashmap::DashMap;
use notify_common::errors::HandlerError;
use notify_common::{Channel, QueueItem};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HandlerStatus {
    pub channel: Channel,
    pub available: bool,
    pub circuit_state: Option<CircuitState>,
}

/// Delivery contract for a single channel. Mirrors the teacher's
/// `Mediator` trait shape (one async entry point plus liveness
/// introspection) generalized from a single ack/delay outcome to the
/// five-channel `send` contract.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn send(&self, item: &QueueItem) -> Result<(), HandlerError>;

    /// Whether the handler currently believes it can accept work (e.g. the
    /// circuit breaker is not open). The processor treats `false` as a
    /// transient condition, not a permanent failure.
    async fn is_available(&self) -> bool;

    fn get_status(&self) -> HandlerStatus;
}

/// `DashMap<Channel, Arc<dyn ChannelHandler>>` — registering a handler for
/// a channel that already has one simply replaces it.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<Channel, Arc<dyn ChannelHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: DashMap::new() }
    }

    pub fn register(&self, channel: Channel, handler: Arc<dyn ChannelHandler>) {
        self.handlers.insert(channel, handler);
    }

    pub fn unregister(&self, channel: Channel) {
        self.handlers.remove(&channel);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers.get(&channel).map(|entry| entry.value().clone())
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.handlers.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockHandler, SendOutcome};

    #[test]
    fn register_replaces_existing_handler() {
        let registry = HandlerRegistry::new();
        registry.register(Channel::Email, Arc::new(MockHandler::new(vec![SendOutcome::Success])));
        registry.register(Channel::Email, Arc::new(MockHandler::new(vec![SendOutcome::Success])));
        assert_eq!(registry.channels().len(), 1);
    }

    #[test]
    fn get_returns_none_for_unregistered_channel() {
        let registry = HandlerRegistry::new();
        assert!(registry.get(Channel::Push).is_none());
    }
}
