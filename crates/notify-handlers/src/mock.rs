//! A programmable handler fake, grounded on the teacher's mediator test
//! doubles: a scripted sequence of outcomes played back in order, one per
//! `send` call.

use async_trait::async_trait;
use notify_common::errors::HandlerError;
use notify_common::{Channel, QueueItem};
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::{ChannelHandler, HandlerStatus};

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Success,
    RetryableFailure(String),
    FatalFailure(String),
}

pub struct MockHandler {
    script: Mutex<VecDeque<SendOutcome>>,
    default_outcome: SendOutcome,
    calls: Mutex<Vec<QueueItem>>,
    available: std::sync::atomic::AtomicBool,
    channel: Channel,
}

impl MockHandler {
    pub fn new(script: Vec<SendOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default_outcome: SendOutcome::Success,
            calls: Mutex::new(Vec::new()),
            available: std::sync::atomic::AtomicBool::new(true),
            channel: Channel::Email,
        }
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// The items `send` was called with, in call order.
    pub fn calls_in_order(&self) -> Vec<QueueItem> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ChannelHandler for MockHandler {
    async fn send(&self, item: &QueueItem) -> Result<(), HandlerError> {
        self.calls.lock().push(item.clone());
        let outcome = self.script.lock().pop_front().unwrap_or_else(|| self.default_outcome.clone());
        match outcome {
            SendOutcome::Success => Ok(()),
            SendOutcome::RetryableFailure(msg) => Err(HandlerError::retryable(msg)),
            SendOutcome::FatalFailure(msg) => Err(HandlerError::fatal(msg)),
        }
    }

    async fn is_available(&self) -> bool {
        self.available.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn get_status(&self) -> HandlerStatus {
        HandlerStatus {
            channel: self.channel,
            available: self.available.load(std::sync::atomic::Ordering::Relaxed),
            circuit_state: None,
        }
    }
}
