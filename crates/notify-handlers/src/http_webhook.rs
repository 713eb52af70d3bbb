//! Generic HTTP webhook delivery handler, generalized from the teacher's
//! `HttpMediator`: same HMAC-SHA256 signing scheme and circuit breaker, but
//! dispatching the five-channel `NotificationPayload` shapes as a JSON body
//! instead of the single Java-compatible ack/delay envelope.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use notify_common::errors::HandlerError;
use notify_common::{NotificationPayload, QueueItem};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreaker;
use crate::{ChannelHandler, HandlerStatus};

pub const SIGNATURE_HEADER: &str = "X-NOTIFY-SIGNATURE";
pub const TIMESTAMP_HEADER: &str = "X-NOTIFY-TIMESTAMP";

type HmacSha256 = Hmac<Sha256>;

fn sign_webhook(payload: &str, signing_secret: &str) -> (String, String) {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let signature_payload = format!("{}{}", timestamp, payload);
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes()).expect("HMAC accepts a key of any size");
    mac.update(signature_payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    (signature, timestamp)
}

#[derive(Debug, Clone)]
pub struct HttpWebhookConfig {
    pub default_endpoint: Option<String>,
    pub signing_secret: Option<String>,
    pub timeout: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_success_threshold: u32,
    pub circuit_breaker_reset_timeout: Duration,
}

impl Default for HttpWebhookConfig {
    fn default() -> Self {
        Self {
            default_endpoint: None,
            signing_secret: None,
            timeout: Duration::from_secs(30),
            circuit_breaker_threshold: 10,
            circuit_breaker_success_threshold: 5,
            circuit_breaker_reset_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    item_id: String,
    channel: &'a str,
    title: &'a str,
    body: &'a str,
    metadata: &'a std::collections::HashMap<String, String>,
}

pub struct HttpWebhookHandler {
    client: Client,
    config: HttpWebhookConfig,
    circuit_breaker: CircuitBreaker,
}

impl HttpWebhookHandler {
    pub fn new(config: HttpWebhookConfig) -> Self {
        let client = Client::builder().timeout(config.timeout).build().expect("reqwest client builds with static config");
        let circuit_breaker = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_success_threshold,
            config.circuit_breaker_reset_timeout,
        );
        Self { client, config, circuit_breaker }
    }

    fn target_url<'a>(&self, payload: &'a NotificationPayload) -> Option<&'a str> {
        match payload {
            NotificationPayload::Discord { webhook_url, .. } => Some(webhook_url.as_str()),
            _ => self.config.default_endpoint.as_deref(),
        }
    }
}

#[async_trait]
impl ChannelHandler for HttpWebhookHandler {
    async fn send(&self, item: &QueueItem) -> Result<(), HandlerError> {
        if !self.circuit_breaker.allow_request() {
            return Err(HandlerError::retryable("circuit breaker open"));
        }

        let url = match self.target_url(&item.payload) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => return Err(HandlerError::fatal("no webhook endpoint configured for this payload")),
        };

        let header = item.payload.header();
        let body = WebhookBody {
            item_id: item.id.to_string(),
            channel: item.payload.channel().as_str(),
            title: &header.title,
            body: &header.body,
            metadata: &header.metadata,
        };
        let json_body = serde_json::to_string(&body).map_err(|e| HandlerError::fatal(e.to_string()))?;

        let mut request = self.client.post(&url).header("Content-Type", "application/json");
        if let Some(secret) = &self.config.signing_secret {
            let (signature, timestamp) = sign_webhook(&json_body, secret);
            request = request.header(SIGNATURE_HEADER, signature).header(TIMESTAMP_HEADER, timestamp);
        }

        let response = request.body(json_body).send().await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    self.circuit_breaker.record_success();
                    Ok(())
                } else if status.as_u16() == 429 || status.is_server_error() {
                    self.circuit_breaker.record_failure();
                    Err(HandlerError::retryable(format!("webhook responded with status {}", status)))
                } else {
                    self.circuit_breaker.record_failure();
                    Err(HandlerError::fatal(format!("webhook responded with status {}", status)))
                }
            }
            Err(err) => {
                self.circuit_breaker.record_failure();
                Err(HandlerError::retryable(format!("webhook request failed: {}", err)))
            }
        }
    }

    async fn is_available(&self) -> bool {
        self.circuit_breaker.allow_request()
    }

    fn get_status(&self) -> HandlerStatus {
        HandlerStatus {
            channel: notify_common::Channel::Discord,
            available: self.circuit_breaker.allow_request(),
            circuit_state: Some(self.circuit_breaker.state()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_common::{NotificationStatus, PayloadHeader, Priority, DEFAULT_MAX_ATTEMPTS};
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn discord_item(webhook_url: String) -> QueueItem {
        QueueItem {
            id: Uuid::new_v4(),
            payload: NotificationPayload::Discord {
                header: PayloadHeader::new("title", "body"),
                webhook_url,
                mentions: vec![],
            },
            priority: Priority::Normal,
            status: NotificationStatus::Processing,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: Utc::now(),
            scheduled_at: None,
            processing_started_at: Some(Utc::now()),
            completed_at: None,
            expires_at: None,
            error: None,
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn success_response_closes_the_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let handler = HttpWebhookHandler::new(HttpWebhookConfig::default());
        let item = discord_item(format!("{}/hook", server.uri()));
        assert!(handler.send(&item).await.is_ok());
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let handler = HttpWebhookHandler::new(HttpWebhookConfig::default());
        let item = discord_item(format!("{}/hook", server.uri()));
        let err = handler.send(&item).await.unwrap_err();
        assert!(err.should_retry);
    }

    #[tokio::test]
    async fn client_error_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let handler = HttpWebhookHandler::new(HttpWebhookConfig::default());
        let item = discord_item(format!("{}/hook", server.uri()));
        let err = handler.send(&item).await.unwrap_err();
        assert!(!err.should_retry);
    }

    #[tokio::test]
    async fn missing_endpoint_is_fatal() {
        let handler = HttpWebhookHandler::new(HttpWebhookConfig::default());
        let item = discord_item(String::new());
        let err = handler.send(&item).await.unwrap_err();
        assert!(!err.should_retry);
    }
}
