//! Fingerprint generation shared between the deduplicator and the rate
//! limiter's RECIPIENT scope.

use notify_common::NotificationPayload;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Produces a deterministic string key from a payload. Swappable so callers
/// can supply domain-specific fingerprinting without touching the
/// deduplicator/rate-limiter internals.
pub trait KeyGenerator: Send + Sync {
    fn generate_key(&self, payload: &NotificationPayload, correlation_id: Option<&str>) -> String;
}

/// Default fingerprint: `channel | canonical_recipient | title | body | extra`,
/// SHA-256 hashed and hex-encoded. `correlation_id` is folded in only when
/// the caller opts in via `include_correlation_id`.
#[derive(Debug, Clone)]
pub struct DefaultKeyGenerator {
    pub include_correlation_id: bool,
}

impl Default for DefaultKeyGenerator {
    fn default() -> Self {
        Self { include_correlation_id: false }
    }
}

impl KeyGenerator for DefaultKeyGenerator {
    fn generate_key(&self, payload: &NotificationPayload, correlation_id: Option<&str>) -> String {
        let channel = payload.channel().as_str();
        let recipient = canonical_recipient(payload);
        let header = payload.header();
        let extra = channel_extra(payload);

        let mut parts = vec![
            channel.to_string(),
            recipient,
            header.title.clone(),
            header.body.clone(),
            extra,
        ];
        if self.include_correlation_id {
            if let Some(cid) = correlation_id {
                parts.push(cid.to_string());
            }
        }
        let joined = parts.join("|");

        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn canonicalize_str(s: &str) -> String {
    s.nfc().collect::<String>().trim().to_lowercase()
}

/// Lowercase-and-trim an email address, normalizing both local and domain
/// parts via NFC first so visually-identical addresses collide.
fn canonicalize_email(addr: &str) -> String {
    canonicalize_str(addr)
}

fn canonical_recipient(payload: &NotificationPayload) -> String {
    match payload {
        NotificationPayload::Email { to, .. } => {
            let mut addrs: Vec<String> = to.iter().map(|a| canonicalize_email(a)).collect();
            addrs.sort();
            addrs.join(",")
        }
        NotificationPayload::Telegram { chat_id, .. } => canonicalize_str(chat_id),
        NotificationPayload::Discord { webhook_url, mentions, .. } => {
            let mut all = vec![canonicalize_str(webhook_url)];
            let mut rest: Vec<String> = mentions.iter().map(|m| canonicalize_str(m)).collect();
            rest.sort();
            all.extend(rest);
            all.join(",")
        }
        NotificationPayload::Push { device_tokens, .. } => {
            let mut tokens: Vec<String> = device_tokens.iter().map(|t| canonicalize_str(t)).collect();
            tokens.sort();
            tokens.join(",")
        }
        NotificationPayload::Sms { phone_numbers, .. } => {
            let mut numbers: Vec<String> = phone_numbers.iter().map(|n| canonicalize_str(n)).collect();
            numbers.sort();
            numbers.join(",")
        }
    }
}

fn channel_extra(payload: &NotificationPayload) -> String {
    let mut extra = Vec::new();
    if let Some(template_id) = &payload.header().template_id {
        extra.push(template_id.clone());
    }
    if let NotificationPayload::Telegram { parse_mode, .. } = payload {
        if let Some(mode) = parse_mode {
            extra.push(mode.clone());
        }
    }
    extra.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_common::PayloadHeader;

    #[test]
    fn same_email_different_case_and_whitespace_collide() {
        let gen = DefaultKeyGenerator::default();
        let a = NotificationPayload::Email {
            header: PayloadHeader::new("Hi", "body"),
            to: vec!["  User@Example.com ".to_string()],
            cc: vec![],
        };
        let b = NotificationPayload::Email {
            header: PayloadHeader::new("Hi", "body"),
            to: vec!["user@example.com".to_string()],
            cc: vec![],
        };
        assert_eq!(gen.generate_key(&a, None), gen.generate_key(&b, None));
    }

    #[test]
    fn recipient_order_does_not_matter() {
        let gen = DefaultKeyGenerator::default();
        let a = NotificationPayload::Email {
            header: PayloadHeader::new("Hi", "body"),
            to: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            cc: vec![],
        };
        let b = NotificationPayload::Email {
            header: PayloadHeader::new("Hi", "body"),
            to: vec!["b@example.com".to_string(), "a@example.com".to_string()],
            cc: vec![],
        };
        assert_eq!(gen.generate_key(&a, None), gen.generate_key(&b, None));
    }

    #[test]
    fn different_body_yields_different_key() {
        let gen = DefaultKeyGenerator::default();
        let a = NotificationPayload::Sms {
            header: PayloadHeader::new("t", "body one"),
            phone_numbers: vec!["+15551234567".to_string()],
        };
        let b = NotificationPayload::Sms {
            header: PayloadHeader::new("t", "body two"),
            phone_numbers: vec!["+15551234567".to_string()],
        };
        assert_ne!(gen.generate_key(&a, None), gen.generate_key(&b, None));
    }
}
