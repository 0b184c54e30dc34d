//! Webhook-driven mediator for a card-network-style provider: HMAC-SHA256
//! signature verification, replay protection, and mapping to the canonical
//! [`PaymentFailure`]. Signature scheme follows the same `t=...,v1=...`
//! shape and constant-time comparison used for gateway webhook
//! verification elsewhere in this codebase.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;

use super::ratelimit::TokenBucket;
use super::{HealthState, Mediator, SyncStatus};
use crate::error::MediatorError;
use crate::model::{NewPaymentFailure, PaymentFailure, SyncSource};

type HmacSha256 = Hmac<Sha256>;

/// Raw webhook payload shape this provider sends for a failed charge.
#[derive(Debug, Deserialize)]
struct CardNetworkEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: CardNetworkEventData,
}

#[derive(Debug, Deserialize)]
struct CardNetworkEventData {
    customer_id: String,
    customer_name: Option<String>,
    customer_email: Option<String>,
    amount: Decimal,
    currency: String,
    failure_code: Option<String>,
    failure_message: Option<String>,
    occurred_at: DateTime<Utc>,
}

pub struct CardNetworkWebhookMediator {
    provider_id: String,
    webhook_secret: String,
    replay_window_secs: i64,
    rate_limiter: TokenBucket,
    sync_status: Mutex<SyncStatus>,
    connected: Mutex<bool>,
}

impl CardNetworkWebhookMediator {
    pub fn new(provider_id: impl Into<String>, webhook_secret: impl Into<String>, replay_window_secs: i64, rate_per_sec: u32, burst: u32) -> Arc<Self> {
        Arc::new(Self {
            provider_id: provider_id.into(),
            webhook_secret: webhook_secret.into(),
            replay_window_secs,
            rate_limiter: TokenBucket::new(rate_per_sec, burst),
            sync_status: Mutex::new(SyncStatus::default()),
            connected: Mutex::new(false),
        })
    }

    /// Verify a `t=<unix_ts>,v1=<hex_hmac>` signature header against
    /// `raw_body`, rejecting anything older than the replay window. The
    /// window is measured from `received_at`, not wall-clock time, so a
    /// webhook replayed from internal retry/queueing isn't judged against
    /// the time it happens to be reprocessed.
    fn verify_signature(&self, raw_body: &[u8], signature: &str, received_at: DateTime<Utc>) -> Result<(), MediatorError> {
        let parts: Vec<&str> = signature.split(',').collect();
        let timestamp_part = parts.iter().find(|p| p.starts_with("t=")).ok_or(MediatorError::InvalidSignature)?;
        let signature_part = parts.iter().find(|p| p.starts_with("v1=")).ok_or(MediatorError::InvalidSignature)?;

        let timestamp: i64 = timestamp_part.strip_prefix("t=").and_then(|t| t.parse().ok()).ok_or(MediatorError::InvalidSignature)?;
        let received_signature = signature_part.strip_prefix("v1=").ok_or(MediatorError::InvalidSignature)?;

        if (received_at.timestamp() - timestamp).abs() > self.replay_window_secs {
            return Err(MediatorError::Replay);
        }

        let signed_payload = [timestamp.to_string().as_bytes(), b".", raw_body].concat();
        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes()).map_err(|_| MediatorError::InvalidSignature)?;
        mac.update(&signed_payload);
        let expected = hex::encode(mac.finalize().into_bytes());

        let received_bytes = hex::decode(received_signature).map_err(|_| MediatorError::InvalidSignature)?;
        let expected_bytes = hex::decode(&expected).map_err(|_| MediatorError::InvalidSignature)?;
        if received_bytes.len() != expected_bytes.len() {
            return Err(MediatorError::InvalidSignature);
        }
        let mismatch = received_bytes.iter().zip(expected_bytes.iter()).fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if mismatch == 0 {
            Ok(())
        } else {
            Err(MediatorError::InvalidSignature)
        }
    }

    fn map_event(&self, event: CardNetworkEvent) -> Result<PaymentFailure, MediatorError> {
        let raw_data = serde_json::to_vec(&serde_json::json!({"id": &event.id, "type": &event.event_type}))
            .map_err(|e| MediatorError::MappingError(e.to_string()))?;

        Ok(PaymentFailure::new(NewPaymentFailure {
            provider_id: self.provider_id.clone(),
            provider_event_id: event.id,
            provider_event_type: event.event_type,
            company_id: String::new(),
            amount: event.data.amount,
            currency: event.data.currency,
            customer_id: event.data.customer_id,
            customer_name: event.data.customer_name,
            customer_email: event.data.customer_email,
            failure_reason: event.data.failure_code.clone().unwrap_or_else(|| "card_declined".to_string()),
            failure_code: event.data.failure_code,
            failure_message: event.data.failure_message,
            business_category: String::new(),
            occurred_at: event.data.occurred_at,
            due_date: None,
            sync_source: SyncSource::Webhook,
            raw_data,
            provider_metadata: Default::default(),
        }))
    }
}

#[async_trait]
impl Mediator for CardNetworkWebhookMediator {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn connect(&self) -> Result<(), MediatorError> {
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MediatorError> {
        *self.connected.lock().unwrap() = false;
        Ok(())
    }

    async fn process_webhook(&self, raw_bytes: &[u8], signature: &str, received_at: DateTime<Utc>) -> Result<PaymentFailure, MediatorError> {
        if !self.rate_limiter.try_acquire() {
            return Err(MediatorError::RateLimited);
        }

        self.verify_signature(raw_bytes, signature, received_at)?;

        let event: CardNetworkEvent = serde_json::from_slice(raw_bytes).map_err(|e| MediatorError::DecodeError(e.to_string()))?;
        self.map_event(event)
    }

    async fn poll_since(&self, _since: DateTime<Utc>) -> Result<Vec<PaymentFailure>, MediatorError> {
        Ok(Vec::new())
    }

    async fn get_sync_status(&self) -> SyncStatus {
        self.sync_status.lock().unwrap().clone()
    }

    async fn get_health(&self) -> HealthState {
        if *self.connected.lock().unwrap() {
            HealthState::Healthy
        } else {
            HealthState::Degraded("not connected".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
        let signed_payload = [timestamp.to_string().as_bytes(), b".", body].concat();
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(&signed_payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn sample_body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.payment_failed",
            "data": {
                "customer_id": "c1",
                "amount": "2500.00",
                "currency": "USD",
                "failure_code": "card_declined",
                "occurred_at": Utc::now().to_rfc3339(),
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn valid_signature_maps_to_canonical_failure() {
        let mediator = CardNetworkWebhookMediator::new("cardnet", "whsec_test", 300, 100, 200);
        let body = sample_body();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let signature = sign("whsec_test", now, &body);

        let failure = mediator.process_webhook(&body, &signature, Utc::now()).await.unwrap();
        assert_eq!(failure.provider_event_id, "evt_1");
        assert_eq!(failure.customer_id, "c1");
    }

    #[tokio::test]
    async fn mismatched_signature_is_rejected() {
        let mediator = CardNetworkWebhookMediator::new("cardnet", "whsec_test", 300, 100, 200);
        let body = sample_body();
        let result = mediator.process_webhook(&body, "t=1,v1=deadbeef", Utc::now()).await;
        assert!(matches!(result, Err(MediatorError::InvalidSignature)));
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected_as_replay() {
        let mediator = CardNetworkWebhookMediator::new("cardnet", "whsec_test", 300, 100, 200);
        let body = sample_body();
        let old_timestamp = 1_000_000;
        let signature = sign("whsec_test", old_timestamp, &body);

        let result = mediator.process_webhook(&body, &signature, Utc::now()).await;
        assert!(matches!(result, Err(MediatorError::Replay)));
    }

    #[tokio::test]
    async fn rate_limited_after_burst_exhausted() {
        let mediator = CardNetworkWebhookMediator::new("cardnet", "whsec_test", 300, 1, 1);
        let body = sample_body();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let signature = sign("whsec_test", now, &body);

        assert!(mediator.process_webhook(&body, &signature, Utc::now()).await.is_ok());
        let second = mediator.process_webhook(&body, &signature, Utc::now()).await;
        assert!(matches!(second, Err(MediatorError::RateLimited)));
    }
}
