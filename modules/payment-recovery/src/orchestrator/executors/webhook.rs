//! `webhook` executor: POSTs the execution context (or a configured subset
//! of it) to an operator-configured URL. Non-critical by default per §4.4 —
//! a workflow author opts a webhook step into halting the execution by
//! setting `is_critical` on the step itself.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{StepContext, StepExecutor, StepOutcome};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct WebhookConfig {
    url: String,
    #[serde(default)]
    fields: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WebhookResponseBody {
    external_id: Option<String>,
}

pub struct WebhookExecutor {
    http: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new() -> Self {
        Self { http: reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build().expect("reqwest client") }
    }

    fn build_payload(failure: &crate::model::PaymentFailure, fields: &[String]) -> serde_json::Value {
        if fields.is_empty() {
            return serde_json::json!({
                "payment_failure_id": failure.id,
                "provider_id": failure.provider_id,
                "provider_event_id": failure.provider_event_id,
                "amount": failure.amount.to_string(),
                "currency": failure.currency,
                "status": failure.status,
                "priority": failure.priority,
            });
        }

        let full = serde_json::to_value(failure).unwrap_or(serde_json::Value::Null);
        let mut subset = serde_json::Map::new();
        for field in fields {
            if let Some(value) = full.get(field) {
                subset.insert(field.clone(), value.clone());
            }
        }
        serde_json::Value::Object(subset)
    }
}

impl Default for WebhookExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for WebhookExecutor {
    async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let config: WebhookConfig = match serde_json::from_value(ctx.step.config.clone()) {
            Ok(c) => c,
            Err(e) => return StepOutcome::Failure { error: format!("invalid webhook config: {e}") },
        };

        if ctx.cancel_token.is_cancelled() {
            return StepOutcome::Cancelled;
        }

        let payload = Self::build_payload(ctx.failure, &config.fields);

        let response = tokio::select! {
            result = self.http.post(&config.url).json(&payload).send() => result,
            _ = ctx.cancel_token.cancelled() => return StepOutcome::Cancelled,
        };

        match response {
            Ok(response) => {
                let status = response.status();
                if !status.is_success() {
                    return StepOutcome::Failure { error: format!("webhook returned status {status}") };
                }
                let external_id = response.json::<WebhookResponseBody>().await.ok().and_then(|b| b.external_id);
                StepOutcome::Success { result: serde_json::json!({"status": status.as_u16()}), external_id }
            }
            Err(e) => StepOutcome::Failure { error: e.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewPaymentFailure, SyncSource};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn failure() -> crate::model::PaymentFailure {
        crate::model::PaymentFailure::new(NewPaymentFailure {
            provider_id: "cardnet".into(),
            provider_event_id: "evt_1".into(),
            provider_event_type: "t".into(),
            company_id: "c1".into(),
            amount: Decimal::new(250000, 2),
            currency: "USD".into(),
            customer_id: "c1".into(),
            customer_name: None,
            customer_email: None,
            failure_reason: "card_declined".into(),
            failure_code: None,
            failure_message: None,
            business_category: "general".into(),
            occurred_at: Utc::now(),
            due_date: None,
            sync_source: SyncSource::Webhook,
            raw_data: Vec::new(),
            provider_metadata: Default::default(),
        })
    }

    #[test]
    fn default_payload_includes_canonical_identity_fields() {
        let f = failure();
        let payload = WebhookExecutor::build_payload(&f, &[]);
        assert_eq!(payload["provider_event_id"], "evt_1");
    }

    #[test]
    fn field_subset_only_includes_requested_keys() {
        let f = failure();
        let payload = WebhookExecutor::build_payload(&f, &["provider_id".to_string()]);
        assert!(payload.get("provider_id").is_some());
        assert!(payload.get("amount").is_none());
    }
}
