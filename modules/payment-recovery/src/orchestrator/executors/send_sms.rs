//! `send_sms` executor: the SMS counterpart of [`super::send_email`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{StepContext, StepExecutor, StepOutcome};
use crate::collaborators::{CommunicationDispatcher, SmsRequest};

#[derive(Debug, Deserialize)]
struct SendSmsConfig {
    template_id: String,
    #[serde(default)]
    variables: HashMap<String, String>,
}

pub struct SendSmsExecutor {
    dispatcher: Arc<dyn CommunicationDispatcher>,
}

impl SendSmsExecutor {
    pub fn new(dispatcher: Arc<dyn CommunicationDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl StepExecutor for SendSmsExecutor {
    async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let config: SendSmsConfig = match serde_json::from_value(ctx.step.config.clone()) {
            Ok(c) => c,
            Err(e) => return StepOutcome::Failure { error: format!("invalid send_sms config: {e}") },
        };

        let Some(to) = ctx.failure.customer_phone_number() else {
            return StepOutcome::Failure { error: "payment failure has no phone number on record".to_string() };
        };

        if ctx.cancel_token.is_cancelled() {
            return StepOutcome::Cancelled;
        }

        let mut variables = config.variables;
        variables.entry("customer_name".to_string()).or_insert_with(|| ctx.failure.customer_name.clone().unwrap_or_default());
        variables.entry("amount".to_string()).or_insert_with(|| ctx.failure.amount.to_string());

        let request = SmsRequest { to, template: config.template_id, variables };

        match self.dispatcher.send_sms(request).await {
            Ok(result) => StepOutcome::Success {
                result: serde_json::json!({"template_used": result.template_used}),
                external_id: Some(result.message_id),
            },
            Err(e) => StepOutcome::Failure { error: e.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryCommunicationDispatcher;
    use crate::model::{NewPaymentFailure, StepType, SyncSource, WorkflowStep};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tokio_util::sync::CancellationToken;

    fn failure() -> crate::model::PaymentFailure {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("phone_number".to_string(), "+15551234567".to_string());
        crate::model::PaymentFailure::new(NewPaymentFailure {
            provider_id: "cardnet".into(),
            provider_event_id: "evt_1".into(),
            provider_event_type: "t".into(),
            company_id: "c1".into(),
            amount: Decimal::new(250000, 2),
            currency: "USD".into(),
            customer_id: "c1".into(),
            customer_name: Some("Jane".into()),
            customer_email: None,
            failure_reason: "card_declined".into(),
            failure_code: None,
            failure_message: None,
            business_category: "general".into(),
            occurred_at: Utc::now(),
            due_date: None,
            sync_source: SyncSource::Webhook,
            raw_data: Vec::new(),
            provider_metadata: metadata,
        })
    }

    #[tokio::test]
    async fn dispatches_and_records_message_id() {
        let executor = SendSmsExecutor::new(Arc::new(InMemoryCommunicationDispatcher::default()));
        let f = failure();
        let step = WorkflowStep {
            step_order: 0,
            step_type: StepType::SendSms,
            config: serde_json::json!({"template_id": "payment_failed_sms"}),
            conditions: None,
            delay_seconds: 0,
            is_parallel: false,
            is_critical: false,
            is_active: true,
        };
        let token = CancellationToken::new();
        let ctx = StepContext { failure: &f, step: &step, cancel_token: &token };

        match executor.execute(&ctx).await {
            StepOutcome::Success { external_id, .. } => assert!(external_id.unwrap().starts_with("sms-")),
            other => panic!("expected success, got {other:?}"),
        }
    }
}
