//! `send_email` executor: interpolates a template and dispatches it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{StepContext, StepExecutor, StepOutcome};
use crate::collaborators::{CommunicationDispatcher, EmailRequest};

#[derive(Debug, Deserialize)]
struct SendEmailConfig {
    template_id: String,
    #[serde(default)]
    variables: HashMap<String, String>,
}

fn interpolate_variables(failure: &crate::model::PaymentFailure, extra: &HashMap<String, String>) -> HashMap<String, String> {
    let mut variables = HashMap::new();
    variables.insert("customer_name".to_string(), failure.customer_name.clone().unwrap_or_default());
    variables.insert("amount".to_string(), failure.amount.to_string());
    variables.insert("currency".to_string(), failure.currency.clone());
    variables.insert("failure_reason".to_string(), failure.failure_reason.clone());
    variables.insert("transaction_id".to_string(), failure.provider_event_id.clone());
    for (key, value) in extra {
        variables.insert(key.clone(), value.clone());
    }
    variables
}

pub struct SendEmailExecutor {
    dispatcher: Arc<dyn CommunicationDispatcher>,
}

impl SendEmailExecutor {
    pub fn new(dispatcher: Arc<dyn CommunicationDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl StepExecutor for SendEmailExecutor {
    async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let config: SendEmailConfig = match serde_json::from_value(ctx.step.config.clone()) {
            Ok(c) => c,
            Err(e) => return StepOutcome::Failure { error: format!("invalid send_email config: {e}") },
        };

        let Some(to) = ctx.failure.customer_email.clone() else {
            return StepOutcome::Failure { error: "payment failure has no customer_email".to_string() };
        };

        if ctx.cancel_token.is_cancelled() {
            return StepOutcome::Cancelled;
        }

        let variables = interpolate_variables(ctx.failure, &config.variables);
        let request = EmailRequest { to, template: config.template_id, variables };

        match self.dispatcher.send_email(request).await {
            Ok(result) => StepOutcome::Success {
                result: serde_json::json!({"template_used": result.template_used}),
                external_id: Some(result.message_id),
            },
            Err(e) => StepOutcome::Failure { error: e.to_string() },
        }
    }
}
