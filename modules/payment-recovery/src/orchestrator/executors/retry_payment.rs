//! `retry_payment` executor: submits a retry job and records its id.
//! Success means the job was accepted, not that the retry itself
//! succeeded — the provider emits a new event that re-enters the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{StepContext, StepExecutor, StepOutcome};
use crate::collaborators::RetryJobSubmitter;

#[derive(Debug, Deserialize)]
struct RetryPaymentConfig {
    provider: String,
    new_amount: Option<Decimal>,
    #[serde(default = "default_retry_reason")]
    retry_reason: String,
}

fn default_retry_reason() -> String {
    "automatic_recovery".to_string()
}

pub struct RetryPaymentExecutor {
    submitter: Arc<dyn RetryJobSubmitter>,
}

impl RetryPaymentExecutor {
    pub fn new(submitter: Arc<dyn RetryJobSubmitter>) -> Self {
        Self { submitter }
    }
}

#[async_trait]
impl StepExecutor for RetryPaymentExecutor {
    async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let config: RetryPaymentConfig = match serde_json::from_value(ctx.step.config.clone()) {
            Ok(c) => c,
            Err(e) => return StepOutcome::Failure { error: format!("invalid retry_payment config: {e}") },
        };

        if ctx.cancel_token.is_cancelled() {
            return StepOutcome::Cancelled;
        }

        match self.submitter.submit_retry(ctx.failure.id, &config.provider, config.new_amount, &config.retry_reason).await {
            Ok(job_id) => StepOutcome::Success { result: serde_json::json!({"job_id": &job_id}), external_id: Some(job_id) },
            Err(e) => StepOutcome::Failure { error: e.to_string() },
        }
    }
}
