//! `conditional` executor: evaluates the shared expression DSL against the
//! payment failure and tells the orchestrator how to bend the step cursor.

use async_trait::async_trait;
use serde::Deserialize;

use super::{StepContext, StepExecutor, StepOutcome};
use crate::expr::{self, Expression};

/// What a matched/unmatched branch does to the orchestrator's step cursor.
/// `Continue` advances normally; `Skip` jumps `count` steps forward; `Stop`
/// ends the execution as completed without visiting remaining steps.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Branch {
    Continue,
    Skip { count: usize },
    Stop,
}

impl Default for Branch {
    fn default() -> Self {
        Branch::Continue
    }
}

#[derive(Debug, Deserialize)]
struct ConditionalConfig {
    #[serde(rename = "if")]
    expression: Expression,
    #[serde(default)]
    then: Branch,
    #[serde(default)]
    #[serde(rename = "else")]
    otherwise: Branch,
}

#[derive(Default)]
pub struct ConditionalExecutor;

#[async_trait]
impl StepExecutor for ConditionalExecutor {
    async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let config: ConditionalConfig = match serde_json::from_value(ctx.step.config.clone()) {
            Ok(c) => c,
            Err(e) => return StepOutcome::Failure { error: format!("invalid conditional config: {e}") },
        };

        if ctx.cancel_token.is_cancelled() {
            return StepOutcome::Cancelled;
        }

        let matched = expr::evaluate(&config.expression, ctx.failure);
        let branch = if matched { config.then } else { config.otherwise };

        let result = match branch {
            Branch::Continue => serde_json::json!({"matched": matched, "action": "continue"}),
            Branch::Skip { count } => serde_json::json!({"matched": matched, "action": "skip", "count": count}),
            Branch::Stop => serde_json::json!({"matched": matched, "action": "stop"}),
        };

        StepOutcome::Success { result, external_id: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewPaymentFailure, StepType, SyncSource, WorkflowStep};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tokio_util::sync::CancellationToken;

    fn failure(amount: &str) -> crate::model::PaymentFailure {
        crate::model::PaymentFailure::new(NewPaymentFailure {
            provider_id: "cardnet".into(),
            provider_event_id: "evt_1".into(),
            provider_event_type: "t".into(),
            company_id: "c1".into(),
            amount: amount.parse::<Decimal>().unwrap(),
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

    fn step() -> WorkflowStep {
        WorkflowStep {
            step_order: 0,
            step_type: StepType::Conditional,
            config: serde_json::json!({
                "if": {"conditions": [{"field": "amount", "operator": "gte", "value": 1000}], "logic": "AND"},
                "then": {"action": "stop"},
                "else": {"action": "continue"},
            }),
            conditions: None,
            delay_seconds: 0,
            is_parallel: false,
            is_critical: false,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn matched_branch_reports_configured_action() {
        let executor = ConditionalExecutor;
        let f = failure("2500.00");
        let step = step();
        let token = CancellationToken::new();
        let ctx = StepContext { failure: &f, step: &step, cancel_token: &token };

        match executor.execute(&ctx).await {
            StepOutcome::Success { result, .. } => assert_eq!(result["action"], "stop"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmatched_branch_falls_through_to_else() {
        let executor = ConditionalExecutor;
        let f = failure("5.00");
        let step = step();
        let token = CancellationToken::new();
        let ctx = StepContext { failure: &f, step: &step, cancel_token: &token };

        match executor.execute(&ctx).await {
            StepOutcome::Success { result, .. } => assert_eq!(result["action"], "continue"),
            other => panic!("expected success, got {other:?}"),
        }
    }
}
