//! Step Executors (C7): one implementation per `step_type`, dispatched by a
//! string-keyed registry — a tagged-variant representation generalized to
//! the open-ended extension point §9 asks for (new executors register
//! themselves rather than requiring a source-level enum match).

mod conditional;
mod retry_payment;
mod send_email;
mod send_sms;
mod wait;
mod webhook;

pub use conditional::ConditionalExecutor;
pub use retry_payment::RetryPaymentExecutor;
pub use send_email::SendEmailExecutor;
pub use send_sms::SendSmsExecutor;
pub use wait::WaitExecutor;
pub use webhook::WebhookExecutor;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{PaymentFailure, WorkflowStep};

/// Everything a step executor needs, without exposing the orchestrator's
/// internal execution-map lock.
pub struct StepContext<'a> {
    pub failure: &'a PaymentFailure,
    pub step: &'a WorkflowStep,
    pub cancel_token: &'a CancellationToken,
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success { result: serde_json::Value, external_id: Option<String> },
    Failure { error: String },
    /// First-class cancellation, distinct from `Failure` per §7: callers
    /// convert it to a step failure without marking the execution failed
    /// unless the step was critical.
    Cancelled,
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome;
}

/// Registry mapping `step_type` tags to executors. Unknown tags dispatch to
/// nothing and the orchestrator reports `UnregisteredExecutor` itself,
/// matching §4.4's "unknown step_type" handling.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step_type: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(step_type.into(), executor);
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_type).cloned()
    }
}
