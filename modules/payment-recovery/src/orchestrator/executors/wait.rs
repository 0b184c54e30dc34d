//! `wait` executor: sleeps for a configured duration, interruptible by
//! the execution's cancel token.

use async_trait::async_trait;
use serde::Deserialize;

use super::{StepContext, StepExecutor, StepOutcome};
use crate::model::wait_duration;

#[derive(Debug, Default, Deserialize)]
struct WaitConfig {
    #[serde(default)]
    wait_days: i64,
    #[serde(default)]
    wait_hours: i64,
    #[serde(default)]
    wait_minutes: i64,
}

#[derive(Default)]
pub struct WaitExecutor;

#[async_trait]
impl StepExecutor for WaitExecutor {
    async fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let config: WaitConfig = match serde_json::from_value(ctx.step.config.clone()) {
            Ok(c) => c,
            Err(e) => return StepOutcome::Failure { error: format!("invalid wait config: {e}") },
        };

        let duration = wait_duration(config.wait_days, config.wait_hours, config.wait_minutes);

        tokio::select! {
            _ = tokio::time::sleep(duration) => StepOutcome::Success { result: serde_json::json!({"waited_secs": duration.as_secs()}), external_id: None },
            _ = ctx.cancel_token.cancelled() => StepOutcome::Cancelled,
        }
    }
}
