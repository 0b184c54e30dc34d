//! Orchestration Engine (C6): selects workflows for a processed failure,
//! runs each as an independent, cancellable execution bounded by a counting
//! semaphore, and exposes `pause`/`resume`/`cancel` for operator control.

pub mod executors;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::expr;
use crate::model::{ExecutionStatus, PaymentFailure, StepExecution, StepStatus, StepType, Workflow, WorkflowExecution, WorkflowStep};
use crate::persistence::PersistenceFacade;
use executors::{ExecutorRegistry, StepContext, StepOutcome};

/// How a completed step tells the orchestrator to move the step cursor.
/// Only the `conditional` executor's result carries this; every other step
/// implicitly asks for `Continue`.
#[derive(Debug, Clone, Copy)]
enum CursorMove {
    Continue,
    Skip(usize),
    Stop,
}

fn cursor_move_for(step_type: &StepType, result: &serde_json::Value) -> CursorMove {
    if *step_type != StepType::Conditional {
        return CursorMove::Continue;
    }
    match result.get("action").and_then(|v| v.as_str()) {
        Some("stop") => CursorMove::Stop,
        Some("skip") => CursorMove::Skip(result.get("count").and_then(|v| v.as_u64()).unwrap_or(0) as usize),
        _ => CursorMove::Continue,
    }
}

/// Tracks the cancel token of every execution currently running in this
/// process, guarded by one lock held only for map mutations (§5) — never
/// across an `.await`.
type ActiveMap = Mutex<HashMap<Uuid, CancellationToken>>;

pub struct Orchestrator {
    persistence: Arc<dyn PersistenceFacade>,
    registry: Arc<ExecutorRegistry>,
    semaphore: Arc<Semaphore>,
    active: Arc<ActiveMap>,
}

impl Orchestrator {
    pub fn new(persistence: Arc<dyn PersistenceFacade>, registry: Arc<ExecutorRegistry>, max_concurrent_executions: u32) -> Arc<Self> {
        Arc::new(Self {
            persistence,
            registry,
            semaphore: Arc::new(Semaphore::new(max_concurrent_executions as usize)),
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Entry point for a `payment.failure.processed` event: every active
    /// workflow whose trigger matches produces one independent execution.
    /// Returns the ids of the executions actually created (an empty vec if
    /// nothing matched, or if every match was already running — both are
    /// not errors).
    pub async fn handle_processed_failure(self: &Arc<Self>, failure: PaymentFailure) -> Result<Vec<Uuid>, OrchestratorError> {
        let workflows = self.persistence.active_workflows_for_tenant(&failure.company_id).await.map_err(|e| OrchestratorError::TransientStoreError(e.to_string()))?;

        let mut started = Vec::new();
        for workflow in workflows.into_iter().filter(|w| expr::evaluate(&w.trigger_conditions, &failure)) {
            if let Some(execution_id) = self.start_execution(workflow, failure.clone()).await? {
                started.push(execution_id);
            }
        }
        Ok(started)
    }

    async fn start_execution(self: &Arc<Self>, workflow: Workflow, failure: PaymentFailure) -> Result<Option<Uuid>, OrchestratorError> {
        let execution = WorkflowExecution::new(workflow.id, failure.id);
        let Some(execution) = self
            .persistence
            .create_execution_if_absent(execution)
            .await
            .map_err(|e| OrchestratorError::TransientStoreError(e.to_string()))?
        else {
            return Ok(None);
        };

        let execution_id = execution.id;
        self.active.lock().await.insert(execution_id, execution.cancel_token.clone());

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.run_execution(workflow, failure, execution).await });

        Ok(Some(execution_id))
    }

    pub async fn pause(self: &Arc<Self>, execution_id: Uuid) -> Result<(), OrchestratorError> {
        let mut execution = self.load_execution(execution_id).await?;
        execution.pause().map_err(|_| OrchestratorError::NotPaused(execution_id))?;
        self.persistence.save_execution(execution).await.map_err(|e| OrchestratorError::TransientStoreError(e.to_string()))?;
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>, execution_id: Uuid) -> Result<(), OrchestratorError> {
        let mut execution = self.load_execution(execution_id).await?;
        execution.resume().map_err(|_| OrchestratorError::NotPaused(execution_id))?;

        let workflow = self
            .persistence
            .get_workflow(execution.workflow_id)
            .await
            .map_err(|e| OrchestratorError::TransientStoreError(e.to_string()))?
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))?;
        let failure = self
            .persistence
            .get_payment_failure(execution.payment_failure_id)
            .await
            .map_err(|e| OrchestratorError::TransientStoreError(e.to_string()))?
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))?;

        self.persistence.save_execution(execution.clone()).await.map_err(|e| OrchestratorError::TransientStoreError(e.to_string()))?;
        self.active.lock().await.insert(execution_id, execution.cancel_token.clone());

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.run_execution(workflow, failure, execution).await });
        Ok(())
    }

    pub async fn cancel(self: &Arc<Self>, execution_id: Uuid) -> Result<(), OrchestratorError> {
        let mut execution = self.load_execution(execution_id).await?;
        execution.cancel();
        self.persistence.save_execution(execution).await.map_err(|e| OrchestratorError::TransientStoreError(e.to_string()))?;
        self.active.lock().await.remove(&execution_id);
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, OrchestratorError> {
        self.persistence
            .get_execution(execution_id)
            .await
            .map_err(|e| OrchestratorError::TransientStoreError(e.to_string()))?
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))
    }

    /// Runs one execution to a terminal state (or until paused). Holds one
    /// semaphore permit for its whole lifetime — that is the bounded-pool
    /// admission the spec describes.
    async fn run_execution(self: Arc<Self>, workflow: Workflow, failure: PaymentFailure, mut execution: WorkflowExecution) {
        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        execution.status = ExecutionStatus::Running;
        if let Err(e) = self.persistence.save_execution(execution.clone()).await {
            tracing::error!(execution_id = %execution.id, error = %e, "failed to persist running execution");
            return;
        }

        let steps = workflow.ordered_steps();
        let mut index = execution.current_step_index;
        let mut halted_non_running = false;

        'outer: while index < steps.len() {
            if execution.cancel_token.is_cancelled() {
                halted_non_running = true;
                break;
            }

            let mut block_end = index + 1;
            if steps[index].is_parallel {
                while block_end < steps.len() && steps[block_end].is_parallel {
                    block_end += 1;
                }
            }

            if block_end - index > 1 {
                let outcomes = self.run_parallel_block(&failure, &steps[index..block_end], &execution).await;
                for (step, outcome) in steps[index..block_end].iter().zip(outcomes) {
                    if self.apply_outcome(&mut execution, step, outcome).await.is_break() {
                        break 'outer;
                    }
                }
                index = block_end;
                continue;
            }

            let step = steps[index];
            if step.delay_seconds > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(step.delay_seconds as u64)) => {}
                    _ = execution.cancel_token.cancelled() => { halted_non_running = true; break 'outer; }
                }
            }

            let outcome = self.dispatch(&failure, step, &execution.cancel_token).await;
            if matches!(outcome, StepOutcome::Cancelled) {
                halted_non_running = true;
                break 'outer;
            }

            let cursor = match &outcome {
                StepOutcome::Success { result, .. } => cursor_move_for(&step.step_type, result),
                StepOutcome::Failure { .. } => CursorMove::Continue,
                StepOutcome::Cancelled => unreachable!(),
            };

            if self.apply_outcome(&mut execution, step, outcome).await.is_break() {
                break 'outer;
            }

            index = match cursor {
                CursorMove::Continue => index + 1,
                CursorMove::Skip(count) => (index + 1 + count).min(steps.len()),
                CursorMove::Stop => {
                    execution.complete();
                    break 'outer;
                }
            };
        }

        if halted_non_running {
            // `pause`/`cancel` already wrote the authoritative status
            // concurrently with this loop; only the reached cursor is ours
            // to persist, merged onto whatever they left behind.
            match self.persistence.get_execution(execution.id).await {
                Ok(Some(mut persisted)) => {
                    persisted.current_step_index = index;
                    if let Err(e) = self.persistence.save_execution(persisted).await {
                        tracing::error!(execution_id = %execution.id, error = %e, "failed to persist halted execution cursor");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!(execution_id = %execution.id, error = %e, "failed to reload halted execution"),
            }
        } else {
            execution.current_step_index = index;
            if execution.status == ExecutionStatus::Running {
                execution.complete();
            }
            if let Err(e) = self.persistence.save_execution(execution.clone()).await {
                tracing::error!(execution_id = %execution.id, error = %e, "failed to persist final execution state");
            }
        }
        self.active.lock().await.remove(&execution.id);
    }

    async fn run_parallel_block(&self, failure: &PaymentFailure, block: &[&WorkflowStep], execution: &WorkflowExecution) -> Vec<StepOutcome> {
        let token = execution.cancel_token.clone();
        let step_futures = block.iter().map(|step| self.dispatch(failure, step, &token));
        futures::future::join_all(step_futures).await
    }

    async fn dispatch(&self, failure: &PaymentFailure, step: &WorkflowStep, cancel_token: &CancellationToken) -> StepOutcome {
        let Some(executor) = self.registry.get(step.step_type.tag()) else {
            return StepOutcome::Failure { error: format!("no executor registered for step type {}", step.step_type.tag()) };
        };
        let ctx = StepContext { failure, step, cancel_token };
        executor.execute(&ctx).await
    }

    /// Records a [`StepExecution`] row, updates the execution's counters and
    /// context, and tells the caller whether a critical failure means the
    /// outer loop must stop. `std::ops::ControlFlow` keeps that signal
    /// explicit instead of a bare bool.
    async fn apply_outcome(&self, execution: &mut WorkflowExecution, step: &WorkflowStep, outcome: StepOutcome) -> std::ops::ControlFlow<()> {
        let mut step_execution = StepExecution::new(execution.id, step.step_order);
        step_execution.started_at = Some(chrono::Utc::now());
        step_execution.completed_at = Some(chrono::Utc::now());

        let control = match outcome {
            StepOutcome::Success { result, external_id } => {
                let key = format!("step_{}", step.step_order);
                match execution.context.insert(key, result.clone()) {
                    Ok(()) => {
                        step_execution.status = StepStatus::Completed;
                        step_execution.external_id = external_id;
                        step_execution.result = result;
                        execution.record_success();
                        std::ops::ControlFlow::Continue(())
                    }
                    Err(e) => {
                        let error = e.to_string();
                        step_execution.status = StepStatus::Failed;
                        step_execution.error_message = Some(error.clone());
                        execution.record_failure(error.clone());
                        execution.fail(error);
                        std::ops::ControlFlow::Break(())
                    }
                }
            }
            StepOutcome::Failure { error } => {
                step_execution.status = StepStatus::Failed;
                step_execution.error_message = Some(error.clone());
                execution.record_failure(error.clone());
                if step.is_critical {
                    execution.fail(error);
                    std::ops::ControlFlow::Break(())
                } else {
                    std::ops::ControlFlow::Continue(())
                }
            }
            StepOutcome::Cancelled => {
                step_execution.status = StepStatus::Skipped;
                execution.record_skip();
                std::ops::ControlFlow::Continue(())
            }
        };

        if let Err(e) = self.persistence.append_step_execution(step_execution).await {
            tracing::error!(execution_id = %execution.id, error = %e, "failed to persist step execution");
        }

        control
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryCommunicationDispatcher, InMemoryRetrySubmitter};
    use crate::expr::Expression;
    use crate::model::{NewPaymentFailure, SyncSource};
    use crate::persistence::InMemoryPersistence;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::time::Duration as StdDuration;

    fn registry() -> Arc<ExecutorRegistry> {
        let mut registry = ExecutorRegistry::new();
        registry.register("wait", Arc::new(executors::WaitExecutor));
        registry.register("retry_payment", Arc::new(executors::RetryPaymentExecutor::new(Arc::new(InMemoryRetrySubmitter::new()))));
        registry.register("send_email", Arc::new(executors::SendEmailExecutor::new(Arc::new(InMemoryCommunicationDispatcher::default()))));
        registry.register("conditional", Arc::new(executors::ConditionalExecutor));
        Arc::new(registry)
    }

    fn failure(company_id: &str) -> PaymentFailure {
        PaymentFailure::new(NewPaymentFailure {
            provider_id: "cardnet".into(),
            provider_event_id: "evt_1".into(),
            provider_event_type: "t".into(),
            company_id: company_id.into(),
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

    fn step(order: i32, step_type: StepType, config: serde_json::Value, is_critical: bool, is_parallel: bool) -> WorkflowStep {
        WorkflowStep { step_order: order, step_type, config, conditions: None, delay_seconds: 0, is_parallel, is_critical, is_active: true }
    }

    async fn wait_until_terminal(persistence: &Arc<InMemoryPersistence>, execution_id: Uuid) -> WorkflowExecution {
        for _ in 0..200 {
            if let Some(exec) = persistence.get_execution(execution_id).await.unwrap() {
                if exec.status.is_terminal() {
                    return exec;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("execution never reached a terminal state");
    }

    #[tokio::test]
    async fn matching_workflow_completes_all_steps() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let orchestrator = Orchestrator::new(persistence.clone(), registry(), 10);

        let workflow = Workflow {
            id: Uuid::new_v4(),
            company_id: "company-1".into(),
            name: "card_decline_recovery".into(),
            priority: 10,
            is_active: true,
            trigger_conditions: Expression::default(),
            steps: vec![
                step(0, StepType::RetryPayment, serde_json::json!({"provider": "cardnet", "retry_reason": "card_declined"}), true, false),
                step(1, StepType::Wait, serde_json::json!({"wait_minutes": 0}), false, false),
            ],
        };
        persistence.put_workflow(workflow).await.unwrap();

        let ids = orchestrator.handle_processed_failure(failure("company-1")).await.unwrap();
        assert_eq!(ids.len(), 1);

        let exec = wait_until_terminal(&persistence, ids[0]).await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.successful, 2);
    }

    #[tokio::test]
    async fn critical_step_failure_halts_execution() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let orchestrator = Orchestrator::new(persistence.clone(), registry(), 10);

        let workflow = Workflow {
            id: Uuid::new_v4(),
            company_id: "company-2".into(),
            name: "broken".into(),
            priority: 10,
            is_active: true,
            trigger_conditions: Expression::default(),
            steps: vec![
                step(0, StepType::Webhook, serde_json::json!({"url": "not-registered"}), true, false),
                step(1, StepType::Wait, serde_json::json!({"wait_minutes": 0}), false, false),
            ],
        };
        persistence.put_workflow(workflow).await.unwrap();

        let ids = orchestrator.handle_processed_failure(failure("company-2")).await.unwrap();
        let exec = wait_until_terminal(&persistence, ids[0]).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.current_step_index, 0);
    }

    #[tokio::test]
    async fn no_matching_workflow_starts_nothing() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let orchestrator = Orchestrator::new(persistence.clone(), registry(), 10);

        let workflow = Workflow {
            id: Uuid::new_v4(),
            company_id: "company-3".into(),
            name: "high_value_only".into(),
            priority: 10,
            is_active: true,
            trigger_conditions: Expression {
                conditions: vec![crate::expr::Condition { field: "amount".into(), operator: crate::expr::Operator::Gte, value: serde_json::json!(1_000_000) }],
                logic: crate::expr::Logic::And,
            },
            steps: vec![step(0, StepType::Wait, serde_json::json!({"wait_minutes": 0}), false, false)],
        };
        persistence.put_workflow(workflow).await.unwrap();

        let ids = orchestrator.handle_processed_failure(failure("company-3")).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn conditional_stop_short_circuits_remaining_steps() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let orchestrator = Orchestrator::new(persistence.clone(), registry(), 10);

        let workflow = Workflow {
            id: Uuid::new_v4(),
            company_id: "company-4".into(),
            name: "stop_on_high_amount".into(),
            priority: 10,
            is_active: true,
            trigger_conditions: Expression::default(),
            steps: vec![
                step(
                    0,
                    StepType::Conditional,
                    serde_json::json!({
                        "if": {"conditions": [{"field": "amount", "operator": "gte", "value": 1000}], "logic": "AND"},
                        "then": {"action": "stop"},
                    }),
                    false,
                    false,
                ),
                step(1, StepType::RetryPayment, serde_json::json!({"provider": "cardnet", "retry_reason": "x"}), true, false),
            ],
        };
        persistence.put_workflow(workflow).await.unwrap();

        let ids = orchestrator.handle_processed_failure(failure("company-4")).await.unwrap();
        let exec = wait_until_terminal(&persistence, ids[0]).await;

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.successful, 1);
    }

    #[tokio::test]
    async fn pause_then_resume_runs_to_completion() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let orchestrator = Orchestrator::new(persistence.clone(), registry(), 10);

        let workflow = Workflow {
            id: Uuid::new_v4(),
            company_id: "company-5".into(),
            name: "slow_wait".into(),
            priority: 10,
            is_active: true,
            trigger_conditions: Expression::default(),
            steps: vec![
                step(0, StepType::Wait, serde_json::json!({"wait_minutes": 60}), false, false),
                step(1, StepType::Wait, serde_json::json!({"wait_minutes": 0}), false, false),
            ],
        };
        persistence.put_workflow(workflow).await.unwrap();

        let ids = orchestrator.handle_processed_failure(failure("company-5")).await.unwrap();
        let execution_id = ids[0];

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        orchestrator.pause(execution_id).await.unwrap();

        let paused = persistence.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);

        orchestrator.resume(execution_id).await.unwrap();
        let exec = wait_until_terminal(&persistence, execution_id).await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }
}
