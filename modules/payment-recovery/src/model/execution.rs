//! Runtime state of one workflow run against one payment failure.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One attempt of one step inside an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_order: i32,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: serde_json::Value,
    pub error_message: Option<String>,
    pub external_id: Option<String>,
}

impl StepExecution {
    pub fn new(execution_id: Uuid, step_order: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_order,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            result: serde_json::Value::Null,
            error_message: None,
            external_id: None,
        }
    }
}

/// Append-only context shared by every step in an execution, keyed by the
/// id of the step that produced each value. Parallel steps may write
/// concurrently but never to the same key twice — see
/// [`ExecutionContext::insert`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    values: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a step-produced value. Fails rather than silently overwriting
    /// if `key` was already written — the append-only invariant from §9 is
    /// enforced here, not left to caller discipline.
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<(), ModelError> {
        let key = key.into();
        if self.values.contains_key(&key) {
            return Err(ModelError::ContextKeyCollision(key));
        }
        self.values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }
}

/// Runtime instance of one `(workflow, payment_failure)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub payment_failure_id: Uuid,
    pub status: ExecutionStatus,
    pub current_step_index: usize,
    pub completed: u32,
    pub successful: u32,
    pub failed: u32,
    pub skipped: u32,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub context: ExecutionContext,
    pub retry_count: u32,
    pub last_error: Option<String>,

    /// Lifecycle-bound cancel token. Not serialized: it is reconstructed
    /// fresh whenever an execution is loaded back into memory, since a
    /// cancellation signal has no meaning across a process restart.
    #[serde(skip, default = "CancellationToken::new")]
    pub cancel_token: CancellationToken,
}

impl WorkflowExecution {
    pub fn new(workflow_id: Uuid, payment_failure_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            payment_failure_id,
            status: ExecutionStatus::Pending,
            current_step_index: 0,
            completed: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            started_at: Utc::now(),
            paused_at: None,
            completed_at: None,
            context: ExecutionContext::new(),
            retry_count: 0,
            last_error: None,
        }
    }

    /// Counter invariant from §8: `completed = successful + failed + skipped`.
    pub fn counters_consistent(&self) -> bool {
        self.completed == self.successful + self.failed + self.skipped
    }

    pub fn record_success(&mut self) {
        self.successful += 1;
        self.completed += 1;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.failed += 1;
        self.completed += 1;
        self.last_error = Some(error.into());
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
        self.completed += 1;
    }

    pub fn pause(&mut self) -> Result<(), ModelError> {
        if self.status != ExecutionStatus::Running {
            return Err(ModelError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: "Paused".into(),
            });
        }
        self.cancel_token.cancel();
        self.status = ExecutionStatus::Paused;
        self.paused_at = Some(Utc::now());
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), ModelError> {
        if self.status != ExecutionStatus::Paused {
            return Err(ModelError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: "Running".into(),
            });
        }
        self.cancel_token = CancellationToken::new();
        self.paused_at = None;
        self.status = ExecutionStatus::Running;
        Ok(())
    }

    pub fn cancel(&mut self) {
        self.cancel_token.cancel();
        self.status = ExecutionStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.last_error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }
}

/// Wait duration assembled from a step's `{wait_days, wait_hours, wait_minutes}`
/// config, floored at one minute per §4.4.
pub fn wait_duration(wait_days: i64, wait_hours: i64, wait_minutes: i64) -> Duration {
    let total_minutes = wait_days * 24 * 60 + wait_hours * 60 + wait_minutes;
    Duration::from_secs((total_minutes.max(1) * 60) as u64)
}
