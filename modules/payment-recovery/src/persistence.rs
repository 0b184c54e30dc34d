//! `PersistenceFacade`: the storage contract shaped by the §6 table layout,
//! with an in-memory reference implementation that plays the same role for
//! this crate's tests as `InMemoryBus` plays for the event bus. Schema
//! migrations and a real `sqlx::PgPool`-backed implementation are out of
//! scope for this core.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ModelError;
use crate::model::{PaymentFailure, StepExecution, Workflow, WorkflowExecution};

/// One method group per §6 table: `payment_failure_events`,
/// `recovery_workflows` (+ steps, folded into `Workflow`),
/// `recovery_workflow_executions`, `recovery_step_executions`.
#[async_trait]
pub trait PersistenceFacade: Send + Sync {
    /// Insert or update a `PaymentFailure`, enforcing the unique
    /// `(provider_id, provider_event_id)` constraint at the identity level.
    async fn upsert_payment_failure(&self, failure: PaymentFailure) -> anyhow::Result<PaymentFailure>;
    async fn find_payment_failure_by_identity(
        &self,
        provider_id: &str,
        provider_event_id: &str,
    ) -> anyhow::Result<Option<PaymentFailure>>;
    async fn get_payment_failure(&self, id: Uuid) -> anyhow::Result<Option<PaymentFailure>>;

    async fn active_workflows_for_tenant(&self, company_id: &str) -> anyhow::Result<Vec<Workflow>>;
    async fn get_workflow(&self, id: Uuid) -> anyhow::Result<Option<Workflow>>;
    async fn put_workflow(&self, workflow: Workflow) -> anyhow::Result<()>;

    /// Create an execution, enforcing the unique `(workflow_id,
    /// payment_failure_id)` key from §5's idempotency requirement. Returns
    /// `Ok(None)` rather than an error when the key already exists, so
    /// callers can treat redelivery as a no-op.
    async fn create_execution_if_absent(
        &self,
        execution: WorkflowExecution,
    ) -> anyhow::Result<Option<WorkflowExecution>>;
    async fn get_execution(&self, id: Uuid) -> anyhow::Result<Option<WorkflowExecution>>;
    /// Look up an execution by its `(workflow_id, payment_failure_id)`
    /// uniqueness key directly, for callers (operator tooling, tests) that
    /// don't already hold the execution id.
    async fn find_execution_by_workflow_and_failure(&self, workflow_id: Uuid, payment_failure_id: Uuid) -> anyhow::Result<Option<WorkflowExecution>>;
    async fn save_execution(&self, execution: WorkflowExecution) -> anyhow::Result<()>;

    async fn append_step_execution(&self, step_execution: StepExecution) -> anyhow::Result<()>;
    async fn step_executions_for(&self, execution_id: Uuid) -> anyhow::Result<Vec<StepExecution>>;
}

#[derive(Default)]
struct Store {
    failures_by_id: HashMap<Uuid, PaymentFailure>,
    failures_by_identity: HashMap<(String, String), Uuid>,
    workflows: HashMap<Uuid, Workflow>,
    executions: HashMap<Uuid, WorkflowExecution>,
    execution_keys: HashMap<(Uuid, Uuid), Uuid>,
    step_executions: HashMap<Uuid, Vec<StepExecution>>,
}

/// In-memory `PersistenceFacade`. All state lives behind one `RwLock`;
/// reads never cross an `.await` boundary with the lock held, matching the
/// shared-resource policy in §5.
#[derive(Default)]
pub struct InMemoryPersistence {
    store: RwLock<Store>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceFacade for InMemoryPersistence {
    async fn upsert_payment_failure(&self, failure: PaymentFailure) -> anyhow::Result<PaymentFailure> {
        let mut store = self.store.write().unwrap();
        let identity = (failure.provider_id.clone(), failure.provider_event_id.clone());

        if let Some(&existing_id) = store.failures_by_identity.get(&identity) {
            // Redelivery of a known event: merge onto the persisted copy
            // rather than creating a second row, preserving §8's
            // at-most-once-per-identity invariant under redelivery.
            let mut merged = failure;
            merged.id = existing_id;
            store.failures_by_id.insert(existing_id, merged.clone());
            return Ok(merged);
        }

        store.failures_by_identity.insert(identity, failure.id);
        store.failures_by_id.insert(failure.id, failure.clone());
        Ok(failure)
    }

    async fn find_payment_failure_by_identity(
        &self,
        provider_id: &str,
        provider_event_id: &str,
    ) -> anyhow::Result<Option<PaymentFailure>> {
        let store = self.store.read().unwrap();
        let key = (provider_id.to_string(), provider_event_id.to_string());
        Ok(store.failures_by_identity.get(&key).and_then(|id| store.failures_by_id.get(id)).cloned())
    }

    async fn get_payment_failure(&self, id: Uuid) -> anyhow::Result<Option<PaymentFailure>> {
        Ok(self.store.read().unwrap().failures_by_id.get(&id).cloned())
    }

    async fn active_workflows_for_tenant(&self, company_id: &str) -> anyhow::Result<Vec<Workflow>> {
        let store = self.store.read().unwrap();
        let mut workflows: Vec<Workflow> =
            store.workflows.values().filter(|w| w.company_id == company_id && w.is_active).cloned().collect();
        crate::model::sort_by_priority_desc(&mut workflows);
        Ok(workflows)
    }

    async fn get_workflow(&self, id: Uuid) -> anyhow::Result<Option<Workflow>> {
        Ok(self.store.read().unwrap().workflows.get(&id).cloned())
    }

    async fn put_workflow(&self, workflow: Workflow) -> anyhow::Result<()> {
        workflow.validate().map_err(|e: ModelError| anyhow::anyhow!(e))?;
        self.store.write().unwrap().workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn create_execution_if_absent(
        &self,
        execution: WorkflowExecution,
    ) -> anyhow::Result<Option<WorkflowExecution>> {
        let mut store = self.store.write().unwrap();
        let key = (execution.workflow_id, execution.payment_failure_id);
        if store.execution_keys.contains_key(&key) {
            return Ok(None);
        }
        store.execution_keys.insert(key, execution.id);
        store.executions.insert(execution.id, execution.clone());
        Ok(Some(execution))
    }

    async fn get_execution(&self, id: Uuid) -> anyhow::Result<Option<WorkflowExecution>> {
        Ok(self.store.read().unwrap().executions.get(&id).cloned())
    }

    async fn find_execution_by_workflow_and_failure(&self, workflow_id: Uuid, payment_failure_id: Uuid) -> anyhow::Result<Option<WorkflowExecution>> {
        let store = self.store.read().unwrap();
        let key = (workflow_id, payment_failure_id);
        Ok(store.execution_keys.get(&key).and_then(|id| store.executions.get(id)).cloned())
    }

    async fn save_execution(&self, execution: WorkflowExecution) -> anyhow::Result<()> {
        self.store.write().unwrap().executions.insert(execution.id, execution);
        Ok(())
    }

    async fn append_step_execution(&self, step_execution: StepExecution) -> anyhow::Result<()> {
        let mut store = self.store.write().unwrap();
        store.step_executions.entry(step_execution.execution_id).or_default().push(step_execution);
        Ok(())
    }

    async fn step_executions_for(&self, execution_id: Uuid) -> anyhow::Result<Vec<StepExecution>> {
        Ok(self.store.read().unwrap().step_executions.get(&execution_id).cloned().unwrap_or_default())
    }
}
