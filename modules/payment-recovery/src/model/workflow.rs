//! Tenant-scoped workflow templates and their ordered steps.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;
use crate::expr::Expression;

/// One of the step kinds an executor is registered for. Unknown tags decode
/// into `Other` rather than failing deserialization, so a workflow authored
/// against a newer step catalogue doesn't poison the whole record — the
/// orchestrator reports `UnregisteredExecutor` for it at dispatch time instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    RetryPayment,
    SendEmail,
    SendSms,
    Wait,
    Conditional,
    Webhook,
    #[serde(other)]
    Other,
}

impl StepType {
    /// Registry key used by the orchestrator's [`crate::orchestrator::executors::ExecutorRegistry`].
    pub fn tag(&self) -> &'static str {
        match self {
            StepType::RetryPayment => "retry_payment",
            StepType::SendEmail => "send_email",
            StepType::SendSms => "send_sms",
            StepType::Wait => "wait",
            StepType::Conditional => "conditional",
            StepType::Webhook => "webhook",
            StepType::Other => "other",
        }
    }
}

/// One unit of work inside a [`Workflow`]. Owned exclusively by its workflow;
/// there is no cross-workflow sharing of step definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_order: i32,
    pub step_type: StepType,
    pub config: serde_json::Value,
    pub conditions: Option<Expression>,
    pub delay_seconds: i64,
    pub is_parallel: bool,
    pub is_critical: bool,
    pub is_active: bool,
}

/// A tenant-scoped recovery template: a trigger expression and an ordered
/// list of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub company_id: String,
    pub name: String,
    pub priority: i32,
    pub is_active: bool,
    pub trigger_conditions: Expression,
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    /// Validate the invariants declared in the data model: at least one
    /// step, and unique `step_order` within the workflow.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.steps.is_empty() {
            return Err(ModelError::InvalidWorkflow("workflow must have at least one step".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.step_order) {
                return Err(ModelError::InvalidWorkflow(format!(
                    "duplicate step_order {} in workflow {}",
                    step.step_order, self.id
                )));
            }
        }
        Ok(())
    }

    /// Steps in the order the orchestrator must visit them.
    pub fn ordered_steps(&self) -> Vec<&WorkflowStep> {
        let mut steps: Vec<&WorkflowStep> = self.steps.iter().filter(|s| s.is_active).collect();
        steps.sort_by_key(|s| s.step_order);
        steps
    }
}

/// Sort a batch of candidate workflows by `priority desc`, the order the
/// orchestrator evaluates triggers in.
pub fn sort_by_priority_desc(workflows: &mut [Workflow]) {
    workflows.sort_by(|a, b| b.priority.cmp(&a.priority));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expression;

    fn step(order: i32) -> WorkflowStep {
        WorkflowStep {
            step_order: order,
            step_type: StepType::Wait,
            config: serde_json::json!({}),
            conditions: None,
            delay_seconds: 0,
            is_parallel: false,
            is_critical: false,
            is_active: true,
        }
    }

    #[test]
    fn rejects_empty_step_list() {
        let wf = Workflow {
            id: Uuid::new_v4(),
            company_id: "c1".into(),
            name: "empty".into(),
            priority: 1,
            is_active: true,
            trigger_conditions: Expression::default(),
            steps: vec![],
        };
        assert!(wf.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_step_order() {
        let wf = Workflow {
            id: Uuid::new_v4(),
            company_id: "c1".into(),
            name: "dup".into(),
            priority: 1,
            is_active: true,
            trigger_conditions: Expression::default(),
            steps: vec![step(0), step(0)],
        };
        assert!(wf.validate().is_err());
    }

    #[test]
    fn priority_sort_is_descending() {
        let mut workflows = vec![
            Workflow {
                id: Uuid::new_v4(),
                company_id: "c1".into(),
                name: "low".into(),
                priority: 10,
                is_active: true,
                trigger_conditions: Expression::default(),
                steps: vec![step(0)],
            },
            Workflow {
                id: Uuid::new_v4(),
                company_id: "c1".into(),
                name: "high".into(),
                priority: 100,
                is_active: true,
                trigger_conditions: Expression::default(),
                steps: vec![step(0)],
            },
        ];
        sort_by_priority_desc(&mut workflows);
        assert_eq!(workflows[0].name, "high");
    }
}
