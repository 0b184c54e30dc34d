//! Canonical domain model: `PaymentFailure`, `Workflow`, and execution state.

mod execution;
mod payment_failure;
mod workflow;

pub use execution::{wait_duration, ExecutionContext, ExecutionStatus, StepExecution, StepStatus, WorkflowExecution};
pub use payment_failure::{FailureStatus, NewPaymentFailure, PaymentFailure, Priority, SyncSource};
pub use workflow::{sort_by_priority_desc, StepType, Workflow, WorkflowStep};
