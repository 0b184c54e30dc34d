//! Typed error enums per component, one `thiserror` enum each, matching the
//! error kinds enumerated in §7 and the `event_bus::BusError` /
//! `payments-rs` split between library `thiserror` types and binary-level
//! `anyhow::Result`.

use event_bus::BusError;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("context key already written: {0}")]
    ContextKeyCollision(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MediatorError {
    #[error("signature verification failed")]
    InvalidSignature,

    #[error("event timestamp is outside the replay window")]
    Replay,

    #[error("rate limit exceeded, retry after backoff")]
    RateLimited,

    #[error("failed to map provider payload to canonical model: {0}")]
    MappingError(String),

    #[error("failed to decode provider payload: {0}")]
    DecodeError(String),

    #[error("transient provider error: {0}")]
    TransientProviderError(String),

    #[error("oauth error: {0}")]
    OAuthError(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, thiserror::Error)]
pub enum RuleEngineError {
    #[error("unknown field referenced by rule: {0}")]
    UnknownField(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    RuleEngine(#[from] RuleEngineError),

    #[error("transient store error: {0}")]
    TransientStoreError(String),

    #[error("failed to decode event envelope: {0}")]
    DecodeError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("no executor registered for step type {0:?}")]
    UnregisteredExecutor(String),

    #[error("transient store error: {0}")]
    TransientStoreError(String),

    #[error("execution was cancelled")]
    Cancelled,

    #[error("execution {0} not found")]
    ExecutionNotFound(uuid::Uuid),

    #[error("execution {0} is not paused")]
    NotPaused(uuid::Uuid),
}
