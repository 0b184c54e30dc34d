//! Payment failure detection, risk scoring, and automated recovery
//! orchestration: canonical domain model, provider mediators, a rule
//! engine, an enrichment/scoring processor, and a step-based orchestration
//! engine, wired together over the durable event bus in [`event_bus`].

pub mod collaborators;
pub mod config;
pub mod error;
pub mod expr;
pub mod mediators;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod processor;
pub mod rules;
