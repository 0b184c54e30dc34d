//! # Event Envelope
//!
//! Wire-level envelope for every message carried by the bus.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: One envelope struct for every topic
//! 2. **Validation**: Centralized envelope validation logic
//! 3. **Versioning**: `metadata.version` allows a producer to evolve its payload shape
//! 4. **Tracing**: `correlation_id`/`causation_id` thread a business transaction across topics
//!
//! ## Envelope Fields
//!
//! - `event_id`: Unique identifier for idempotency
//! - `event_type`: The producer-assigned tag for the payload shape (e.g. `"payment.failure.detected"`)
//! - `timestamp`: RFC 3339 timestamp when the event was generated
//! - `company_id`: Tenant isolation
//! - `metadata.source` / `metadata.version`: producing module and its semantic version
//! - `metadata.risk_score` / `metadata.priority`: set once the Event Processor has scored the failure
//! - `correlation_id` / `causation_id`: link related events in a business transaction
//! - `payload`: event-specific data (generic type parameter)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata carried alongside every envelope, independent of payload shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventMetadata {
    /// Module that generated the event (e.g. "mediator.cardnet", "processor", "orchestrator").
    pub source: String,

    /// Semantic version of the source module.
    pub version: String,

    /// Present once the Event Processor has scored the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<u8>,

    /// Present once the Event Processor has scored the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// Standard event envelope following the platform event contract.
///
/// This envelope wraps all events published across topic boundaries. It
/// provides the metadata needed for idempotency, tracing, and multi-tenancy.
///
/// # Type Parameter
///
/// * `T` - The event-specific payload type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event identifier (idempotency key).
    pub event_id: Uuid,

    /// Producer-assigned tag identifying the payload shape.
    pub event_type: String,

    /// RFC 3339 timestamp when the event was generated.
    pub timestamp: DateTime<Utc>,

    /// Tenant identifier for multi-tenant isolation.
    pub company_id: String,

    /// Links related events in a business transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Links this event to the command/event that caused it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Producer and scoring metadata.
    pub metadata: EventMetadata,

    /// Event-specific payload.
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create a new envelope with an auto-generated `event_id` and current timestamp.
    pub fn new(event_type: impl Into<String>, company_id: impl Into<String>, source: impl Into<String>, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            company_id: company_id.into(),
            correlation_id: None,
            causation_id: None,
            metadata: EventMetadata {
                source: source.into(),
                version: "1.0.0".to_string(),
                risk_score: None,
                priority: None,
            },
            payload,
        }
    }

    /// Create an envelope with an explicit `event_id` (useful for tests and redelivery).
    pub fn with_event_id(event_id: Uuid, event_type: impl Into<String>, company_id: impl Into<String>, source: impl Into<String>, payload: T) -> Self {
        let mut envelope = Self::new(event_type, company_id, source, payload);
        envelope.event_id = event_id;
        envelope
    }

    pub fn with_source_version(mut self, version: impl Into<String>) -> Self {
        self.metadata.version = version.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    pub fn with_risk(mut self, risk_score: u8, priority: impl Into<String>) -> Self {
        self.metadata.risk_score = Some(risk_score);
        self.metadata.priority = Some(priority.into());
        self
    }
}

/// Validate an envelope's required fields (generic payload, read as raw JSON).
///
/// # Errors
///
/// Returns a descriptive error string if a required field is missing, empty,
/// or of the wrong JSON type. Used by consumers to route un-decodable
/// messages to the poison topic instead of crashing the handler.
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let event_id = envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;
    Uuid::parse_str(event_id).map_err(|_| format!("event_id is not a valid UUID: '{event_id}'"))?;

    let timestamp = envelope
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp")?;
    DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| format!("timestamp is not RFC 3339: '{timestamp}'"))?;

    let company_id = envelope
        .get("company_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid company_id")?;
    if company_id.is_empty() {
        return Err("company_id cannot be empty".to_string());
    }

    let event_type = envelope
        .get("event_type")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_type")?;
    if event_type.is_empty() {
        return Err("event_type cannot be empty".to_string());
    }

    match envelope.get("payload") {
        Some(v) if v.is_object() || v.is_null() => {}
        Some(_) => return Err("payload must be a JSON object".to_string()),
        None => return Err("Missing required field: payload".to_string()),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_creation() {
        let envelope = EventEnvelope::new(
            "payment.failure.detected",
            "company-123",
            "mediator.cardnet",
            json!({"test": "data"}),
        );

        assert_eq!(envelope.company_id, "company-123");
        assert_eq!(envelope.metadata.source, "mediator.cardnet");
        assert!(envelope.correlation_id.is_none());
        assert!(envelope.metadata.risk_score.is_none());
    }

    #[test]
    fn test_envelope_with_builder() {
        let envelope = EventEnvelope::new(
            "payment.failure.processed",
            "company-123",
            "processor",
            json!({"test": "data"}),
        )
        .with_source_version("1.2.3")
        .with_correlation_id(Some("corr-456".to_string()))
        .with_risk(70, "high");

        assert_eq!(envelope.metadata.version, "1.2.3");
        assert_eq!(envelope.correlation_id, Some("corr-456".to_string()));
        assert_eq!(envelope.metadata.risk_score, Some(70));
        assert_eq!(envelope.metadata.priority.as_deref(), Some("high"));
    }

    #[test]
    fn test_validate_envelope_fields_valid() {
        let envelope = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "event_type": "payment.failure.detected",
            "timestamp": "2026-01-01T00:00:00Z",
            "company_id": "company-123",
            "payload": {}
        });

        assert!(validate_envelope_fields(&envelope).is_ok());
    }

    #[test]
    fn test_validate_envelope_fields_missing_company_id() {
        let envelope = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "event_type": "payment.failure.detected",
            "timestamp": "2026-01-01T00:00:00Z",
            "payload": {}
        });

        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_validate_envelope_fields_bad_timestamp() {
        let envelope = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "event_type": "payment.failure.detected",
            "timestamp": "not-a-timestamp",
            "company_id": "company-123",
            "payload": {}
        });

        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_validate_envelope_fields_non_object_payload() {
        let envelope = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "event_type": "payment.failure.detected",
            "timestamp": "2026-01-01T00:00:00Z",
            "company_id": "company-123",
            "payload": "not-an-object"
        });

        assert!(validate_envelope_fields(&envelope).is_err());
    }
}
