//! The canonical `PaymentFailure` record and its forward-only status lifecycle.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;

/// Where a [`PaymentFailure`] was observed: a webhook push or a polling sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    Webhook,
    ApiPoll,
}

/// Coarse risk band derived from `risk_score`. See [`crate::processor::score_risk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=100 => Priority::Critical,
            60..=79 => Priority::High,
            40..=59 => Priority::Medium,
            _ => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

/// Forward-only lifecycle of a [`PaymentFailure`]. Ordinal position in this
/// enum is the only notion of "forward" the model enforces — see
/// [`PaymentFailure::transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    Received,
    Analyzed,
    Alerted,
    RetryScheduled,
    Resolved,
    Failed,
}

/// The canonical, provider-independent record of one failed or overdue payment.
///
/// Identity is `(provider_id, provider_event_id)`; `id` is an opaque surrogate
/// key assigned at construction. Mutation never happens in place — every
/// state change is a total function returning a new, validated record, so a
/// caller holding a stale clone can never corrupt the invariants of the
/// canonical copy held by the processor or persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailure {
    pub id: Uuid,

    pub provider_id: String,
    pub provider_event_id: String,
    pub provider_event_type: String,

    pub company_id: String,

    pub amount: Decimal,
    pub currency: String,

    pub customer_id: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,

    pub failure_reason: String,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub business_category: String,
    pub tags: BTreeSet<String>,

    pub risk_score: u8,
    pub priority: Priority,

    pub occurred_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,

    pub status: FailureStatus,

    pub sync_source: SyncSource,
    pub raw_data: Vec<u8>,
    pub provider_metadata: std::collections::HashMap<String, String>,

    pub retry_count: u32,
}

/// Fields a mediator supplies at detection time; everything risk/priority/
/// status related is assigned by [`PaymentFailure::new`] at its initial
/// value and later owned by the processor.
pub struct NewPaymentFailure {
    pub provider_id: String,
    pub provider_event_id: String,
    pub provider_event_type: String,
    pub company_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub failure_reason: String,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub business_category: String,
    pub occurred_at: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    pub sync_source: SyncSource,
    pub raw_data: Vec<u8>,
    pub provider_metadata: std::collections::HashMap<String, String>,
}

impl PaymentFailure {
    pub fn new(fields: NewPaymentFailure) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_id: fields.provider_id,
            provider_event_id: fields.provider_event_id,
            provider_event_type: fields.provider_event_type,
            company_id: fields.company_id,
            amount: fields.amount,
            currency: fields.currency,
            customer_id: fields.customer_id,
            customer_name: fields.customer_name,
            customer_email: fields.customer_email,
            failure_reason: fields.failure_reason,
            failure_code: fields.failure_code,
            failure_message: fields.failure_message,
            business_category: fields.business_category,
            tags: BTreeSet::new(),
            risk_score: 50,
            priority: Priority::Medium,
            occurred_at: fields.occurred_at,
            detected_at: Utc::now(),
            processed_at: None,
            due_date: fields.due_date,
            status: FailureStatus::Received,
            sync_source: fields.sync_source,
            raw_data: fields.raw_data,
            provider_metadata: fields.provider_metadata,
            retry_count: 0,
        }
    }

    /// Identity used for at-least-once deduplication.
    pub fn identity(&self) -> (&str, &str) {
        (&self.provider_id, &self.provider_event_id)
    }

    /// Move to `target`, rejecting any transition that isn't strictly forward
    /// in the declared enum order, and any transition attempted once the
    /// record is already `Resolved`.
    pub fn transition_to(&mut self, target: FailureStatus) -> Result<(), ModelError> {
        if self.status == FailureStatus::Resolved {
            return Err(ModelError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: format!("{target:?}"),
            });
        }
        if target <= self.status {
            return Err(ModelError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: format!("{target:?}"),
            });
        }
        self.status = target;
        Ok(())
    }

    pub fn is_resolved(&self) -> bool {
        self.status == FailureStatus::Resolved
    }

    pub fn days_overdue(&self) -> Option<i64> {
        self.due_date.map(|due| (Utc::now() - due).num_days().max(0))
    }

    /// Phone number, when the originating provider supplied one in its
    /// metadata bag. No canonical field exists for it since most providers
    /// never send one.
    pub fn customer_phone_number(&self) -> Option<String> {
        self.provider_metadata.get("phone_number").cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PaymentFailure {
        PaymentFailure::new(NewPaymentFailure {
            provider_id: "cardnet".into(),
            provider_event_id: "evt_1".into(),
            provider_event_type: "payment_intent.payment_failed".into(),
            company_id: "company-1".into(),
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

    #[test]
    fn forward_transition_succeeds() {
        let mut f = sample();
        assert!(f.transition_to(FailureStatus::Analyzed).is_ok());
        assert_eq!(f.status, FailureStatus::Analyzed);
    }

    #[test]
    fn backward_transition_rejected() {
        let mut f = sample();
        f.transition_to(FailureStatus::Alerted).unwrap();
        assert!(f.transition_to(FailureStatus::Analyzed).is_err());
    }

    #[test]
    fn resolved_is_sticky() {
        let mut f = sample();
        f.transition_to(FailureStatus::Analyzed).unwrap();
        f.transition_to(FailureStatus::Resolved).unwrap();
        assert!(f.transition_to(FailureStatus::Failed).is_err());
    }

    #[test]
    fn identity_is_provider_pair() {
        let f = sample();
        assert_eq!(f.identity(), ("cardnet", "evt_1"));
    }

    #[test]
    fn priority_bands_match_score() {
        assert_eq!(Priority::from_score(85), Priority::Critical);
        assert_eq!(Priority::from_score(60), Priority::High);
        assert_eq!(Priority::from_score(59), Priority::Medium);
        assert_eq!(Priority::from_score(10), Priority::Low);
    }
}
