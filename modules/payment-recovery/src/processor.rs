//! Event Processor (C5): enrichment, risk scoring, rule evaluation, status
//! update, and republication. Consumes `payment.failure.detected` and emits
//! `payment.failure.processed` — the orchestrator's input topic.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use event_bus::durable::DurableQueue;
use event_bus::EventEnvelope;
use rust_decimal::prelude::ToPrimitive;

use crate::error::ProcessorError;
use crate::model::{FailureStatus, PaymentFailure, Priority};
use crate::persistence::PersistenceFacade;
use crate::rules::RuleEngine;

pub const TOPIC_DETECTED: &str = "payment.failure.detected";
pub const TOPIC_PROCESSED: &str = "payment.failure.processed";

/// Fill in defaults a mediator may have left unset. Mutates in place since
/// enrichment runs once, before the record is shared.
pub fn enrich(failure: &mut PaymentFailure) {
    if failure.company_id.is_empty() {
        failure.company_id = "default_company".to_string();
    }
    if failure.provider_event_type.is_empty() {
        failure.provider_event_type = "payment_failure".to_string();
    }
    if failure.occurred_at.timestamp() == 0 {
        failure.occurred_at = chrono::Utc::now();
    }
    if failure.detected_at.timestamp() == 0 {
        failure.detected_at = chrono::Utc::now();
    }
    if failure.business_category.is_empty() {
        failure.business_category = "general".to_string();
    }

    let amount = failure.amount.to_f64().unwrap_or(0.0);
    if amount > 10_000.0 {
        failure.tags.insert("high_value".to_string());
    }
    if failure.failure_reason == "invoice_unpaid" {
        failure.tags.insert("invoice_based".to_string());
    }
}

/// Canonical risk-scoring formula (§4.5): amount band + overdue-days band +
/// category band, started at 50 and capped at 100. The processor is
/// authoritative for this value; mediators may produce an initial estimate
/// but it is always recomputed here.
pub fn score_risk(failure: &PaymentFailure) -> u8 {
    let mut score: i32 = 50;

    let amount = failure.amount.to_f64().unwrap_or(0.0);
    score += if amount >= 10_000.0 {
        30
    } else if amount >= 5_000.0 {
        20
    } else if amount >= 1_000.0 {
        10
    } else {
        0
    };

    if let Some(days) = failure.days_overdue() {
        score += if days > 90 {
            20
        } else if days > 60 {
            15
        } else if days > 30 {
            10
        } else if days > 7 {
            5
        } else {
            0
        };
    }

    score += match failure.business_category.as_str() {
        "construction" | "manufacturing" | "healthcare" => 10,
        "retail" | "hospitality" => 5,
        _ => 0,
    };

    score.clamp(0, 100) as u8
}

/// In-process counters recorded per processed event (§4.5). Not a metrics
/// scrape endpoint — that HTTP surface is out of scope — but real carried
/// state, read back through [`EnrichmentMetrics::snapshot`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub processed_by_provider: HashMap<String, u64>,
    pub processed_by_status: HashMap<String, u64>,
    pub average_latency_ms: f64,
    pub error_count: u64,
}

#[derive(Default)]
struct MetricsInner {
    processed_by_provider: HashMap<String, u64>,
    processed_by_status: HashMap<String, u64>,
    latency_sum_ms: f64,
    latency_count: u64,
    error_count: u64,
}

#[derive(Default)]
pub struct EnrichmentMetrics {
    inner: Mutex<MetricsInner>,
}

impl EnrichmentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self, provider_id: &str, status: &str, latency_ms: f64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.processed_by_provider.entry(provider_id.to_string()).or_insert(0) += 1;
        *inner.processed_by_status.entry(status.to_string()).or_insert(0) += 1;
        inner.latency_sum_ms += latency_ms;
        inner.latency_count += 1;
    }

    pub fn record_error(&self) {
        self.inner.lock().unwrap().error_count += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        let average_latency_ms = if inner.latency_count > 0 { inner.latency_sum_ms / inner.latency_count as f64 } else { 0.0 };
        MetricsSnapshot {
            processed_by_provider: inner.processed_by_provider.clone(),
            processed_by_status: inner.processed_by_status.clone(),
            average_latency_ms,
            error_count: inner.error_count,
        }
    }
}

/// Runs the full enrich → score → rule-evaluate → persist → republish
/// pipeline for one detected failure. Republishes through the durable
/// queue rather than the raw [`event_bus::EventBus`] transport, since the
/// orchestrator consumes `payment.failure.processed` as a consumer group
/// and would never see a message published only to the raw bus.
pub struct EventProcessor {
    persistence: Arc<dyn PersistenceFacade>,
    rule_engine: Arc<RuleEngine>,
    queue: Arc<dyn DurableQueue>,
    metrics: Arc<EnrichmentMetrics>,
}

impl EventProcessor {
    pub fn new(
        persistence: Arc<dyn PersistenceFacade>,
        rule_engine: Arc<RuleEngine>,
        queue: Arc<dyn DurableQueue>,
        metrics: Arc<EnrichmentMetrics>,
    ) -> Self {
        Self { persistence, rule_engine, queue, metrics }
    }

    pub fn metrics(&self) -> &EnrichmentMetrics {
        &self.metrics
    }

    /// Process one detected failure end to end, returning the final,
    /// persisted, `analyzed` record. Idempotent: redelivery of the same
    /// `(provider_id, provider_event_id)` merges onto the existing row
    /// rather than creating a duplicate (§5).
    pub async fn process(&self, mut failure: PaymentFailure) -> Result<PaymentFailure, ProcessorError> {
        let started = std::time::Instant::now();

        enrich(&mut failure);
        failure.risk_score = score_risk(&failure);
        failure.priority = Priority::from_score(failure.risk_score);

        let rule_results = self.rule_engine.evaluate(&failure);
        for result in &rule_results {
            tracing::info!(
                payment_failure_id = %failure.id,
                rule = %result.rule_name,
                tag = ?result.tag,
                "rule matched"
            );
        }

        failure.transition_to(FailureStatus::Analyzed)?;
        failure.processed_at = Some(chrono::Utc::now());

        let persisted = self
            .persistence
            .upsert_payment_failure(failure)
            .await
            .map_err(|e| ProcessorError::TransientStoreError(e.to_string()))?;

        let envelope = EventEnvelope::new(TOPIC_PROCESSED, persisted.company_id.clone(), "processor", persisted.clone())
            .with_risk(persisted.risk_score, persisted.priority.as_str());
        let payload = serde_json::to_vec(&envelope).map_err(|e| ProcessorError::DecodeError(e.to_string()))?;
        self.queue.publish(TOPIC_PROCESSED, payload).await?;

        self.metrics.record_processed(&persisted.provider_id, "analyzed", started.elapsed().as_secs_f64() * 1000.0);

        Ok(persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewPaymentFailure, SyncSource};
    use crate::persistence::InMemoryPersistence;
    use crate::rules::RuleEngine;
    use chrono::{Duration, Utc};
    use event_bus::durable::InMemoryDurableQueue;
    use rust_decimal::Decimal;

    fn failure(amount: &str, due_days_ago: Option<i64>, category: &str) -> PaymentFailure {
        PaymentFailure::new(NewPaymentFailure {
            provider_id: "cardnet".into(),
            provider_event_id: "evt_1".into(),
            provider_event_type: "payment_intent.payment_failed".into(),
            company_id: "company-1".into(),
            amount: amount.parse::<Decimal>().unwrap(),
            currency: "USD".into(),
            customer_id: "c1".into(),
            customer_name: None,
            customer_email: None,
            failure_reason: "card_declined".into(),
            failure_code: None,
            failure_message: None,
            business_category: category.into(),
            occurred_at: Utc::now() - Duration::hours(1),
            due_date: due_days_ago.map(|days| Utc::now() - Duration::days(days)),
            sync_source: SyncSource::Webhook,
            raw_data: Vec::new(),
            provider_metadata: Default::default(),
        })
    }

    #[test]
    fn webhook_ingest_scenario_scores_60_high() {
        let f = failure("2500.00", None, "general");
        let score = score_risk(&f);
        assert_eq!(score, 60);
        assert_eq!(crate::model::Priority::from_score(score), crate::model::Priority::High);
    }

    #[test]
    fn overdue_invoice_scenario_caps_at_100_critical() {
        let f = failure("15000.00", Some(95), "construction");
        let score = score_risk(&f);
        assert_eq!(score, 100);
        assert_eq!(crate::model::Priority::from_score(score), crate::model::Priority::Critical);
    }

    #[test]
    fn high_value_tag_boundary() {
        let mut below = failure("9999.99", None, "general");
        enrich(&mut below);
        assert!(!below.tags.contains("high_value"));

        let mut above = failure("10000.01", None, "general");
        enrich(&mut above);
        assert!(above.tags.contains("high_value"));
    }

    #[test]
    fn overdue_day_boundaries() {
        assert_eq!(score_risk(&failure("100.00", Some(6), "general")) - 50, 0);
        assert_eq!(score_risk(&failure("100.00", Some(8), "general")) - 50, 5);
        assert_eq!(score_risk(&failure("100.00", Some(31), "general")) - 50, 10);
        assert_eq!(score_risk(&failure("100.00", Some(61), "general")) - 50, 15);
        assert_eq!(score_risk(&failure("100.00", Some(91), "general")) - 50, 20);
    }

    #[tokio::test]
    async fn process_persists_and_republishes() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let rule_engine = Arc::new(RuleEngine::default());
        let queue: Arc<dyn DurableQueue> = Arc::new(InMemoryDurableQueue::new());
        let metrics = Arc::new(EnrichmentMetrics::new());
        let processor = EventProcessor::new(persistence.clone(), rule_engine, queue, metrics);

        let result = processor.process(failure("2500.00", None, "general")).await.unwrap();
        assert_eq!(result.status, FailureStatus::Analyzed);
        assert_eq!(result.risk_score, 70);

        let stored = persistence.get_payment_failure(result.id).await.unwrap();
        assert!(stored.is_some());

        let snapshot = processor_metrics_from(&processor);
        assert_eq!(snapshot.processed_by_provider.get("cardnet"), Some(&1));
    }

    fn processor_metrics_from(processor: &EventProcessor) -> MetricsSnapshot {
        processor.metrics().snapshot()
    }
}
