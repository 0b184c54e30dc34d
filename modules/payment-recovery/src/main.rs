//! Process entry point: wires the durable queue, the event bus, the
//! enrichment processor, and the orchestration engine together and runs
//! both consumer groups to completion. There is no HTTP or CLI surface —
//! this binary is a pipeline worker, not a service front door.

use std::sync::Arc;

use event_bus::durable::{self, ConsumeOutcome, DurableQueue};
use event_bus::EventEnvelope;
use tokio::sync::Notify;

use payment_recovery::collaborators::{InMemoryCommunicationDispatcher, InMemoryRetrySubmitter, InMemoryTokenVault, TokenVault};
use payment_recovery::config::{BusType, Config};
use payment_recovery::mediators::{AccountingPollingMediator, CardNetworkWebhookMediator, Mediator};
use payment_recovery::model::PaymentFailure;
use payment_recovery::orchestrator::executors::{
    ConditionalExecutor, ExecutorRegistry, RetryPaymentExecutor, SendEmailExecutor, SendSmsExecutor, WaitExecutor, WebhookExecutor,
};
use payment_recovery::orchestrator::Orchestrator;
use payment_recovery::persistence::{InMemoryPersistence, PersistenceFacade};
use payment_recovery::processor::{EnrichmentMetrics, EventProcessor, TOPIC_DETECTED, TOPIC_PROCESSED};
use payment_recovery::rules::RuleEngine;

fn build_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register("retry_payment", Arc::new(RetryPaymentExecutor::new(Arc::new(InMemoryRetrySubmitter::new()))));
    let dispatcher = Arc::new(InMemoryCommunicationDispatcher::default());
    registry.register("send_email", Arc::new(SendEmailExecutor::new(dispatcher.clone())));
    registry.register("send_sms", Arc::new(SendSmsExecutor::new(dispatcher)));
    registry.register("wait", Arc::new(WaitExecutor));
    registry.register("conditional", Arc::new(ConditionalExecutor));
    registry.register("webhook", Arc::new(WebhookExecutor::new()));
    registry
}

async fn build_durable_queue(config: &Config) -> anyhow::Result<Arc<dyn DurableQueue>> {
    match config.bus_type {
        BusType::InMemory => Ok(Arc::new(durable::InMemoryDurableQueue::new())),
        BusType::Nats => {
            let url = config.nats_url.clone().ok_or_else(|| anyhow::anyhow!("NATS_URL required when BUS_TYPE=nats"))?;
            let client = async_nats::connect(&url).await?;
            Ok(Arc::new(durable::NatsDurableQueue::new(client, config.max_redeliveries as i64)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(bus_type = ?config.bus_type, max_concurrent_executions = config.max_concurrent_executions, "starting payment-watchdog");

    let persistence: Arc<dyn PersistenceFacade> = Arc::new(InMemoryPersistence::new());
    let durable_queue = build_durable_queue(&config).await?;

    let rule_engine = Arc::new(RuleEngine::default());
    let metrics = Arc::new(EnrichmentMetrics::new());
    let processor = Arc::new(EventProcessor::new(persistence.clone(), rule_engine, durable_queue.clone(), metrics));

    let registry = Arc::new(build_registry());
    let orchestrator = Orchestrator::new(persistence.clone(), registry, config.max_concurrent_executions);

    // Mediators. The webhook mediator is exercised by an ingress layer
    // outside this binary's scope; constructing it here keeps it wired into
    // the same rate limiter and signature secret as the rest of the process.
    let _card_network_mediator = CardNetworkWebhookMediator::new(
        "cardnet",
        std::env::var("CARDNET_WEBHOOK_SECRET").unwrap_or_default(),
        config.webhook_replay_window_secs,
        config.webhook_rate_per_sec,
        config.webhook_burst,
    );
    // The OAuth callback itself is served by an ingress layer outside this
    // binary, the same way the card network webhook is; it calls
    // `store_tokens` on this mediator once the authorization-code exchange
    // completes. The vault is shared here so the poll loop below picks up
    // whatever that ingress layer stored.
    let token_vault: Arc<dyn TokenVault> = Arc::new(InMemoryTokenVault::default());
    let accounting_mediator = AccountingPollingMediator::new(
        "accounting",
        std::env::var("ACCOUNTING_CLIENT_ID").unwrap_or_default(),
        std::env::var("ACCOUNTING_CLIENT_SECRET").unwrap_or_default(),
        std::env::var("ACCOUNTING_API_BASE_URL").unwrap_or_else(|_| "https://api.accounting.example".to_string()),
        config.provider_http_timeout,
        token_vault,
    );

    let shutdown = Arc::new(Notify::new());

    let detected_handle = {
        let queue = durable_queue.clone();
        let processor = processor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            durable::run_consumer_group(queue, TOPIC_DETECTED, durable::WORKER_GROUP, 5, shutdown, move |message| {
                let processor = processor.clone();
                async move {
                    let envelope: EventEnvelope<PaymentFailure> = match serde_json::from_slice(&message.payload) {
                        Ok(envelope) => envelope,
                        Err(e) => return ConsumeOutcome::Poison(format!("undecodable detected event: {e}")),
                    };
                    match processor.process(envelope.payload).await {
                        Ok(_) => ConsumeOutcome::Ack,
                        Err(e) => ConsumeOutcome::Retry(e.to_string()),
                    }
                }
            })
            .await;
        })
    };

    let processed_handle = {
        let queue = durable_queue.clone();
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            durable::run_consumer_group(queue, TOPIC_PROCESSED, durable::WORKER_GROUP, 5, shutdown, move |message| {
                let orchestrator = orchestrator.clone();
                async move {
                    let envelope: EventEnvelope<PaymentFailure> = match serde_json::from_slice(&message.payload) {
                        Ok(envelope) => envelope,
                        Err(e) => return ConsumeOutcome::Poison(format!("undecodable processed event: {e}")),
                    };
                    match orchestrator.handle_processed_failure(envelope.payload).await {
                        Ok(_) => ConsumeOutcome::Ack,
                        Err(e) => ConsumeOutcome::Retry(e.to_string()),
                    }
                }
            })
            .await;
        })
    };

    let poll_handle = {
        let queue = durable_queue.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            let mut last_sync = chrono::Utc::now() - chrono::Duration::hours(24);
            loop {
                ticker.tick().await;
                match accounting_mediator.poll_since(last_sync).await {
                    Ok(failures) => {
                        tracing::info!(count = failures.len(), "polled overdue invoices");
                        for failure in failures {
                            let envelope = EventEnvelope::new(TOPIC_DETECTED, failure.company_id.clone(), "mediator.accounting", failure);
                            match serde_json::to_vec(&envelope) {
                                Ok(payload) => {
                                    if let Err(e) = queue.publish(TOPIC_DETECTED, payload).await {
                                        tracing::error!(error = %e, "failed to publish polled invoice");
                                    }
                                }
                                Err(e) => tracing::error!(error = %e, "failed to encode polled invoice"),
                            }
                        }
                        last_sync = chrono::Utc::now();
                    }
                    Err(e) => tracing::warn!(error = %e, "accounting poll failed"),
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    shutdown.notify_waiters();
    poll_handle.abort();
    let _ = tokio::join!(detected_handle, processed_handle);

    Ok(())
}
