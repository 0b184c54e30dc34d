//! Contracts for collaborators injected into the core but not implemented by
//! it: a retry-job submitter, a communication dispatcher, and a secret/token
//! vault (§6). Only the in-memory fakes used by tests live in this crate;
//! production implementations are wired in by the binary that owns the
//! HTTP/CLI surface.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Submits a retry job for a failed payment and returns its id. The
/// `retry_payment` executor records this id as its `external_id`; whether
/// the retry itself succeeds is observed later as a new provider event
/// re-entering the pipeline, not as this call's return value.
#[async_trait]
pub trait RetryJobSubmitter: Send + Sync {
    async fn submit_retry(
        &self,
        payment_failure_id: Uuid,
        provider: &str,
        new_amount: Option<Decimal>,
        retry_reason: &str,
    ) -> anyhow::Result<String>;
}

pub struct EmailRequest {
    pub to: String,
    pub template: String,
    pub variables: HashMap<String, String>,
}

pub struct SmsRequest {
    pub to: String,
    pub template: String,
    pub variables: HashMap<String, String>,
}

pub struct DispatchResult {
    pub message_id: String,
    pub template_used: String,
}

/// Dispatches customer communications. Template resolution and provider
/// integration (SendGrid, Twilio, ...) live outside the core.
#[async_trait]
pub trait CommunicationDispatcher: Send + Sync {
    async fn send_email(&self, request: EmailRequest) -> anyhow::Result<DispatchResult>;
    async fn send_sms(&self, request: SmsRequest) -> anyhow::Result<DispatchResult>;
}

#[derive(Debug, Clone, Default)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Secret/token vault for OAuth-backed mediators. Storage location (vault,
/// KMS-sealed table, ...) is an external concern.
#[async_trait]
pub trait TokenVault: Send + Sync {
    async fn store(&self, company_id: &str, tokens: OAuthTokens) -> anyhow::Result<()>;
    async fn retrieve(&self, company_id: &str) -> anyhow::Result<Option<OAuthTokens>>;
    async fn delete(&self, company_id: &str) -> anyhow::Result<()>;
}

/// In-memory fakes for the three collaborator contracts above, used by
/// tests and local development exactly as `InMemoryBus` stands in for
/// `NatsBus`.
pub struct InMemoryRetrySubmitter {
    next_id: Mutex<u64>,
}

impl InMemoryRetrySubmitter {
    pub fn new() -> Self {
        Self { next_id: Mutex::new(1) }
    }
}

impl Default for InMemoryRetrySubmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RetryJobSubmitter for InMemoryRetrySubmitter {
    async fn submit_retry(
        &self,
        payment_failure_id: Uuid,
        provider: &str,
        _new_amount: Option<Decimal>,
        _retry_reason: &str,
    ) -> anyhow::Result<String> {
        let mut next = self.next_id.lock().unwrap();
        let job_id = format!("retry-job-{}-{}-{}", provider, payment_failure_id, *next);
        *next += 1;
        Ok(job_id)
    }
}

#[derive(Default)]
pub struct InMemoryCommunicationDispatcher {
    next_id: Mutex<u64>,
}

#[async_trait]
impl CommunicationDispatcher for InMemoryCommunicationDispatcher {
    async fn send_email(&self, request: EmailRequest) -> anyhow::Result<DispatchResult> {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        tracing::info!(to = %request.to, template = %request.template, "sending email (in-memory fake)");
        Ok(DispatchResult { message_id: format!("email-{}", *next), template_used: request.template })
    }

    async fn send_sms(&self, request: SmsRequest) -> anyhow::Result<DispatchResult> {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        tracing::info!(to = %request.to, template = %request.template, "sending sms (in-memory fake)");
        Ok(DispatchResult { message_id: format!("sms-{}", *next), template_used: request.template })
    }
}

#[derive(Default)]
pub struct InMemoryTokenVault {
    tokens: Mutex<HashMap<String, OAuthTokens>>,
}

#[async_trait]
impl TokenVault for InMemoryTokenVault {
    async fn store(&self, company_id: &str, tokens: OAuthTokens) -> anyhow::Result<()> {
        self.tokens.lock().unwrap().insert(company_id.to_string(), tokens);
        Ok(())
    }

    async fn retrieve(&self, company_id: &str) -> anyhow::Result<Option<OAuthTokens>> {
        Ok(self.tokens.lock().unwrap().get(company_id).cloned())
    }

    async fn delete(&self, company_id: &str) -> anyhow::Result<()> {
        self.tokens.lock().unwrap().remove(company_id);
        Ok(())
    }
}
