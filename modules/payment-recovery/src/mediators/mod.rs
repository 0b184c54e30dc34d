//! Provider Mediators (C3): one adapter per provider, each implementing the
//! shared capability set and normalizing to the canonical [`PaymentFailure`].

mod polling_provider;
mod ratelimit;
mod webhook_provider;

pub use polling_provider::AccountingPollingMediator;
pub use ratelimit::TokenBucket;
pub use webhook_provider::CardNetworkWebhookMediator;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MediatorError;
use crate::model::PaymentFailure;

#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub records_synced: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded(String),
    Unreachable(String),
}

/// Capability set every mediator implements, webhook- or poll-driven. A
/// mediator owns at most one connection; `connect` is idempotent.
#[async_trait]
pub trait Mediator: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn connect(&self) -> Result<(), MediatorError>;
    async fn disconnect(&self) -> Result<(), MediatorError>;

    /// Verify, decode, and map a webhook push into a canonical
    /// [`PaymentFailure`], without publishing it. Callers publish to
    /// `payment.failure.detected` themselves so the publish path is shared
    /// across all mediators regardless of ingress style.
    async fn process_webhook(
        &self,
        raw_bytes: &[u8],
        signature: &str,
        received_at: DateTime<Utc>,
    ) -> Result<PaymentFailure, MediatorError>;

    /// Query the provider for records modified since `since`, mapped to
    /// canonical failures. Webhook-only mediators return an empty list.
    async fn poll_since(&self, since: DateTime<Utc>) -> Result<Vec<PaymentFailure>, MediatorError>;

    async fn get_sync_status(&self) -> SyncStatus;
    async fn get_health(&self) -> HealthState;
}

/// Additional capability set for mediators backed by OAuth 2.0 (§4.3). Vault
/// delegation lives on this trait, not just on the `TokenVault` collaborator
/// itself, because only the mediator knows which company's tokens a given
/// call concerns and how to validate/refresh them against its provider.
#[async_trait]
pub trait OAuthMediator: Mediator {
    fn generate_authorization_url(&self, state: &str) -> String;

    /// Exchange an authorization `code` for tokens. `state` must be the
    /// value handed back from `generate_authorization_url`, used to look up
    /// and consume the PKCE `code_verifier` stashed under it; a `state` that
    /// doesn't match a pending authorization is rejected rather than
    /// silently skipping PKCE.
    async fn exchange_code_for_tokens(&self, code: &str, state: &str) -> Result<crate::collaborators::OAuthTokens, MediatorError>;
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<crate::collaborators::OAuthTokens, MediatorError>;

    async fn validate_tokens(&self, company_id: &str) -> Result<bool, MediatorError>;
    async fn store_tokens(&self, company_id: &str, tokens: crate::collaborators::OAuthTokens) -> Result<(), MediatorError>;
    async fn retrieve_tokens(&self, company_id: &str) -> Result<Option<crate::collaborators::OAuthTokens>, MediatorError>;
    async fn delete_tokens(&self, company_id: &str) -> Result<(), MediatorError>;
}

/// PKCE pair generated for an authorization-code flow.
pub struct Pkce {
    pub code_verifier: String,
    pub code_challenge: String,
}

impl Pkce {
    /// Generate a fresh verifier/challenge pair using SHA-256, per RFC 7636.
    pub fn generate() -> Self {
        use base64::Engine;
        use rand::RngCore;
        use sha2::{Digest, Sha256};

        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let code_verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

        let digest = Sha256::digest(code_verifier.as_bytes());
        let code_challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);

        Self { code_verifier, code_challenge }
    }
}
