//! Poll-driven, OAuth-backed mediator for an accounting provider: periodic
//! sync of overdue invoices, authorization-code + PKCE + refresh-token
//! flow, and mapping to the canonical [`PaymentFailure`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{HealthState, Mediator, OAuthMediator, Pkce, SyncStatus};
use crate::collaborators::{OAuthTokens, TokenVault};
use crate::error::MediatorError;
use crate::model::{NewPaymentFailure, PaymentFailure, SyncSource};

#[derive(Debug, Deserialize)]
struct AccountingInvoice {
    id: String,
    customer_id: String,
    customer_name: Option<String>,
    customer_email: Option<String>,
    amount_due: Decimal,
    currency: String,
    business_category: Option<String>,
    due_date: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct InvoiceListResponse {
    invoices: Vec<AccountingInvoice>,
}

pub struct AccountingPollingMediator {
    provider_id: String,
    client_id: String,
    client_secret: String,
    api_base_url: String,
    http: reqwest::Client,
    sync_status: Mutex<SyncStatus>,
    pending_pkce: DashMap<String, Pkce>,
    default_lookback: Duration,
    vault: Arc<dyn TokenVault>,
}

impl AccountingPollingMediator {
    pub fn new(
        provider_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        api_base_url: impl Into<String>,
        http_timeout: Duration,
        vault: Arc<dyn TokenVault>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider_id: provider_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base_url: api_base_url.into(),
            http: reqwest::Client::builder().timeout(http_timeout).build().expect("reqwest client"),
            sync_status: Mutex::new(SyncStatus::default()),
            pending_pkce: DashMap::new(),
            default_lookback: Duration::from_secs(24 * 3600),
            vault,
        })
    }

    fn is_failed_or_overdue(invoice: &AccountingInvoice) -> bool {
        invoice.amount_due > Decimal::ZERO && invoice.due_date < Utc::now()
    }

    fn map_invoice(&self, invoice: AccountingInvoice) -> Result<PaymentFailure, MediatorError> {
        let raw_data = serde_json::to_vec(&serde_json::json!({"invoice_id": &invoice.id}))
            .map_err(|e| MediatorError::MappingError(e.to_string()))?;

        Ok(PaymentFailure::new(NewPaymentFailure {
            provider_id: self.provider_id.clone(),
            provider_event_id: invoice.id,
            provider_event_type: "invoice_overdue".to_string(),
            company_id: String::new(),
            amount: invoice.amount_due,
            currency: invoice.currency,
            customer_id: invoice.customer_id,
            customer_name: invoice.customer_name,
            customer_email: invoice.customer_email,
            failure_reason: "invoice_unpaid".to_string(),
            failure_code: None,
            failure_message: None,
            business_category: invoice.business_category.unwrap_or_default(),
            occurred_at: invoice.modified_at,
            due_date: Some(invoice.due_date),
            sync_source: SyncSource::ApiPoll,
            raw_data,
            provider_metadata: Default::default(),
        }))
    }

    /// One polling sweep: query invoices modified since `since`, keep only
    /// those representing failed/overdue payments, map them, and update
    /// the running sync status. Does not publish — callers own the bus.
    async fn fetch_since(&self, since: DateTime<Utc>, access_token: &str) -> Result<Vec<PaymentFailure>, MediatorError> {
        let url = format!("{}/invoices?modified_since={}", self.api_base_url, since.to_rfc3339());
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| MediatorError::TransientProviderError(e.to_string()))?;

        if response.status().as_u16() == 429 {
            return Err(MediatorError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(MediatorError::TransientProviderError(format!("status {}", response.status())));
        }

        let body: InvoiceListResponse = response.json().await.map_err(|e| MediatorError::DecodeError(e.to_string()))?;

        body.invoices.into_iter().filter(Self::is_failed_or_overdue).map(|inv| self.map_invoice(inv)).collect()
    }

    /// Resolve a usable access token for a polling sweep: reuse the stored
    /// token while it's still valid, refresh it once it's expired, or fail
    /// if the authorization flow has never been completed for this
    /// provider account.
    async fn access_token_for_poll(&self) -> Result<String, MediatorError> {
        let stored = self.vault.retrieve(&self.provider_id).await.map_err(|e| MediatorError::OAuthError(e.to_string()))?;
        match stored {
            Some(tokens) if tokens.expires_at > Utc::now() => Ok(tokens.access_token),
            Some(tokens) => {
                let refreshed = self.refresh_access_token(&tokens.refresh_token).await?;
                let access_token = refreshed.access_token.clone();
                self.vault.store(&self.provider_id, refreshed).await.map_err(|e| MediatorError::OAuthError(e.to_string()))?;
                Ok(access_token)
            }
            None => Err(MediatorError::OAuthError(format!("no OAuth tokens stored for provider {}; complete the authorization flow first", self.provider_id))),
        }
    }
}

#[async_trait]
impl Mediator for AccountingPollingMediator {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn connect(&self) -> Result<(), MediatorError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MediatorError> {
        Ok(())
    }

    async fn process_webhook(&self, _raw_bytes: &[u8], _signature: &str, _received_at: DateTime<Utc>) -> Result<PaymentFailure, MediatorError> {
        Err(MediatorError::MappingError("this mediator is poll-driven, not webhook-driven".to_string()))
    }

    async fn poll_since(&self, since: DateTime<Utc>) -> Result<Vec<PaymentFailure>, MediatorError> {
        let access_token = match self.access_token_for_poll().await {
            Ok(token) => token,
            Err(e) => {
                self.sync_status.lock().unwrap().last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let failures = self.fetch_since(since, &access_token).await;
        let mut status = self.sync_status.lock().unwrap();
        match &failures {
            Ok(records) => {
                status.last_sync_at = Some(Utc::now());
                status.next_sync_at = Some(Utc::now() + chrono::Duration::from_std(self.default_lookback).unwrap());
                status.records_synced += records.len() as u64;
                status.last_error = None;
            }
            Err(e) => status.last_error = Some(e.to_string()),
        }
        failures
    }

    async fn get_sync_status(&self) -> SyncStatus {
        self.sync_status.lock().unwrap().clone()
    }

    async fn get_health(&self) -> HealthState {
        HealthState::Healthy
    }
}

#[async_trait]
impl OAuthMediator for AccountingPollingMediator {
    fn generate_authorization_url(&self, state: &str) -> String {
        let pkce = Pkce::generate();
        let challenge = pkce.code_challenge.clone();
        self.pending_pkce.insert(state.to_string(), pkce);

        format!(
            "{}/oauth/authorize?client_id={}&response_type=code&state={}&code_challenge={}&code_challenge_method=S256",
            self.api_base_url, self.client_id, state, challenge
        )
    }

    async fn exchange_code_for_tokens(&self, code: &str, state: &str) -> Result<OAuthTokens, MediatorError> {
        let (_, pkce) = self.pending_pkce.remove(state).ok_or_else(|| MediatorError::OAuthError("state does not match a pending authorization".to_string()))?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: String,
            expires_in: i64,
        }

        let response: TokenResponse = self
            .http
            .post(format!("{}/oauth/token", self.api_base_url))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("code_verifier", pkce.code_verifier.as_str()),
            ])
            .send()
            .await
            .map_err(|e| MediatorError::OAuthError(e.to_string()))?
            .json()
            .await
            .map_err(|e| MediatorError::OAuthError(e.to_string()))?;

        Ok(OAuthTokens {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(response.expires_in),
        })
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<OAuthTokens, MediatorError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: Option<String>,
            expires_in: i64,
        }

        let response: TokenResponse = self
            .http
            .post(format!("{}/oauth/token", self.api_base_url))
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token), ("client_id", &self.client_id), ("client_secret", &self.client_secret)])
            .send()
            .await
            .map_err(|e| MediatorError::OAuthError(e.to_string()))?
            .json()
            .await
            .map_err(|e| MediatorError::OAuthError(e.to_string()))?;

        Ok(OAuthTokens {
            access_token: response.access_token,
            refresh_token: response.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
            expires_at: Utc::now() + chrono::Duration::seconds(response.expires_in),
        })
    }

    async fn validate_tokens(&self, company_id: &str) -> Result<bool, MediatorError> {
        let tokens = self.vault.retrieve(company_id).await.map_err(|e| MediatorError::OAuthError(e.to_string()))?;
        Ok(tokens.map(|t| t.expires_at > Utc::now()).unwrap_or(false))
    }

    async fn store_tokens(&self, company_id: &str, tokens: OAuthTokens) -> Result<(), MediatorError> {
        self.vault.store(company_id, tokens).await.map_err(|e| MediatorError::OAuthError(e.to_string()))
    }

    async fn retrieve_tokens(&self, company_id: &str) -> Result<Option<OAuthTokens>, MediatorError> {
        self.vault.retrieve(company_id).await.map_err(|e| MediatorError::OAuthError(e.to_string()))
    }

    async fn delete_tokens(&self, company_id: &str) -> Result<(), MediatorError> {
        self.vault.delete(company_id).await.map_err(|e| MediatorError::OAuthError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryTokenVault;

    fn mediator() -> Arc<AccountingPollingMediator> {
        AccountingPollingMediator::new("accounting", "client-1", "secret", "https://provider.example", Duration::from_secs(30), Arc::new(InMemoryTokenVault::default()))
    }

    #[test]
    fn overdue_unpaid_invoice_is_selected() {
        let invoice = AccountingInvoice {
            id: "inv_1".into(),
            customer_id: "c1".into(),
            customer_name: None,
            customer_email: None,
            amount_due: Decimal::new(1500000, 2),
            currency: "USD".into(),
            business_category: Some("construction".into()),
            due_date: Utc::now() - chrono::Duration::days(95),
            modified_at: Utc::now(),
        };
        assert!(AccountingPollingMediator::is_failed_or_overdue(&invoice));
    }

    #[test]
    fn paid_invoice_is_not_selected() {
        let invoice = AccountingInvoice {
            id: "inv_2".into(),
            customer_id: "c1".into(),
            customer_name: None,
            customer_email: None,
            amount_due: Decimal::ZERO,
            currency: "USD".into(),
            business_category: None,
            due_date: Utc::now() - chrono::Duration::days(5),
            modified_at: Utc::now(),
        };
        assert!(!AccountingPollingMediator::is_failed_or_overdue(&invoice));
    }

    #[test]
    fn generate_authorization_url_stashes_pkce_for_state() {
        let mediator = mediator();
        let url = mediator.generate_authorization_url("state-123");
        assert!(url.contains("state=state-123"));
        assert!(mediator.pending_pkce.contains_key("state-123"));
    }

    #[tokio::test]
    async fn exchange_rejects_unknown_state_without_consuming_pkce() {
        let mediator = mediator();
        mediator.generate_authorization_url("state-123");
        let result = mediator.exchange_code_for_tokens("some-code", "wrong-state").await;
        assert!(matches!(result, Err(MediatorError::OAuthError(_))));
        assert!(mediator.pending_pkce.contains_key("state-123"));
    }

    #[tokio::test]
    async fn poll_since_without_stored_tokens_fails_closed() {
        let mediator = mediator();
        let result = mediator.poll_since(Utc::now() - chrono::Duration::days(1)).await;
        assert!(matches!(result, Err(MediatorError::OAuthError(_))));
    }

    #[tokio::test]
    async fn stores_and_retrieves_tokens_through_the_vault() {
        let mediator = mediator();
        let tokens = OAuthTokens { access_token: "at".into(), refresh_token: "rt".into(), expires_at: Utc::now() + chrono::Duration::hours(1) };
        mediator.store_tokens("accounting", tokens.clone()).await.unwrap();
        let retrieved = mediator.retrieve_tokens("accounting").await.unwrap();
        assert_eq!(retrieved.unwrap().access_token, "at");
        assert!(mediator.validate_tokens("accounting").await.unwrap());
        mediator.delete_tokens("accounting").await.unwrap();
        assert!(mediator.retrieve_tokens("accounting").await.unwrap().is_none());
    }
}
