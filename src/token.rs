use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::db::models::MailAccount;
use crate::error::SyncError;
use crate::fetch::{fetch_with_retry, redact_response_body, RetryPolicy};
use crate::vault::{SecretVault, VaultError};

const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Margin subtracted from the provider's ttl so a token is never presented
/// moments before it lapses (clock drift, network latency).
const SAFETY_WINDOW_SECONDS: i64 = 60;

pub const TOKEN_URL_ENV: &str = "MAILSYNC_TOKEN_URL";
pub const CLIENT_ID_ENV: &str = "MAILSYNC_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "MAILSYNC_CLIENT_SECRET";

#[derive(Debug, Clone)]
pub struct CachedAccessToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedAccessToken {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Seam between the orchestrator and credential handling, so sync logic is
/// testable without a token endpoint.
#[async_trait(?Send)]
pub trait AccessTokens: Send + Sync {
    async fn access_token(&self, account: &MailAccount) -> Result<String, SyncError>;
}

/// Exchanges the account's sealed long-lived credential for short-lived
/// bearer tokens, with a process-memory cache keyed by (tenant, user).
/// A restart simply costs one extra exchange per account.
pub struct TokenBroker {
    client: Client,
    vault: SecretVault,
    token_url: String,
    client_id: String,
    client_secret: String,
    retry: RetryPolicy,
    cache: Mutex<HashMap<(String, String), CachedAccessToken>>,
}

impl TokenBroker {
    pub fn new(
        vault: SecretVault,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client: Client::new(),
            vault,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            retry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env(vault: SecretVault) -> Result<Self> {
        let token_url = std::env::var(TOKEN_URL_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string());

        let client_id = required_env(CLIENT_ID_ENV)?;
        let client_secret = required_env(CLIENT_SECRET_ENV)?;

        Ok(Self::new(
            vault,
            token_url,
            client_id,
            client_secret,
            RetryPolicy::default(),
        ))
    }

    async fn exchange(&self, refresh_token: &str) -> Result<CachedAccessToken, SyncError> {
        let request = self.client.post(&self.token_url).form(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ]);

        let response = fetch_with_retry(request, &self.retry).await?;
        let status = response.status();
        let body = response.text().await?;

        // A rejected exchange (revoked consent, bad grant) will not succeed
        // on retry; only a re-link fixes it.
        if status.is_client_error() {
            return Err(SyncError::UpstreamAuth {
                status: status.as_u16(),
                body: redact_response_body(&body),
            });
        }
        if !status.is_success() {
            return Err(SyncError::UpstreamUnavailable {
                status: status.as_u16(),
                body: redact_response_body(&body),
            });
        }

        let payload: TokenResponse = serde_json::from_str(&body)?;
        let expires_at = Utc::now()
            + Duration::seconds((payload.expires_in as i64).saturating_sub(SAFETY_WINDOW_SECONDS));

        Ok(CachedAccessToken {
            access_token: payload.access_token,
            expires_at,
        })
    }
}

#[async_trait(?Send)]
impl AccessTokens for TokenBroker {
    async fn access_token(&self, account: &MailAccount) -> Result<String, SyncError> {
        let cache_key = (account.tenant_id.clone(), account.user_id.clone());

        // A stale-but-unexpired read is fine; any valid token is usable.
        {
            let cache = self.cache.lock().expect("token cache lock");
            if let Some(entry) = cache.get(&cache_key) {
                if !entry.is_expired() {
                    return Ok(entry.access_token.clone());
                }
            }
        }

        let sealed = account
            .credential
            .as_deref()
            .ok_or_else(|| SyncError::CredentialMissing {
                tenant_id: account.tenant_id.clone(),
                user_id: account.user_id.clone(),
            })?;

        let refresh_token = String::from_utf8(self.vault.open(sealed)?)
            .map_err(|_| SyncError::Decryption(VaultError::Malformed))?;

        let fresh = self.exchange(&refresh_token).await?;
        let access_token = fresh.access_token.clone();

        // Last writer wins; any fresh token is equally usable.
        self.cache
            .lock()
            .expect("token cache lock")
            .insert(cache_key, fresh);

        Ok(access_token)
    }
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("{name} is not set"))
        .with_context(|| format!("configure provider oauth client via {name}"))
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    token_type: Option<String>,
    expires_in: u64,
}
