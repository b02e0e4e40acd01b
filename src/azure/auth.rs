//! Azure Authentication
//!
//! Bearer tokens for Azure Resource Manager, from (in order) a token in the
//! environment, a service principal secret, or the Azure CLI login.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Scope requested for Resource Manager tokens
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Resource passed to `az account get-access-token`
const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Refresh tokens this much before they actually expire
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// TTL assumed when the source does not say (conservative: 30 minutes)
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
enum TokenSource {
    /// Pre-issued token, e.g. `AZURE_ACCESS_TOKEN`
    Static(String),
    /// OAuth2 client-credentials flow for a service principal
    ClientSecret {
        authority: String,
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    /// `az account get-access-token`
    AzureCli,
}

impl TokenSource {
    fn describe(&self) -> &'static str {
        match self {
            Self::Static(_) => "static token",
            Self::ClientSecret { .. } => "service principal",
            Self::AzureCli => "Azure CLI",
        }
    }
}

/// Azure credentials holder with token caching
#[derive(Clone)]
pub struct AzureCredentials {
    source: Arc<TokenSource>,
    http: reqwest::Client,
    token_cache: Arc<RwLock<Option<CachedToken>>>,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    /// When this token expires (with buffer applied)
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliTokenResponse {
    access_token: String,
}

impl AzureCredentials {
    fn with_source(source: TokenSource) -> Self {
        Self {
            source: Arc::new(source),
            http: reqwest::Client::new(),
            token_cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Pick a token source from the environment.
    ///
    /// `AZURE_ACCESS_TOKEN` wins; then `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`
    /// and `AZURE_CLIENT_SECRET` together; otherwise the Azure CLI.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let source = if let Some(token) = var("AZURE_ACCESS_TOKEN") {
            TokenSource::Static(token)
        } else if let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
            var("AZURE_TENANT_ID"),
            var("AZURE_CLIENT_ID"),
            var("AZURE_CLIENT_SECRET"),
        ) {
            TokenSource::ClientSecret {
                authority: var("AZURE_AUTHORITY_HOST").unwrap_or_else(|| DEFAULT_AUTHORITY.to_string()),
                tenant_id,
                client_id,
                client_secret,
            }
        } else {
            TokenSource::AzureCli
        };

        tracing::debug!("Using {} credentials", source.describe());
        Self::with_source(source)
    }

    /// Credentials that always return `token`
    pub fn from_token(token: impl Into<String>) -> Self {
        Self::with_source(TokenSource::Static(token.into()))
    }

    /// Service principal credentials against `authority`
    pub fn from_client_secret(authority: &str, tenant_id: &str, client_id: &str, client_secret: &str) -> Self {
        Self::with_source(TokenSource::ClientSecret {
            authority: authority.trim_end_matches('/').to_string(),
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    /// Get an access token for API calls
    pub async fn get_token(&self) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.is_valid() {
                    return Ok(cached.token.clone());
                }
                tracing::debug!("Cached token expired, fetching new token");
            }
        }

        let (token, ttl) = self.fetch().await?;
        let expires_at = Instant::now() + ttl.saturating_sub(TOKEN_EXPIRY_BUFFER);

        {
            let mut cache = self.token_cache.write().await;
            *cache = Some(CachedToken {
                token: token.clone(),
                expires_at,
            });
        }

        tracing::debug!(
            "New token cached, expires in ~{} minutes",
            ttl.saturating_sub(TOKEN_EXPIRY_BUFFER).as_secs() / 60
        );

        Ok(token)
    }

    /// Force refresh the token
    pub async fn refresh_token(&self) -> Result<String> {
        {
            let mut cache = self.token_cache.write().await;
            *cache = None;
        }
        self.get_token().await
    }

    async fn fetch(&self) -> Result<(String, Duration)> {
        match self.source.as_ref() {
            TokenSource::Static(token) => Ok((token.clone(), DEFAULT_TOKEN_TTL)),
            TokenSource::ClientSecret {
                authority,
                tenant_id,
                client_id,
                client_secret,
            } => {
                let url = format!("{}/{}/oauth2/v2.0/token", authority, tenant_id);
                let response = self
                    .http
                    .post(&url)
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("scope", MANAGEMENT_SCOPE),
                    ])
                    .send()
                    .await
                    .context("Failed to reach the token endpoint")?;

                let status = response.status();
                if !status.is_success() {
                    // Security: the error body may echo request details, keep it out of the message
                    bail!("Token request failed: {}", status);
                }

                let token: OAuthTokenResponse = response
                    .json()
                    .await
                    .context("Failed to parse token response")?;
                let ttl = token
                    .expires_in
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_TOKEN_TTL);
                Ok((token.access_token, ttl))
            }
            TokenSource::AzureCli => {
                let output = az(&[
                    "account",
                    "get-access-token",
                    "--resource",
                    MANAGEMENT_RESOURCE,
                    "--output",
                    "json",
                ])
                .await
                .context("Failed to get access token. Run 'az login'")?;

                let token: CliTokenResponse =
                    serde_json::from_str(&output).context("Failed to parse Azure CLI token output")?;
                Ok((token.access_token, DEFAULT_TOKEN_TTL))
            }
        }
    }
}

async fn az(args: &[&str]) -> Result<String> {
    let output = Command::new("az")
        .args(args)
        .output()
        .await
        .context("Failed to run the Azure CLI")?;

    if !output.status.success() {
        bail!(
            "az {} exited with {}",
            args.first().copied().unwrap_or_default(),
            output.status
        );
    }

    String::from_utf8(output.stdout).context("Azure CLI output is not UTF-8")
}

/// Subscription ids are GUIDs
pub fn validate_subscription_id(subscription: &str) -> bool {
    Uuid::parse_str(subscription).is_ok()
}

/// Default subscription: `AZURE_SUBSCRIPTION_ID`, then the Azure CLI's
/// active account
pub async fn default_subscription() -> Option<String> {
    if let Ok(subscription) = std::env::var("AZURE_SUBSCRIPTION_ID") {
        if validate_subscription_id(&subscription) {
            return Some(subscription);
        }
        tracing::warn!("Invalid subscription id format in AZURE_SUBSCRIPTION_ID");
    }

    let output = az(&["account", "show", "--query", "id", "--output", "tsv"])
        .await
        .ok()?;
    let subscription = output.trim().to_string();
    validate_subscription_id(&subscription).then_some(subscription)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_subscription_id() {
        assert!(validate_subscription_id("00000000-0000-0000-0000-000000000000"));
        assert!(!validate_subscription_id("my-subscription"));
        assert!(!validate_subscription_id(""));
    }

    #[tokio::test]
    async fn test_static_token_is_cached() {
        let credentials = AzureCredentials::from_token("abc");
        assert_eq!(credentials.get_token().await.unwrap(), "abc");
        assert_eq!(credentials.refresh_token().await.unwrap(), "abc");
    }
}
