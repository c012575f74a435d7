//! Ambient workload identity.
//!
//! Tokens come from whatever the hosting environment provides: a service
//! principal exported in the environment, the App Service / Functions
//! managed identity endpoint, or the instance metadata service. No static
//! secret is ever read from the function's own configuration.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::EnvSource;

pub const KEY_VAULT_RESOURCE: &str = "https://vault.azure.net";
pub const STORAGE_RESOURCE: &str = "https://storage.azure.com";

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Bearer token for the given resource (audience) URI.
    async fn get_token(&self, resource: &str) -> Result<AccessToken>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    fn into_token(self) -> AccessToken {
        // expires_on is epoch seconds, sometimes as a string; expires_in is relative
        let as_i64 = |v: &serde_json::Value| match v {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        };
        let expires_on = self
            .expires_on
            .as_ref()
            .and_then(as_i64)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| {
                self.expires_in
                    .as_ref()
                    .and_then(as_i64)
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
            });

        AccessToken {
            token: self.access_token,
            expires_on,
        }
    }
}

async fn read_token(response: reqwest::Response, source: &str) -> Result<AccessToken> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("{} token request failed: HTTP {} - {}", source, status, body));
    }
    let parsed: TokenResponse = response
        .json()
        .await
        .with_context(|| format!("{} returned an unreadable token response", source))?;
    Ok(parsed.into_token())
}

/// Service principal taken from `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and
/// `AZURE_CLIENT_SECRET`.
pub struct ClientSecretCredential {
    http: reqwest::Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

impl ClientSecretCredential {
    pub fn new(
        http: reqwest::Client,
        tenant_id: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            http,
            authority: AUTHORITY_HOST.to_string(),
            tenant_id,
            client_id,
            client_secret,
        }
    }

    pub fn from_source(http: reqwest::Client, source: &EnvSource) -> Option<Self> {
        let tenant_id = source.non_empty("AZURE_TENANT_ID")?;
        let client_id = source.non_empty("AZURE_CLIENT_ID")?;
        let client_secret = source.non_empty("AZURE_CLIENT_SECRET")?;
        let mut credential = Self::new(http, tenant_id, client_id, client_secret);
        if let Some(authority) = source.non_empty("AZURE_AUTHORITY_HOST") {
            credential.authority = authority.trim_end_matches('/').to_string();
        }
        Some(credential)
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken> {
        let url = format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id);
        let scope = format!("{}/.default", resource.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .context("Service principal token request could not be sent")?;
        read_token(response, "Service principal").await
    }
}

/// Managed identity of the hosting compute.
pub enum ManagedIdentityCredential {
    /// App Service / Functions identity endpoint.
    AppService {
        http: reqwest::Client,
        endpoint: String,
        header: String,
        client_id: Option<String>,
    },
    /// Azure instance metadata service.
    Imds {
        http: reqwest::Client,
        client_id: Option<String>,
    },
}

impl ManagedIdentityCredential {
    pub fn from_source(http: reqwest::Client, source: &EnvSource) -> Self {
        let client_id = source.non_empty("AZURE_CLIENT_ID");
        match (
            source.non_empty("IDENTITY_ENDPOINT"),
            source.non_empty("IDENTITY_HEADER"),
        ) {
            (Some(endpoint), Some(header)) => Self::AppService {
                http,
                endpoint,
                header,
                client_id,
            },
            _ => Self::Imds { http, client_id },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::AppService { .. } => "App Service managed identity",
            Self::Imds { .. } => "IMDS managed identity",
        }
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken> {
        let request = match self {
            Self::AppService {
                http,
                endpoint,
                header,
                client_id,
            } => {
                let mut query = vec![("api-version", "2019-08-01"), ("resource", resource)];
                if let Some(id) = client_id {
                    query.push(("client_id", id.as_str()));
                }
                http.get(endpoint)
                    .header("X-IDENTITY-HEADER", header)
                    .query(&query)
            }
            Self::Imds { http, client_id } => {
                let mut query = vec![("api-version", "2018-02-01"), ("resource", resource)];
                if let Some(id) = client_id {
                    query.push(("client_id", id.as_str()));
                }
                http.get(IMDS_ENDPOINT)
                    .header("Metadata", "true")
                    .query(&query)
            }
        };

        let response = request
            .send()
            .await
            .with_context(|| format!("{} is unreachable", self.name()))?;
        read_token(response, self.name()).await
    }
}

/// Tokens closer than this to expiry are fetched again.
const REFRESH_MARGIN_SECS: i64 = 300;

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_on
            .is_some_and(|exp| exp - chrono::Duration::seconds(REFRESH_MARGIN_SECS) > now)
    }
}

/// Ordered chain of credentials; the first one that issues a token is used.
/// Tokens are cached per resource until shortly before they expire.
pub struct DefaultCredential {
    chain: Vec<Box<dyn TokenCredential>>,
    cache: Mutex<HashMap<String, AccessToken>>,
}

impl DefaultCredential {
    fn new(chain: Vec<Box<dyn TokenCredential>>) -> Self {
        Self {
            chain,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_source(http: reqwest::Client, source: &EnvSource) -> Self {
        let mut chain: Vec<Box<dyn TokenCredential>> = Vec::new();
        if let Some(sp) = ClientSecretCredential::from_source(http.clone(), source) {
            tracing::info!("🔑 Using service principal from environment");
            chain.push(Box::new(sp));
        }
        chain.push(Box::new(ManagedIdentityCredential::from_source(http, source)));
        Self::new(chain)
    }

    pub fn into_shared(self) -> Arc<dyn TokenCredential> {
        Arc::new(self)
    }
}

#[async_trait]
impl TokenCredential for DefaultCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken> {
        // held across the fetch so concurrent callers wait for one request
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.get(resource).filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.clone());
        }

        let mut failures = Vec::new();
        for credential in &self.chain {
            match credential.get_token(resource).await {
                Ok(token) => {
                    if token.is_fresh(Utc::now()) {
                        cache.insert(resource.to_string(), token.clone());
                    }
                    return Ok(token);
                }
                Err(e) => failures.push(format!("{:#}", e)),
            }
        }
        Err(anyhow!(
            "No ambient credential could issue a token for {}: {}",
            resource,
            failures.join("; ")
        ))
    }
}
