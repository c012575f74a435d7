use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};
use url::Url;

use crate::api::error::AppError;
use crate::services::identity::{KEY_VAULT_RESOURCE, TokenCredential};
use crate::utils::validation::redacted_prefix;

pub const USERNAME_SECRET: &str = "kaggle-username";
pub const KEY_SECRET: &str = "kaggle-key";

const KEY_VAULT_API_VERSION: &str = "7.4";

/// Dataset provider credentials. Held in memory for one invocation only.
#[derive(Clone, PartialEq, Eq)]
pub struct KaggleCredentials {
    pub username: String,
    pub key: String,
}

impl std::fmt::Debug for KaggleCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KaggleCredentials")
            .field("username", &redacted_prefix(&self.username, 3))
            .field("key", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Current value of a named secret, `None` when the secret does not exist.
    async fn get_secret(&self, name: &str) -> Result<Option<String>>;
}

/// Key Vault secrets over the REST API, authorised with the ambient identity.
pub struct KeyVaultClient {
    http: reqwest::Client,
    vault_url: Url,
    credential: Arc<dyn TokenCredential>,
}

impl KeyVaultClient {
    pub fn new(
        http: reqwest::Client,
        vault_uri: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self> {
        let vault_url = Url::parse(vault_uri.trim())
            .with_context(|| format!("Invalid Key Vault URI {:?}", vault_uri))?;
        if vault_url.scheme() != "https" {
            return Err(anyhow!("Key Vault URI must use https: {}", vault_uri));
        }
        Ok(Self {
            http,
            vault_url,
            credential,
        })
    }

    fn secret_url(&self, name: &str) -> Result<Url> {
        let mut url = self.vault_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Key Vault URI cannot be a base: {}", self.vault_url))?
            .pop_if_empty()
            .push("secrets")
            .push(name);
        url.query_pairs_mut()
            .append_pair("api-version", KEY_VAULT_API_VERSION);
        Ok(url)
    }
}

#[derive(Deserialize)]
struct SecretBundle {
    value: Option<String>,
}

#[async_trait]
impl SecretStore for KeyVaultClient {
    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        let token = self.credential.get_token(KEY_VAULT_RESOURCE).await?;
        let url = self.secret_url(name)?;

        let response = self
            .http
            .get(url)
            .bearer_auth(&token.token)
            .send()
            .await
            .with_context(|| format!("Key Vault request for secret '{}' failed", name))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Key Vault returned HTTP {} for secret '{}': {}",
                status,
                name,
                body
            ));
        }

        let bundle: SecretBundle = response
            .json()
            .await
            .with_context(|| format!("Secret '{}' has an unreadable body", name))?;
        Ok(bundle.value)
    }
}

/// Reads both provider secrets. Store failures are server errors; absent or
/// empty values are the caller's configuration problem.
pub async fn resolve_kaggle_credentials(
    store: &dyn SecretStore,
) -> Result<KaggleCredentials, AppError> {
    info!("Reading secret '{}'", USERNAME_SECRET);
    let username = match store.get_secret(USERNAME_SECRET).await {
        Ok(value) => value.unwrap_or_default(),
        Err(e) => {
            error!("Could not read secret '{}': {:?}", USERNAME_SECRET, e);
            return Err(AppError::SecretStore(e));
        }
    };
    if !username.is_empty() {
        info!("Secret read OK: starts with {}…", redacted_prefix(&username, 3));
    }

    let key = store
        .get_secret(KEY_SECRET)
        .await
        .map_err(AppError::SecretStore)?
        .unwrap_or_default();

    if username.trim().is_empty() || key.trim().is_empty() {
        return Err(AppError::MissingCredentials);
    }

    Ok(KaggleCredentials { username, key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::identity::AccessToken;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StaticToken;

    #[async_trait]
    impl TokenCredential for StaticToken {
        async fn get_token(&self, _resource: &str) -> Result<AccessToken> {
            Ok(AccessToken {
                token: "t".to_string(),
                expires_on: None,
            })
        }
    }

    struct MapStore {
        values: HashMap<&'static str, &'static str>,
        fail_on: Option<&'static str>,
        reads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SecretStore for MapStore {
        async fn get_secret(&self, name: &str) -> Result<Option<String>> {
            self.reads.lock().unwrap().push(name.to_string());
            if self.fail_on == Some(name) {
                return Err(anyhow!("Forbidden by access policy"));
            }
            Ok(self.values.get(name).map(|v| v.to_string()))
        }
    }

    fn map_store(values: &[(&'static str, &'static str)], fail_on: Option<&'static str>) -> MapStore {
        MapStore {
            values: values.iter().copied().collect(),
            fail_on,
            reads: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_secret_url() {
        let client = KeyVaultClient::new(
            reqwest::Client::new(),
            "https://kv-ingest.vault.azure.net/",
            Arc::new(StaticToken),
        )
        .unwrap();
        assert_eq!(
            client.secret_url(USERNAME_SECRET).unwrap().as_str(),
            "https://kv-ingest.vault.azure.net/secrets/kaggle-username?api-version=7.4"
        );
    }

    #[test]
    fn test_rejects_non_https_vault() {
        assert!(
            KeyVaultClient::new(
                reqwest::Client::new(),
                "http://kv-ingest.vault.azure.net",
                Arc::new(StaticToken)
            )
            .is_err()
        );
        assert!(KeyVaultClient::new(reqwest::Client::new(), "not a url", Arc::new(StaticToken)).is_err());
    }

    #[tokio::test]
    async fn test_resolve_credentials() {
        let store = map_store(&[(USERNAME_SECRET, "jdoe"), (KEY_SECRET, "0123abcd")], None);
        let creds = resolve_kaggle_credentials(&store).await.unwrap();
        assert_eq!(creds.username, "jdoe");
        assert_eq!(creds.key, "0123abcd");
        assert_eq!(*store.reads.lock().unwrap(), vec![USERNAME_SECRET, KEY_SECRET]);
    }

    #[tokio::test]
    async fn test_empty_secret_is_missing_credentials() {
        let store = map_store(&[(USERNAME_SECRET, "jdoe"), (KEY_SECRET, "")], None);
        assert!(matches!(
            resolve_kaggle_credentials(&store).await,
            Err(AppError::MissingCredentials)
        ));

        let store = map_store(&[(KEY_SECRET, "0123abcd")], None);
        assert!(matches!(
            resolve_kaggle_credentials(&store).await,
            Err(AppError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn test_store_failure_stops_before_key() {
        let store = map_store(&[(KEY_SECRET, "0123abcd")], Some(USERNAME_SECRET));
        assert!(matches!(
            resolve_kaggle_credentials(&store).await,
            Err(AppError::SecretStore(_))
        ));
        assert_eq!(*store.reads.lock().unwrap(), vec![USERNAME_SECRET]);
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = KaggleCredentials {
            username: "jdoe-the-analyst".to_string(),
            key: "0123abcd".to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("0123abcd"));
        assert!(!printed.contains("the-analyst"));
    }
}
