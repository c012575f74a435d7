use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{AppConfig, EnvSource, StorageBackend};
use crate::infrastructure::storage::setup_s3_store;
use crate::services::dataset::{DatasetProvider, KaggleClient};
use crate::services::identity::{DefaultCredential, TokenCredential};
use crate::services::ingest::IngestBackends;
use crate::services::secrets::{KaggleCredentials, KeyVaultClient, SecretStore};
use crate::services::storage::{AzureBlobStore, ObjectStore};

/// Production clients: Key Vault, the dataset provider's REST API and the
/// configured object storage, all sharing one HTTP client and one ambient
/// identity.
pub struct CloudBackends {
    http: reqwest::Client,
    credential: Arc<dyn TokenCredential>,
    config: AppConfig,
}

impl CloudBackends {
    pub fn new(config: AppConfig, source: &EnvSource) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent(concat!("kaggle-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        let credential = DefaultCredential::from_source(http.clone(), source).into_shared();

        Ok(Self {
            http,
            credential,
            config,
        })
    }
}

#[async_trait]
impl IngestBackends for CloudBackends {
    async fn secret_store(&self, vault_uri: &str) -> Result<Arc<dyn SecretStore>> {
        let client = KeyVaultClient::new(self.http.clone(), vault_uri, self.credential.clone())?;
        info!("SecretClient created");
        Ok(Arc::new(client))
    }

    async fn dataset_provider(
        &self,
        credentials: KaggleCredentials,
    ) -> Result<Arc<dyn DatasetProvider>> {
        Ok(Arc::new(KaggleClient::new(
            self.http.clone(),
            &self.config.kaggle_api_base,
            credentials,
        )))
    }

    async fn object_store(&self, account: &str, container: &str) -> Result<Arc<dyn ObjectStore>> {
        match self.config.storage_backend {
            StorageBackend::Azure => Ok(Arc::new(AzureBlobStore::new(
                self.http.clone(),
                account,
                container,
                self.credential.clone(),
            ))),
            StorageBackend::S3 => Ok(Arc::new(setup_s3_store(&self.config, container).await?)),
        }
    }
}
