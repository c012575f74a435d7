use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::api::error::AppError;
use crate::config::{AppConfig, IngestSettings};
use crate::services::converter::{self, ConversionError, FileAction, FileKind};
use crate::services::dataset::DatasetProvider;
use crate::services::scratch::{self, ScratchDir};
use crate::services::secrets::{self, KaggleCredentials, SecretStore};
use crate::services::storage::ObjectStore;
use crate::utils::validation::blob_name_for;

pub const SUCCESS_MESSAGE: &str = "Dataset descargado y cargado correctamente.";

/// Builds the upstream clients for one invocation.
#[async_trait]
pub trait IngestBackends: Send + Sync {
    async fn secret_store(&self, vault_uri: &str) -> Result<Arc<dyn SecretStore>>;

    async fn dataset_provider(
        &self,
        credentials: KaggleCredentials,
    ) -> Result<Arc<dyn DatasetProvider>>;

    async fn object_store(&self, account: &str, container: &str) -> Result<Arc<dyn ObjectStore>>;
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SkippedFile {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IngestReport {
    pub message: String,
    pub dataset: String,
    pub uploaded: Vec<String>,
    pub skipped: Vec<SkippedFile>,
}

/// Result of preparing a single extracted file.
#[derive(Debug)]
enum Prepared {
    Upload { path: PathBuf, blob_name: String },
    Skip(String),
}

pub struct IngestService {
    backends: Arc<dyn IngestBackends>,
    config: AppConfig,
}

impl IngestService {
    pub fn new(backends: Arc<dyn IngestBackends>, config: AppConfig) -> Self {
        Self { backends, config }
    }

    /// Runs one ingestion: secrets, download, convert, upload. The scratch
    /// directory is gone when this returns, whatever the outcome.
    pub async fn run(&self, settings: &IngestSettings) -> Result<IngestReport, AppError> {
        info!("Opening Key Vault at {:?}", settings.key_vault_uri);
        let store = match self.backends.secret_store(&settings.key_vault_uri).await {
            Ok(store) => store,
            Err(e) => {
                error!("Could not create the secret client: {:?}", e);
                return Err(AppError::SecretStore(e));
            }
        };
        let credentials = secrets::resolve_kaggle_credentials(store.as_ref()).await?;

        let scratch = ScratchDir::create(&self.config.scratch_root).await?;
        let result = self.ingest_into(&scratch, settings, credentials).await;
        scratch.close().await;
        result
    }

    async fn ingest_into(
        &self,
        scratch: &ScratchDir,
        settings: &IngestSettings,
        credentials: KaggleCredentials,
    ) -> Result<IngestReport, AppError> {
        let provider = self
            .backends
            .dataset_provider(credentials)
            .await
            .map_err(AppError::Dataset)?;
        provider
            .download_and_extract(&settings.dataset, scratch.path())
            .await
            .map_err(AppError::Dataset)?;

        let sink = self
            .backends
            .object_store(&settings.storage_account, &settings.container)
            .await
            .map_err(AppError::Storage)?;
        info!("☁️  Uploading to {}", sink.location());

        // listed up front so CSVs written below are not picked up again
        let files = scratch::list_files(scratch.path()).await?;

        let mut report = IngestReport {
            message: SUCCESS_MESSAGE.to_string(),
            dataset: settings.dataset.clone(),
            uploaded: Vec::new(),
            skipped: Vec::new(),
        };

        for file in files {
            match self.prepare(&file).await {
                Prepared::Upload { path, blob_name } => {
                    info!("Uploading blob: {}", blob_name);
                    sink.put_object(&blob_name, &path)
                        .await
                        .map_err(AppError::Storage)?;
                    report.uploaded.push(blob_name);
                }
                Prepared::Skip(reason) => {
                    report.skipped.push(SkippedFile {
                        file: display_relative(scratch.path(), &file),
                        reason,
                    });
                }
            }
        }

        info!(
            "✅ Ingestion of {} finished: {} uploaded, {} skipped",
            settings.dataset,
            report.uploaded.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    async fn prepare(&self, file: &Path) -> Prepared {
        let kind = converter::classify(file);
        match converter::plan(kind, self.config.non_spreadsheet_policy) {
            FileAction::Skip => Prepared::Skip(match kind {
                FileKind::Archive => "archive".to_string(),
                _ => "not a spreadsheet".to_string(),
            }),
            FileAction::UploadAsIs => match blob_name_for(file) {
                Ok(blob_name) => Prepared::Upload {
                    path: file.to_path_buf(),
                    blob_name,
                },
                Err(e) => Prepared::Skip(e.to_string()),
            },
            FileAction::Convert => self.convert(file).await,
        }
    }

    async fn convert(&self, file: &Path) -> Prepared {
        let source = file.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || converter::convert_to_csv(&source)).await;

        let converted = match outcome {
            Ok(Ok(csv_path)) => csv_path,
            Ok(Err(ConversionError::NotFound(path))) => {
                error!("Error: file '{}' was not found.", path.display());
                return Prepared::Skip("file not found".to_string());
            }
            Ok(Err(e)) => {
                error!("Could not convert {}: {}", file.display(), e);
                return Prepared::Skip(format!("conversion failed: {}", e));
            }
            Err(e) => {
                error!("Conversion task for {} aborted: {}", file.display(), e);
                return Prepared::Skip("conversion aborted".to_string());
            }
        };

        info!(
            "'{}' converted to '{}'",
            file.display(),
            converted.display()
        );
        match blob_name_for(&converted) {
            Ok(blob_name) => Prepared::Upload {
                path: converted,
                blob_name,
            },
            Err(e) => {
                warn!("Converted file has no valid blob name: {}", e);
                Prepared::Skip(e.to_string())
            }
        }
    }
}

fn display_relative(root: &Path, file: &Path) -> String {
    file.strip_prefix(root)
        .unwrap_or(file)
        .to_string_lossy()
        .replace('\\', "/")
}
