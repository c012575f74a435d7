use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::api::error::AppError;

/// Settings every invocation must find, in the order they are checked.
pub const REQUIRED_SETTINGS: [&str; 4] = [
    "KEY_VAULT_URI",
    "KAGGLE_DATASET",
    "DATALAKE_URI",
    "CONTAINER_NAME",
];

/// Where configuration values are looked up.
///
/// Handlers read invocation settings on every request, so tests swap the
/// process environment for a fixed map instead of mutating it.
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    #[default]
    Process,
    Fixed(Arc<HashMap<String, String>>),
}

impl EnvSource {
    pub fn fixed<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Fixed(Arc::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            EnvSource::Process => env::var(key).ok(),
            EnvSource::Fixed(map) => map.get(key).cloned(),
        }
    }

    /// Returns the value only when it is set and not blank.
    pub fn non_empty(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }
}

/// What happens to extracted files that are neither archives nor spreadsheets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonSpreadsheetPolicy {
    /// Try to read them as a workbook anyway; unreadable files are skipped.
    #[default]
    Convert,
    /// Upload them unchanged under their own name.
    Passthrough,
    /// Leave them out of the upload.
    Skip,
}

impl FromStr for NonSpreadsheetPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "convert" => Ok(Self::Convert),
            "passthrough" | "verbatim" => Ok(Self::Passthrough),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown non-spreadsheet policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// Azure Blob Storage reached with the ambient identity.
    #[default]
    Azure,
    /// Any S3-compatible endpoint (MinIO for local runs).
    S3,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "azure" | "blob" => Ok(Self::Azure),
            "s3" | "minio" => Ok(Self::S3),
            other => Err(format!("unknown storage backend '{}'", other)),
        }
    }
}

/// Service configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Parent directory of the per-invocation scratch directories
    pub scratch_root: PathBuf,

    /// Handling of extracted files that are not spreadsheets (default: convert)
    pub non_spreadsheet_policy: NonSpreadsheetPolicy,

    /// Object storage flavour (default: azure)
    pub storage_backend: StorageBackend,

    /// Dataset provider API root (default: "https://www.kaggle.com/api/v1")
    pub kaggle_api_base: String,

    /// Outbound HTTP timeout in seconds (default: 300)
    pub http_timeout_secs: u64,

    /// S3 endpoint, only used with the s3 backend
    pub s3_endpoint: Option<String>,

    /// S3 region (default: "us-east-1")
    pub s3_region: String,

    /// S3 access key pair, only used with the s3 backend
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            non_spreadsheet_policy: NonSpreadsheetPolicy::default(),
            storage_backend: StorageBackend::default(),
            kaggle_api_base: "https://www.kaggle.com/api/v1".to_string(),
            http_timeout_secs: 300,
            s3_endpoint: None,
            s3_region: "us-east-1".to_string(),
            s3_access_key: None,
            s3_secret_key: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_source(source: &EnvSource) -> Self {
        let default = Self::default();

        Self {
            scratch_root: source
                .non_empty("SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.scratch_root),

            non_spreadsheet_policy: source
                .non_empty("NON_SPREADSHEET_POLICY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.non_spreadsheet_policy),

            storage_backend: source
                .non_empty("STORAGE_BACKEND")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.storage_backend),

            kaggle_api_base: source
                .non_empty("KAGGLE_API_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(default.kaggle_api_base),

            http_timeout_secs: source
                .get("HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.http_timeout_secs),

            s3_endpoint: source.non_empty("S3_ENDPOINT"),

            s3_region: source.non_empty("S3_REGION").unwrap_or(default.s3_region),

            s3_access_key: source.non_empty("S3_ACCESS_KEY"),

            s3_secret_key: source.non_empty("S3_SECRET_KEY"),
        }
    }
}

/// Scratch directories live next to the deployed binary, like the rest of
/// the function package.
fn default_scratch_root() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(env::temp_dir)
}

/// The four settings an ingestion run needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    pub key_vault_uri: String,
    pub dataset: String,
    pub storage_account: String,
    pub container: String,
}

impl IngestSettings {
    /// Reads the required settings, stopping at the first one that is
    /// missing or blank.
    pub fn load(source: &EnvSource) -> Result<Self, AppError> {
        let [vault_key, dataset_key, account_key, container_key] = REQUIRED_SETTINGS;
        let require = |key: &'static str| {
            source
                .non_empty(key)
                .map(|v| v.trim().to_string())
                .ok_or(AppError::MissingSetting(key))
        };

        // field initialisers run top to bottom, so the first gap wins
        Ok(Self {
            key_vault_uri: require(vault_key)?,
            dataset: require(dataset_key)?,
            storage_account: require(account_key)?,
            container: require(container_key)?,
        })
    }
}
