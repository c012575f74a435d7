use crate::config::AppConfig;
use crate::services::storage::S3ObjectStore;
use anyhow::{Result, anyhow};
use aws_sdk_s3::config::Region;
use tracing::info;

/// S3-compatible client for local runs. The bucket is the target container.
pub async fn setup_s3_store(config: &AppConfig, bucket: &str) -> Result<S3ObjectStore> {
    let endpoint_url = config
        .s3_endpoint
        .clone()
        .ok_or_else(|| anyhow!("S3_ENDPOINT must be set for the s3 storage backend"))?;
    let access_key = config
        .s3_access_key
        .clone()
        .ok_or_else(|| anyhow!("S3_ACCESS_KEY must be set for the s3 storage backend"))?;
    let secret_key = config
        .s3_secret_key
        .clone()
        .ok_or_else(|| anyhow!("S3_SECRET_KEY must be set for the s3 storage backend"))?;

    info!("☁️  S3 Storage: {} (Bucket: {})", endpoint_url, bucket);

    let aws_config = aws_config::from_env()
        .endpoint_url(&endpoint_url)
        .region(Region::new(config.s3_region.clone()))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);
    Ok(S3ObjectStore::new(s3_client, bucket.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvSource, StorageBackend};
    use crate::services::storage::ObjectStore;

    fn s3_config(pairs: &[(&str, &str)]) -> AppConfig {
        let mut all = vec![("STORAGE_BACKEND", "s3")];
        all.extend_from_slice(pairs);
        AppConfig::from_source(&EnvSource::fixed(all))
    }

    #[tokio::test]
    async fn test_s3_store_needs_endpoint_and_keys() {
        let config = s3_config(&[("S3_ACCESS_KEY", "a"), ("S3_SECRET_KEY", "b")]);
        assert_eq!(config.storage_backend, StorageBackend::S3);
        let err = setup_s3_store(&config, "raw").await.err().unwrap();
        assert!(err.to_string().contains("S3_ENDPOINT"));

        let config = s3_config(&[("S3_ENDPOINT", "http://127.0.0.1:9000"), ("S3_ACCESS_KEY", "a")]);
        let err = setup_s3_store(&config, "raw").await.err().unwrap();
        assert!(err.to_string().contains("S3_SECRET_KEY"));
    }

    #[tokio::test]
    async fn test_s3_store_from_config() {
        let config = s3_config(&[
            ("S3_ENDPOINT", "http://127.0.0.1:9000"),
            ("S3_ACCESS_KEY", "minioadmin"),
            ("S3_SECRET_KEY", "minio-secret"),
        ]);
        let store = setup_s3_store(&config, "raw").await.unwrap();
        assert_eq!(store.location(), "s3://raw");
    }
}
