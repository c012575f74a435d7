use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::CONTENT_LENGTH;
use std::path::Path;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::services::identity::{STORAGE_RESOURCE, TokenCredential};

const AZURE_API_VERSION: &str = "2023-11-03";

/// Everything except unreserved characters and '/' is escaped in blob paths.
const BLOB_PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Streams the local file at `path` into the object `name`, replacing
    /// any existing object.
    async fn put_object(&self, name: &str, path: &Path) -> Result<()>;

    /// Human-readable target, for logs.
    fn location(&self) -> String;
}

/// A container in Azure Blob Storage, written with Put Blob.
pub struct AzureBlobStore {
    http: reqwest::Client,
    base_url: String,
    container: String,
    credential: Arc<dyn TokenCredential>,
}

impl AzureBlobStore {
    pub fn new(
        http: reqwest::Client,
        account: &str,
        container: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> Self {
        Self {
            http,
            base_url: account_url(account),
            container: container.to_string(),
            credential,
        }
    }

    pub fn blob_url(&self, name: &str) -> String {
        let encoded = utf8_percent_encode(name, BLOB_PATH_ENCODE_SET).to_string();
        format!("{}/{}/{}", self.base_url, self.container, encoded)
    }
}

/// `https://<account>.blob.core.windows.net` from an account name. A full
/// endpoint URL is accepted as well.
pub fn account_url(account: &str) -> String {
    let account = account.trim().trim_end_matches('/');
    if account.starts_with("https://") || account.starts_with("http://") {
        account.to_string()
    } else {
        format!("https://{}.blob.core.windows.net", account)
    }
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    async fn put_object(&self, name: &str, path: &Path) -> Result<()> {
        let token = self.credential.get_token(STORAGE_RESOURCE).await?;
        let url = self.blob_url(name);

        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Cannot open {}", path.display()))?;
        // Put Blob refuses chunked transfer encoding
        let length = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();

        let response = self
            .http
            .put(&url)
            .bearer_auth(&token.token)
            .header("x-ms-date", date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-Type", "application/octet-stream")
            .header(CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Blob upload request for {} failed", name))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Azure upload of {}: HTTP {} - {}", name, status, body));
        }
        Ok(())
    }

    fn location(&self) -> String {
        format!("{}/{}", self.base_url, self.container)
    }
}

/// S3-compatible bucket, used for local runs against MinIO.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, name: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Cannot open {}", path.display()))?;
        let res = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .body(body)
            .send()
            .await;

        if let Err(e) = res {
            tracing::error!(
                "S3 put_object failed: bucket={}, key={}, error={:?}",
                self.bucket,
                name,
                e
            );
            return Err(e.into());
        }
        Ok(())
    }

    fn location(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::identity::AccessToken;
    use axum::{Router, http::HeaderMap, http::StatusCode, routing::put};
    use std::sync::Mutex;

    struct NoToken;

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

    #[async_trait]
    impl TokenCredential for NoToken {
        async fn get_token(&self, _resource: &str) -> Result<AccessToken> {
            Err(anyhow!("no identity in tests"))
        }
    }

    #[test]
    fn test_account_url() {
        assert_eq!(
            account_url("lakeaccount"),
            "https://lakeaccount.blob.core.windows.net"
        );
        assert_eq!(
            account_url("http://127.0.0.1:10000/devstoreaccount1/"),
            "http://127.0.0.1:10000/devstoreaccount1"
        );
    }

    #[test]
    fn test_blob_url_encoding() {
        let store = AzureBlobStore::new(reqwest::Client::new(), "lakeaccount", "raw", Arc::new(NoToken));
        assert_eq!(
            store.blob_url("Clean Dataset (2).csv"),
            "https://lakeaccount.blob.core.windows.net/raw/Clean%20Dataset%20%282%29.csv"
        );
        assert_eq!(store.location(), "https://lakeaccount.blob.core.windows.net/raw");
    }

    #[tokio::test]
    async fn test_upload_needs_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        std::fs::write(&path, "x").unwrap();

        let store = AzureBlobStore::new(reqwest::Client::new(), "lakeaccount", "raw", Arc::new(NoToken));
        let err = store.put_object("a.csv", &path).await.unwrap_err();
        assert!(err.to_string().contains("no identity"));
    }

    #[derive(Default)]
    struct ReceivedBlob {
        headers: Option<HeaderMap>,
        body: Vec<u8>,
    }

    #[tokio::test]
    async fn test_upload_streams_file_with_length() {
        let received = Arc::new(Mutex::new(ReceivedBlob::default()));
        let sink = received.clone();
        let app = Router::new().route(
            "/raw/*blob",
            put(move |headers: HeaderMap, body: axum::body::Bytes| {
                let sink = sink.clone();
                async move {
                    let mut blob = sink.lock().unwrap();
                    blob.headers = Some(headers);
                    blob.body = body.to_vec();
                    StatusCode::CREATED
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flights.csv");
        let content = "airline,price\n".repeat(20_000);
        std::fs::write(&path, &content).unwrap();

        let store = AzureBlobStore::new(
            reqwest::Client::new(),
            &format!("http://{}", addr),
            "raw",
            Arc::new(StaticToken),
        );
        store.put_object("flights.csv", &path).await.unwrap();

        let blob = received.lock().unwrap();
        assert_eq!(blob.body, content.as_bytes());
        let headers = blob.headers.as_ref().unwrap();
        assert_eq!(headers["content-length"], content.len().to_string().as_str());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers["x-ms-blob-type"], "BlockBlob");
        assert_eq!(headers["authorization"], "Bearer t");
    }
}
