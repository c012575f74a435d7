use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::services::secrets::KaggleCredentials;

/// `owner/dataset[/version]` as used by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRef {
    pub owner: String,
    pub name: String,
    pub version: Option<u32>,
}

impl DatasetRef {
    pub fn parse(slug: &str) -> Result<Self> {
        let parts: Vec<&str> = slug.trim().split('/').collect();
        let valid_part = |p: &str| {
            !p.is_empty()
                && p.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };

        match parts.as_slice() {
            [owner, name] if valid_part(owner) && valid_part(name) => Ok(Self {
                owner: owner.to_string(),
                name: name.to_string(),
                version: None,
            }),
            [owner, name, version] if valid_part(owner) && valid_part(name) => {
                let version = version
                    .parse()
                    .map_err(|_| anyhow!("Invalid dataset version in {:?}", slug))?;
                Ok(Self {
                    owner: owner.to_string(),
                    name: name.to_string(),
                    version: Some(version),
                })
            }
            _ => Err(anyhow!(
                "Dataset must be in the form owner/dataset-name, got {:?}",
                slug
            )),
        }
    }

    pub fn download_path(&self) -> String {
        format!("datasets/download/{}/{}", self.owner, self.name)
    }
}

#[async_trait]
pub trait DatasetProvider: Send + Sync {
    /// Downloads the dataset and extracts its files under `dest`.
    async fn download_and_extract(&self, dataset: &str, dest: &Path) -> Result<()>;
}

/// Client for the provider's public REST API. Credentials are handed in at
/// construction and never leave this struct.
pub struct KaggleClient {
    http: reqwest::Client,
    api_base: String,
    credentials: KaggleCredentials,
}

impl KaggleClient {
    pub fn new(http: reqwest::Client, api_base: &str, credentials: KaggleCredentials) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    async fn download_archive(&self, dataset: &DatasetRef, archive: &NamedTempFile) -> Result<u64> {
        let url = format!("{}/{}", self.api_base, dataset.download_path());
        let mut request = self
            .http
            .get(&url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.key));
        if let Some(version) = dataset.version {
            request = request.query(&[("datasetVersionNumber", version)]);
        }

        let mut response = request
            .send()
            .await
            .with_context(|| format!("Dataset download request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Dataset provider returned HTTP {} for {}/{}: {}",
                status,
                dataset.owner,
                dataset.name,
                body
            ));
        }

        let handle = archive
            .as_file()
            .try_clone()
            .with_context(|| format!("Cannot write {}", archive.path().display()))?;
        let mut file = tokio::fs::File::from_std(handle);
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .context("Dataset download interrupted")?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }
}

#[async_trait]
impl DatasetProvider for KaggleClient {
    async fn download_and_extract(&self, dataset: &str, dest: &Path) -> Result<()> {
        let dataset = DatasetRef::parse(dataset)?;
        tokio::fs::create_dir_all(dest)
            .await
            .with_context(|| format!("Cannot create {}", dest.display()))?;

        let archive = staging_archive(dest, &dataset.name)?;
        let size = self.download_archive(&dataset, &archive).await?;
        info!(
            "📦 Downloaded {}/{} ({} bytes)",
            dataset.owner, dataset.name, size
        );

        let target = dest.to_path_buf();
        // the staged archive is deleted when it is dropped with the closure
        let extracted = tokio::task::spawn_blocking(move || extract_zip(archive.path(), &target))
            .await
            .context("Extraction task panicked")??;

        info!(
            "-> Dataset downloaded and extracted into: {} ({} files)",
            dest.display(),
            extracted.len()
        );
        Ok(())
    }
}

/// Temporary file for the downloaded archive, next to `dest` rather than
/// inside it, so no extracted entry can collide with it.
pub fn staging_archive(dest: &Path, dataset_name: &str) -> io::Result<NamedTempFile> {
    let dir = dest.parent().unwrap_or(dest);
    tempfile::Builder::new()
        .prefix(&format!("{}-", dataset_name))
        .suffix(".zip")
        .tempfile_in(dir)
}

/// Extracts a zip archive into `dest`. Entries whose path would escape
/// `dest` are rejected.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(archive_path)
        .with_context(|| format!("Cannot open {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("{} is not a valid zip archive", archive_path.display()))?;

    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let relative = entry
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| anyhow!("Archive entry escapes target directory: {}", entry.name()))?;
        let out_path = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)
            .with_context(|| format!("Cannot create {}", out_path.display()))?;
        io::copy(&mut entry, &mut out)?;
        debug!("Extracted {}", relative.display());
        extracted.push(out_path);
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::HeaderMap, routing::get};
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use zip::write::FileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_parse_dataset_ref() {
        let r = DatasetRef::parse("jillanisofttech/flight-price-prediction-dataset").unwrap();
        assert_eq!(r.owner, "jillanisofttech");
        assert_eq!(r.name, "flight-price-prediction-dataset");
        assert_eq!(r.version, None);
        assert_eq!(
            r.download_path(),
            "datasets/download/jillanisofttech/flight-price-prediction-dataset"
        );

        let versioned = DatasetRef::parse("org/dataset/3").unwrap();
        assert_eq!(versioned.version, Some(3));
    }

    #[test]
    fn test_parse_dataset_ref_rejects_bad_slugs() {
        assert!(DatasetRef::parse("just-a-name").is_err());
        assert!(DatasetRef::parse("org/").is_err());
        assert!(DatasetRef::parse("org/data set").is_err());
        assert!(DatasetRef::parse("org/dataset/latest").is_err());
        assert!(DatasetRef::parse("a/b/1/2").is_err());
    }

    #[test]
    fn test_extract_zip_nested() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("dataset.zip");
        write_zip(
            &archive,
            &[("a.xlsx", b"not really"), ("sub/b.csv", b"x,y\n1,2\n")],
        );

        let out = dir.path().join("out");
        let files = extract_zip(&archive, &out).unwrap();
        assert_eq!(files.len(), 2);
        assert!(out.join("a.xlsx").is_file());
        assert_eq!(fs::read(out.join("sub/b.csv")).unwrap(), b"x,y\n1,2\n");
    }

    #[test]
    fn test_extract_zip_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", b"boom")]);

        let out = dir.path().join("out");
        assert!(extract_zip(&archive, &out).is_err());
        assert!(!dir.path().join("escape.txt").exists());
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.zip");
        write_zip(&path, entries);
        fs::read(path).unwrap()
    }

    async fn spawn_provider(payload: Vec<u8>) -> (String, Arc<Mutex<Option<String>>>) {
        let seen_auth = Arc::new(Mutex::new(None));
        let sink = seen_auth.clone();
        let app = Router::new().route(
            "/api/v1/datasets/download/org/dataset",
            get(move |headers: HeaderMap| {
                let sink = sink.clone();
                let payload = payload.clone();
                async move {
                    *sink.lock().unwrap() = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.to_string());
                    payload
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/api/v1", addr), seen_auth)
    }

    fn credentials() -> KaggleCredentials {
        KaggleCredentials {
            username: "jdoe".to_string(),
            key: "0123abcd".to_string(),
        }
    }

    #[tokio::test]
    async fn test_download_keeps_entry_named_like_archive() {
        let payload = zip_bytes(&[
            ("dataset.zip", b"inner archive bytes"),
            ("flights.xlsx", b"sheet"),
        ]);
        let (base, seen_auth) = spawn_provider(payload).await;

        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("ingest-1");
        let client = KaggleClient::new(reqwest::Client::new(), &base, credentials());
        client.download_and_extract("org/dataset", &dest).await.unwrap();

        assert_eq!(fs::read(dest.join("dataset.zip")).unwrap(), b"inner archive bytes");
        assert_eq!(fs::read(dest.join("flights.xlsx")).unwrap(), b"sheet");

        // staged archive is gone; only the extraction root is left
        let left: Vec<_> = fs::read_dir(root.path()).unwrap().collect();
        assert_eq!(left.len(), 1);

        // base64("jdoe:0123abcd")
        assert_eq!(
            seen_auth.lock().unwrap().as_deref(),
            Some("Basic amRvZTowMTIzYWJjZA==")
        );
    }

    #[test]
    fn test_staging_archive_is_outside_dest() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("ingest-1");
        fs::create_dir_all(&dest).unwrap();

        let staged = staging_archive(&dest, "dataset").unwrap();
        assert!(!staged.path().starts_with(&dest));
        assert_eq!(staged.path().parent().unwrap(), root.path());
    }

    #[test]
    fn test_extract_zip_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("dataset.zip");
        fs::write(&archive, b"<html>Sign in</html>").unwrap();
        assert!(extract_zip(&archive, dir.path()).is_err());
    }
}
