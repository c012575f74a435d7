use async_recursion::async_recursion;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

/// Invocation-local working directory. Removed by [`ScratchDir::close`], or
/// on drop if the invocation bails out early.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    /// Creates a uniquely named directory under `root`, creating `root` too
    /// if needed.
    pub async fn create(root: &Path) -> io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let root = root.to_path_buf();
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix("ingest-").tempdir_in(&root)
        })
        .await
        .map_err(io::Error::other)??;
        info!("📁 Scratch directory: {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the directory and everything in it on the blocking pool. A
    /// failed removal is logged and otherwise ignored; the response is
    /// already decided.
    pub async fn close(self) {
        let path = self.dir.path().to_path_buf();
        let dir = self.dir;
        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => info!("Temporary directory removed: {}", path.display()),
            Ok(Err(e)) => warn!("⚠️  Could not remove {}: {}", path.display(), e),
            Err(e) => warn!("⚠️  Removal of {} did not finish: {}", path.display(), e),
        }
    }
}

/// Regular files under `root`, depth first, in directory listing order.
pub async fn list_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    walk(root.to_path_buf(), &mut files).await?;
    Ok(files)
}

#[async_recursion]
async fn walk(dir: PathBuf, files: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            walk(entry.path(), files).await?;
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(())
}
