use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use tokio::fs;

/// Filesystem capability used for log directory creation.
#[async_trait]
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Recursively creates `path`; succeeds if it already exists.
    async fn ensure_dir(&self, path: &Path) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct TokioFileSystem;

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn ensure_dir(&self, path: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(path).await?;
        Ok(())
    }
}
