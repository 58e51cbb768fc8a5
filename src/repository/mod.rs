//! Content repositories that jobs read from and write to.

mod local;

pub use crate::jobs::RepositoryRef;
pub(crate) use local::scan_directory;
pub use local::{LocalRepository, RepositorySettings, StaticRepositoryResolver};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("unknown repository {0}")]
    UnknownRepository(RepositoryRef),

    #[error("path not found: {0}")]
    NotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("repository {0} is read-only")]
    ReadOnly(RepositoryRef),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub namespace: String,
    pub name: String,
    /// Branch used when a job gives no explicit ref.
    pub branch: String,
    pub read_only: bool,
    /// Whether content may be pulled from this repository.
    pub sync_enabled: bool,
}

impl RepositoryInfo {
    pub fn reference(&self) -> RepositoryRef {
        RepositoryRef::new(self.namespace.clone(), self.name.clone())
    }
}

/// A file in a repository listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Slash-separated path relative to the repository root.
    pub path: String,
    /// Hex SHA-256 of the content.
    pub hash: String,
    pub size: u64,
}

/// Handle on one repository. `git_ref` of `None` means the default branch.
#[async_trait]
pub trait Repository: Send + Sync {
    fn info(&self) -> &RepositoryInfo;

    /// Every file on `git_ref`, sorted by path.
    async fn list(&self, git_ref: Option<&str>) -> Result<Vec<FileEntry>, RepositoryError>;

    async fn read(&self, path: &str, git_ref: Option<&str>) -> Result<Vec<u8>, RepositoryError>;

    async fn write(
        &self,
        path: &str,
        data: &[u8],
        git_ref: Option<&str>,
        message: &str,
    ) -> Result<(), RepositoryError>;

    /// Delete a file, or a whole directory when `path` ends with `/`.
    async fn delete(
        &self,
        path: &str,
        git_ref: Option<&str>,
        message: &str,
    ) -> Result<(), RepositoryError>;

    async fn rename(
        &self,
        from: &str,
        to: &str,
        git_ref: Option<&str>,
        message: &str,
    ) -> Result<(), RepositoryError>;
}

/// Turns a job's repository reference into a live handle.
#[async_trait]
pub trait RepositoryResolver: Send + Sync {
    async fn resolve(
        &self,
        reference: &RepositoryRef,
    ) -> Result<Arc<dyn Repository>, RepositoryError>;
}

pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Validate a relative, slash-separated path. A trailing `/` is kept.
pub fn normalize_path(path: &str) -> Result<String, RepositoryError> {
    let trimmed = path.trim_start_matches("./");
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.contains('\\') {
        return Err(RepositoryError::InvalidPath(path.to_string()));
    }
    let is_dir = trimmed.ends_with('/');
    let parts: Vec<&str> = trimmed.split('/').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() || parts.iter().any(|p| *p == "." || *p == "..") {
        return Err(RepositoryError::InvalidPath(path.to_string()));
    }
    let mut normalized = parts.join("/");
    if is_dir {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Last path segment, keeping a trailing `/` for directories.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    let start = trimmed.rfind('/').map(|i| i + 1).unwrap_or(0);
    &path[start..]
}
