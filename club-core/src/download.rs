//! Saving a single remote photo to the local download directory.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::util::url_basename;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Write permission denied for {}: {reason}", .dir.display())]
pub struct PermissionDenied {
    pub dir: PathBuf,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),
    #[error("Cannot derive a file name from {0}")]
    InvalidUrl(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server returned {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scoped write access to a directory. Released when dropped; nothing is
/// held once the download is over.
#[derive(Debug)]
pub struct WriteGrant {
    dir: PathBuf,
}

impl WriteGrant {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for WriteGrant {
    fn drop(&mut self) {
        debug!("Released write grant for {}", self.dir.display());
    }
}

/// Asks the platform for permission to write into a directory.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn acquire_write(&self, dir: &Path) -> Result<WriteGrant, PermissionDenied>;
}

/// Grants access when the directory exists (or can be created) and is not
/// read-only.
pub struct DirectoryPermission;

#[async_trait]
impl PermissionGate for DirectoryPermission {
    async fn acquire_write(&self, dir: &Path) -> Result<WriteGrant, PermissionDenied> {
        let denied = |reason: String| PermissionDenied {
            dir: dir.to_path_buf(),
            reason,
        };

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| denied(e.to_string()))?;
        let metadata = tokio::fs::metadata(dir)
            .await
            .map_err(|e| denied(e.to_string()))?;
        if metadata.permissions().readonly() {
            return Err(denied("directory is read-only".to_string()));
        }

        Ok(WriteGrant::new(dir))
    }
}

/// Where downloads land: `$DOWNLOADS/Club`, falling back to the current
/// directory when the platform has no downloads folder.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Club")
}

pub struct DownloadAgent {
    client: reqwest::Client,
    dir: PathBuf,
    gate: Arc<dyn PermissionGate>,
}

impl DownloadAgent {
    pub fn new(dir: impl Into<PathBuf>, gate: Arc<dyn PermissionGate>) -> Self {
        Self {
            client: reqwest::Client::new(),
            dir: dir.into(),
            gate,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stream `url` into the download directory under the URL's file name.
    ///
    /// Bytes go to a `.part` file first and are renamed into place once
    /// complete, so a failed download never leaves a truncated photo behind.
    pub async fn download(&self, url: &str) -> Result<PathBuf, DownloadError> {
        let grant = self.gate.acquire_write(&self.dir).await.inspect_err(|e| {
            warn!("Download of {} blocked: {}", url, e);
        })?;

        let name = url_basename(url).ok_or_else(|| DownloadError::InvalidUrl(url.to_string()))?;
        let target = grant.dir().join(&name);
        let partial = grant.dir().join(format!("{name}.part"));

        match self.fetch_to(url, &partial).await {
            Ok(bytes) => {
                tokio::fs::rename(&partial, &target).await?;
                info!("Downloaded {} ({} bytes) to {}", url, bytes, target.display());
                Ok(target)
            }
            Err(e) => {
                warn!("Download of {} failed: {}", url, e);
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!("Could not remove {}: {}", partial.display(), cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    async fn fetch_to(&self, url: &str, path: &Path) -> Result<u64, DownloadError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path as UrlPath, http::StatusCode, routing::get, Router};
    use tempfile::TempDir;

    async fn serve() -> String {
        let app = Router::new()
            .route(
                "/files/:name",
                get(|UrlPath(name): UrlPath<String>| async move { format!("contents of {name}") }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    struct Deny;

    #[async_trait]
    impl PermissionGate for Deny {
        async fn acquire_write(&self, dir: &Path) -> Result<WriteGrant, PermissionDenied> {
            Err(PermissionDenied {
                dir: dir.to_path_buf(),
                reason: "user declined".into(),
            })
        }
    }

    #[tokio::test]
    async fn saves_under_url_basename() {
        let base = serve().await;
        let dir = TempDir::new().unwrap();
        let agent = DownloadAgent::new(dir.path().join("Club"), Arc::new(DirectoryPermission));

        let path = agent
            .download(&format!("{base}/files/gala.jpg?alt=media"))
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("Club").join("gala.jpg"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "contents of gala.jpg");
        assert!(!dir.path().join("Club").join("gala.jpg.part").exists());
    }

    #[tokio::test]
    async fn http_error_leaves_nothing_behind() {
        let base = serve().await;
        let dir = TempDir::new().unwrap();
        let agent = DownloadAgent::new(dir.path(), Arc::new(DirectoryPermission));

        let err = agent.download(&format!("{base}/missing")).await.unwrap_err();
        assert!(matches!(err, DownloadError::Status { status: 404, .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn denied_permission_fails_before_any_request() {
        let dir = TempDir::new().unwrap();
        let agent = DownloadAgent::new(dir.path(), Arc::new(Deny));

        // Nothing listens on port 9; the permission check must come first.
        let err = agent
            .download("http://127.0.0.1:9/files/a.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn url_without_file_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let agent = DownloadAgent::new(dir.path(), Arc::new(DirectoryPermission));
        let err = agent.download("https://example.com/").await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl(_)));
    }
}
