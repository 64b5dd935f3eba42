//! Download Backend
//!
//! The download side of the coordinator: a backend interface mirroring a
//! system download manager (enqueue/query/remove plus completion events)
//! and an HTTP implementation of it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sideload_core::{DownloadId, SideloadError};

/// MIME type of Android package archives.
pub const APK_MIME: &str = "application/vnd.android.package-archive";

/// Completion channel depth.
const COMPLETION_CAPACITY: usize = 64;

/// Download errors
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<DownloadError> for SideloadError {
    fn from(e: DownloadError) -> Self {
        SideloadError::Download(e.to_string())
    }
}

/// Status reported by a download backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    Running,
    Paused,
    Successful,
    Failed,
}

impl DownloadStatus {
    /// Terminal statuses end the download polling sub-stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Successful | DownloadStatus::Failed)
    }
}

/// One download to enqueue
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Source URL of the artifact
    pub url: String,
    /// Human-readable title (the package name in practice)
    pub title: String,
    /// File name the artifact is stored under
    pub file_name: String,
    /// MIME type of the artifact
    pub mime_type: String,
}

impl DownloadRequest {
    /// Request for an APK artifact, deriving the file name from the URL.
    pub fn apk(url: &str, title: &str) -> Self {
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .unwrap_or("package.apk")
            .to_string();
        Self {
            url: url.to_string(),
            title: title.to_string(),
            file_name,
            mime_type: APK_MIME.to_string(),
        }
    }
}

/// Interface of the download backend the coordinator drives
#[async_trait]
pub trait DownloadBackend: Send + Sync {
    /// Enqueue a new download and return its handle
    async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId, DownloadError>;

    /// Current status of a download, `None` if the handle is unknown
    async fn query(&self, id: DownloadId) -> Result<Option<DownloadStatus>, DownloadError>;

    /// Remove a download, cancelling it if still running
    async fn remove(&self, id: DownloadId) -> Result<(), DownloadError>;

    /// Local path of a successfully downloaded artifact
    async fn local_artifact(&self, id: DownloadId) -> Result<Option<PathBuf>, DownloadError>;

    /// Receiver of completion events, fired for success and failure alike
    fn completion_events(&self) -> broadcast::Receiver<DownloadId>;
}

struct DownloadJob {
    status: DownloadStatus,
    target: PathBuf,
    worker: Option<JoinHandle<()>>,
}

/// HTTP download manager
///
/// Streams artifacts into a target directory and keeps a per-handle
/// status table, standing in for a platform download service.
pub struct HttpDownloadManager {
    client: Client,
    target_dir: PathBuf,
    next_id: AtomicU64,
    jobs: Arc<RwLock<HashMap<DownloadId, DownloadJob>>>,
    completed: broadcast::Sender<DownloadId>,
}

impl HttpDownloadManager {
    /// Create a manager downloading into `target_dir`
    pub fn new(target_dir: PathBuf, timeout_secs: u64) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        let (completed, _) = broadcast::channel(COMPLETION_CAPACITY);

        Ok(Self {
            client,
            target_dir,
            next_id: AtomicU64::new(1),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            completed,
        })
    }

    async fn run_download(client: Client, url: String, target: PathBuf) -> Result<(), DownloadError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::InvalidResponse(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(&target).await?;
        let mut stream = response.bytes_stream();

        use futures::StreamExt;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl DownloadBackend for HttpDownloadManager {
    async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId, DownloadError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let target = self.target_dir.join(&request.file_name);
        info!(
            "Enqueueing download {} for {} ({})",
            id, request.title, request.url
        );

        // Insert before spawning so queries see the job immediately
        self.jobs.write().insert(
            id,
            DownloadJob {
                status: DownloadStatus::Pending,
                target: target.clone(),
                worker: None,
            },
        );

        let client = self.client.clone();
        let jobs = Arc::clone(&self.jobs);
        let completed = self.completed.clone();
        let url = request.url.clone();

        let worker = tokio::spawn(async move {
            if let Some(job) = jobs.write().get_mut(&id) {
                job.status = DownloadStatus::Running;
            }

            let status = match Self::run_download(client, url, target).await {
                Ok(()) => {
                    info!("Download {} complete", id);
                    DownloadStatus::Successful
                }
                Err(e) => {
                    warn!("Download {} failed: {}", id, e);
                    DownloadStatus::Failed
                }
            };

            if let Some(job) = jobs.write().get_mut(&id) {
                job.status = status;
            }
            let _ = completed.send(id);
        });

        if let Some(job) = self.jobs.write().get_mut(&id) {
            job.worker = Some(worker);
        }

        Ok(id)
    }

    async fn query(&self, id: DownloadId) -> Result<Option<DownloadStatus>, DownloadError> {
        Ok(self.jobs.read().get(&id).map(|job| job.status))
    }

    async fn remove(&self, id: DownloadId) -> Result<(), DownloadError> {
        let job = self.jobs.write().remove(&id);
        if let Some(job) = job {
            if let Some(worker) = job.worker {
                worker.abort();
            }
            if tokio::fs::remove_file(&job.target).await.is_ok() {
                debug!("Removed artifact {:?}", job.target);
            }
        }
        Ok(())
    }

    async fn local_artifact(&self, id: DownloadId) -> Result<Option<PathBuf>, DownloadError> {
        let target = match self.jobs.read().get(&id) {
            Some(job) if job.status == DownloadStatus::Successful => job.target.clone(),
            _ => return Ok(None),
        };

        if tokio::fs::try_exists(&target).await? {
            Ok(Some(target))
        } else {
            Ok(None)
        }
    }

    fn completion_events(&self) -> broadcast::Receiver<DownloadId> {
        self.completed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP response on an ephemeral port and return the base URL.
    async fn serve_once(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let header = format!(
                    "{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status_line,
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });

        format!("http://{}", addr)
    }

    #[test]
    fn test_file_name_from_url() {
        let request = DownloadRequest::apk("https://host/repo/ext.apk", "com.example.ext");
        assert_eq!(request.file_name, "ext.apk");
        assert_eq!(request.mime_type, APK_MIME);

        let request = DownloadRequest::apk("https://host/repo/", "com.example.ext");
        assert_eq!(request.file_name, "package.apk");
    }

    #[tokio::test]
    async fn test_successful_download() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HttpDownloadManager::new(dir.path().to_path_buf(), 10).unwrap();
        let base = serve_once("HTTP/1.1 200 OK", b"apk-bytes").await;

        let mut completions = manager.completion_events();
        let id = manager
            .enqueue(DownloadRequest::apk(
                &format!("{}/ext.apk", base),
                "com.example.ext",
            ))
            .await
            .unwrap();

        let done = tokio::time::timeout(Duration::from_secs(10), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done, id);

        assert_eq!(
            manager.query(id).await.unwrap(),
            Some(DownloadStatus::Successful)
        );
        let artifact = manager.local_artifact(id).await.unwrap().unwrap();
        let contents = tokio::fs::read(&artifact).await.unwrap();
        assert_eq!(contents, b"apk-bytes");
    }

    #[tokio::test]
    async fn test_failed_download_still_signals_completion() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HttpDownloadManager::new(dir.path().to_path_buf(), 10).unwrap();
        let base = serve_once("HTTP/1.1 404 Not Found", b"").await;

        let mut completions = manager.completion_events();
        let id = manager
            .enqueue(DownloadRequest::apk(
                &format!("{}/missing.apk", base),
                "com.example.ext",
            ))
            .await
            .unwrap();

        let done = tokio::time::timeout(Duration::from_secs(10), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done, id);

        assert_eq!(
            manager.query(id).await.unwrap(),
            Some(DownloadStatus::Failed)
        );
        assert!(manager.local_artifact(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_forgets_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HttpDownloadManager::new(dir.path().to_path_buf(), 10).unwrap();

        // Unknown handles are a no-op
        manager.remove(99).await.unwrap();

        let base = serve_once("HTTP/1.1 200 OK", b"apk-bytes").await;
        let id = manager
            .enqueue(DownloadRequest::apk(
                &format!("{}/ext.apk", base),
                "com.example.ext",
            ))
            .await
            .unwrap();

        manager.remove(id).await.unwrap();
        assert_eq!(manager.query(id).await.unwrap(), None);
        assert!(manager.local_artifact(id).await.unwrap().is_none());
    }
}
