//! Privileged Installer
//!
//! Optional install path that commits packages through a privileged shell
//! without per-install confirmation. Built lazily by the coordinator and
//! reset through the teardown callback when its worker stops.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sideload_core::{DownloadId, SessionId, SideloadError};

/// Privileged shell the installer executes `pm` commands through
#[async_trait]
pub trait PrivilegedShell: Send + Sync {
    /// Run a shell command, returning stdout
    async fn run(&self, command: &str) -> Result<String, SideloadError>;
}

/// Where privileged install outcomes are reported
pub trait InstallResultSink: Send + Sync {
    /// Installation of a package finished
    fn result(&self, package: &str, success: bool);
}

struct QueuedInstall {
    download_id: DownloadId,
    package: String,
    artifact: PathBuf,
    session: SessionId,
}

/// Queue worker for the privileged install path
pub struct PrivilegedInstaller {
    queue_tx: mpsc::UnboundedSender<QueuedInstall>,
    queued: Arc<RwLock<HashSet<String>>>,
    next_session: AtomicI32,
}

impl PrivilegedInstaller {
    /// Build the installer and start its queue worker.
    ///
    /// Fails when the shell is not usable. `on_teardown` runs once when
    /// the worker stops, so the owner can drop and later rebuild the
    /// installer.
    pub async fn new(
        shell: Arc<dyn PrivilegedShell>,
        sink: Arc<dyn InstallResultSink>,
        on_teardown: Box<dyn FnOnce() + Send>,
    ) -> Result<Arc<Self>, SideloadError> {
        // Probe the shell before accepting work
        shell
            .run("pm path android")
            .await
            .map_err(|e| SideloadError::PrivilegedUnavailable(e.to_string()))?;

        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<QueuedInstall>();
        let queued = Arc::new(RwLock::new(HashSet::new()));
        let installer = Arc::new(Self {
            queue_tx,
            queued: Arc::clone(&queued),
            next_session: AtomicI32::new(1),
        });

        tokio::spawn(async move {
            while let Some(entry) = queue_rx.recv().await {
                let success = match Self::install_one(shell.as_ref(), &entry).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Privileged install of {} failed: {}", entry.package, e);
                        false
                    }
                };
                // Report before dequeueing so the package never looks
                // finished-but-unresolved to queue observers
                sink.result(&entry.package, success);
                queued.write().remove(&entry.package);
            }
            debug!("Privileged install queue closed");
            on_teardown();
        });

        Ok(installer)
    }

    /// Enqueue an artifact; returns the synthetic session id the
    /// coordinator tracks the install under
    pub fn enqueue(
        &self,
        download_id: DownloadId,
        package: &str,
        artifact: PathBuf,
    ) -> Result<SessionId, SideloadError> {
        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.queued.write().insert(package.to_string());
        info!(
            "Queueing privileged install of {} (download {}, session {})",
            package, download_id, session
        );
        self.queue_tx
            .send(QueuedInstall {
                download_id,
                package: package.to_string(),
                artifact,
                session,
            })
            .map_err(|_| SideloadError::PrivilegedUnavailable("install queue closed".into()))?;
        Ok(session)
    }

    /// Whether a package is waiting in, or being processed by, the queue
    pub fn is_queued(&self, package: &str) -> bool {
        self.queued.read().contains(package)
    }

    async fn install_one(
        shell: &dyn PrivilegedShell,
        entry: &QueuedInstall,
    ) -> Result<(), SideloadError> {
        debug!(
            "Committing {} (download {}, session {}) through the privileged shell",
            entry.package, entry.download_id, entry.session
        );

        let size = tokio::fs::metadata(&entry.artifact).await?.len();
        let created = shell.run("pm install-create -r").await?;
        let pm_session = parse_session_id(&created)?;

        shell
            .run(&format!(
                "pm install-write -S {} {} base.apk {}",
                size,
                pm_session,
                entry.artifact.display()
            ))
            .await?;

        let committed = shell.run(&format!("pm install-commit {}", pm_session)).await?;
        if committed.trim() != "Success" {
            return Err(SideloadError::Session(format!(
                "commit failed: {}",
                committed.trim()
            )));
        }

        Ok(())
    }
}

/// Pull the numeric session id out of `pm install-create` output,
/// e.g. "Success: created install session [1234]".
fn parse_session_id(output: &str) -> Result<SessionId, SideloadError> {
    let start = output.find('[');
    let end = output.find(']');
    match (start, end) {
        (Some(start), Some(end)) if start + 1 < end => output[start + 1..end]
            .parse()
            .map_err(|_| SideloadError::Session(format!("bad session id in: {}", output.trim()))),
        _ => Err(SideloadError::Session(format!(
            "unexpected install-create output: {}",
            output.trim()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct ScriptedShell {
        commands: Mutex<Vec<String>>,
        fail_commit: bool,
    }

    #[async_trait]
    impl PrivilegedShell for ScriptedShell {
        async fn run(&self, command: &str) -> Result<String, SideloadError> {
            self.commands.lock().push(command.to_string());
            if command.starts_with("pm install-create") {
                Ok("Success: created install session [1234]".to_string())
            } else if command.starts_with("pm install-commit") {
                if self.fail_commit {
                    Ok("Failure [INSTALL_FAILED_INVALID_APK]".to_string())
                } else {
                    Ok("Success".to_string())
                }
            } else {
                Ok(String::new())
            }
        }
    }

    struct RecordingSink {
        results: Mutex<Vec<(String, bool)>>,
    }

    impl InstallResultSink for RecordingSink {
        fn result(&self, package: &str, success: bool) {
            self.results.lock().push((package.to_string(), success));
        }
    }

    async fn wait_for_result(sink: &RecordingSink) -> (String, bool) {
        for _ in 0..100 {
            if let Some(result) = sink.results.lock().first().cloned() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no install result recorded");
    }

    #[test]
    fn test_parse_session_id() {
        assert_eq!(
            parse_session_id("Success: created install session [1234]").unwrap(),
            1234
        );
        assert!(parse_session_id("Failure").is_err());
        assert!(parse_session_id("Success []").is_err());
    }

    #[tokio::test]
    async fn test_queue_commits_and_reports_success() {
        let shell = Arc::new(ScriptedShell {
            commands: Mutex::new(Vec::new()),
            fail_commit: false,
        });
        let sink = Arc::new(RecordingSink {
            results: Mutex::new(Vec::new()),
        });

        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("ext.apk");
        tokio::fs::write(&apk, b"apk-bytes").await.unwrap();

        let installer = PrivilegedInstaller::new(
            Arc::clone(&shell) as Arc<dyn PrivilegedShell>,
            Arc::clone(&sink) as Arc<dyn InstallResultSink>,
            Box::new(|| {}),
        )
        .await
        .unwrap();

        installer.enqueue(1, "com.example.ext", apk).unwrap();
        assert!(installer.is_queued("com.example.ext"));

        let (package, success) = wait_for_result(&sink).await;
        assert_eq!(package, "com.example.ext");
        assert!(success);

        // The entry leaves the queue right after the result is reported
        for _ in 0..100 {
            if !installer.is_queued("com.example.ext") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!installer.is_queued("com.example.ext"));

        let commands = shell.commands.lock();
        assert!(commands.iter().any(|c| c.starts_with("pm install-create")));
        assert!(commands.iter().any(|c| c.starts_with("pm install-write")));
        assert!(commands
            .iter()
            .any(|c| c.starts_with("pm install-commit 1234")));
    }

    #[tokio::test]
    async fn test_commit_failure_reports_error() {
        let shell = Arc::new(ScriptedShell {
            commands: Mutex::new(Vec::new()),
            fail_commit: true,
        });
        let sink = Arc::new(RecordingSink {
            results: Mutex::new(Vec::new()),
        });

        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("ext.apk");
        tokio::fs::write(&apk, b"apk-bytes").await.unwrap();

        let installer = PrivilegedInstaller::new(
            Arc::clone(&shell) as Arc<dyn PrivilegedShell>,
            Arc::clone(&sink) as Arc<dyn InstallResultSink>,
            Box::new(|| {}),
        )
        .await
        .unwrap();

        installer.enqueue(1, "com.example.ext", apk).unwrap();
        let (_, success) = wait_for_result(&sink).await;
        assert!(!success);
    }

    #[tokio::test]
    async fn test_teardown_runs_when_queue_closes() {
        let shell = Arc::new(ScriptedShell {
            commands: Mutex::new(Vec::new()),
            fail_commit: false,
        });
        let sink = Arc::new(RecordingSink {
            results: Mutex::new(Vec::new()),
        });
        let (torn_tx, torn_rx) = tokio::sync::oneshot::channel();

        let installer = PrivilegedInstaller::new(
            shell,
            sink,
            Box::new(move || {
                let _ = torn_tx.send(());
            }),
        )
        .await
        .unwrap();

        drop(installer);
        tokio::time::timeout(Duration::from_secs(5), torn_rx)
            .await
            .unwrap()
            .unwrap();
    }
}
