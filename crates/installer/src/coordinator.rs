//! Install Coordinator
//!
//! Tracks every in-flight package operation, merges download-status and
//! install-session polling into one broadcast progress stream, and hands
//! finished downloads to the install path (standard launcher or the
//! privileged queue).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use futures::stream::{self, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sideload_core::{
    DownloadId, InstallInfo, InstallStep, ProgressBus, ProgressEvent, Result, SessionId,
    SessionInfo, SideloadConfig, SideloadError,
};

use crate::download::{DownloadBackend, DownloadRequest, DownloadStatus};
use crate::launcher::{InstallLauncher, InstallMode};
use crate::privileged::{InstallResultSink, PrivilegedInstaller, PrivilegedShell};
use crate::session::SessionBackend;

/// Callback for user-facing notices, e.g. a privileged-path fallback
pub type NoticeCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Download & install coordinator
///
/// At most one download and one install session are tracked per package;
/// a new request for the same package replaces the old operation. All
/// progress goes through one broadcast bus, and per-package streams are
/// filtered views of it that end on the first completed step.
pub struct InstallCoordinator {
    config: SideloadConfig,
    downloads: Arc<dyn DownloadBackend>,
    sessions: Arc<dyn SessionBackend>,
    launcher: Arc<dyn InstallLauncher>,
    privileged_shell: Option<Arc<dyn PrivilegedShell>>,
    active_downloads: RwLock<HashMap<String, DownloadId>>,
    install_sessions: RwLock<HashMap<String, SessionId>>,
    bus: ProgressBus,
    privileged: Arc<RwLock<Option<Arc<PrivilegedInstaller>>>>,
    completion_listener: Mutex<Option<JoinHandle<()>>>,
    notify: Option<NoticeCallback>,
    cancel_token: CancellationToken,
}

impl InstallCoordinator {
    /// Create a coordinator over the given backends
    pub fn new(
        config: SideloadConfig,
        downloads: Arc<dyn DownloadBackend>,
        sessions: Arc<dyn SessionBackend>,
        launcher: Arc<dyn InstallLauncher>,
    ) -> Self {
        Self {
            config,
            downloads,
            sessions,
            launcher,
            privileged_shell: None,
            active_downloads: RwLock::new(HashMap::new()),
            install_sessions: RwLock::new(HashMap::new()),
            bus: ProgressBus::new(),
            privileged: Arc::new(RwLock::new(None)),
            completion_listener: Mutex::new(None),
            notify: None,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Enable the privileged install path through the given shell
    pub fn with_privileged_shell(mut self, shell: Arc<dyn PrivilegedShell>) -> Self {
        self.privileged_shell = Some(shell);
        self
    }

    /// Register a callback for user-facing notices
    pub fn with_notice_callback(mut self, notify: NoticeCallback) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Download `url` and install it as `package`, returning the
    /// progress stream of this operation.
    ///
    /// Any operation already in flight for the package is cancelled
    /// first. The stream ends after the first completed step.
    pub async fn request_install(
        self: &Arc<Self>,
        url: &str,
        package: &str,
    ) -> Result<impl Stream<Item = InstallInfo>> {
        if package.trim().is_empty() {
            return Err(SideloadError::InvalidPackage);
        }

        // Replace any in-flight operation for this package
        if self.active_downloads.read().contains_key(package) {
            self.delete_download(package).await;
        }
        let stale_session = self.install_sessions.write().remove(package);
        if let Some(session) = stale_session {
            if let Err(e) = self.sessions.abandon_session(session).await {
                debug!("Could not abandon stale session {}: {}", session, e);
            }
        }

        self.register_completion_listener();

        let id = self.downloads.enqueue(DownloadRequest::apk(url, package)).await?;
        self.active_downloads.write().insert(package.to_string(), id);
        info!("Download {} started for {}", id, package);

        // Subscribe before the driver starts so no event is missed
        let progress = Self::package_stream(package.to_string(), self.bus.subscribe());

        tokio::spawn(Arc::clone(self).drive_operation(id, package.to_string()));

        Ok(progress)
    }

    /// Progress events of every tracked package
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.bus.subscribe()
    }

    /// Packages with a download in flight
    pub fn active_downloads(&self) -> Vec<String> {
        self.active_downloads.read().keys().cloned().collect()
    }

    /// Session id tracked for a package, if any
    pub fn tracked_session(&self, package: &str) -> Option<SessionId> {
        self.install_sessions.read().get(package).copied()
    }

    /// Record that a package entered an install session and broadcast it
    pub fn set_installing(&self, package: &str, session: SessionId) {
        debug!("Install of {} entered session {}", package, session);
        self.bus.publish(
            package,
            InstallInfo::with_session(
                InstallStep::Installing,
                Some(SessionInfo {
                    session_id: session,
                    package: package.to_string(),
                }),
            ),
        );
        self.install_sessions
            .write()
            .insert(package.to_string(), session);
    }

    /// Broadcast that a package operation is pending
    pub fn set_pending(&self, package: &str) {
        self.bus.publish(package, InstallInfo::new(InstallStep::Pending));
    }

    /// Record the outcome of an install and broadcast the final step
    pub fn set_installation_result(&self, package: &str, success: bool) {
        self.install_sessions.write().remove(package);
        let step = if success {
            InstallStep::Installed
        } else {
            InstallStep::Error
        };
        info!("Install of {} finished: {:?}", package, step);
        self.bus.publish(package, InstallInfo::new(step));
    }

    /// Cancel the install tracked under `session`. Unknown session ids
    /// are ignored.
    pub async fn cancel_installation(&self, session: SessionId) {
        let package = self
            .install_sessions
            .read()
            .iter()
            .find(|(_, id)| **id == session)
            .map(|(package, _)| package.clone());
        let Some(package) = package else {
            debug!("Cancel for unknown session {} ignored", session);
            return;
        };

        self.set_installation_result(&package, false);
        if let Err(e) = self.sessions.abandon_session(session).await {
            debug!("Could not abandon session {}: {}", session, e);
        }
    }

    /// Drop the session tracked for a package without broadcasting a
    /// result. Safe to call for packages that have none.
    pub async fn clean_up_installation(&self, package: &str) {
        let session = self.install_sessions.write().remove(package);
        let Some(session) = session else {
            return;
        };
        debug!("Cleaning up session {} of {}", session, package);
        if let Err(e) = self.sessions.abandon_session(session).await {
            debug!("Could not abandon session {}: {}", session, e);
        }
    }

    /// Request removal of an installed package
    pub async fn uninstall(&self, package: &str) -> Result<()> {
        self.launcher.uninstall(package).await
    }

    /// Stop tracking a package's download and remove it from the
    /// backend. The completion listener is dropped with the last one.
    pub async fn delete_download(&self, package: &str) {
        let id = self.active_downloads.write().remove(package);
        if let Some(id) = id {
            self.remove_download_record(id).await;
        }
        self.maybe_unregister_listener();
    }

    /// Cancel all drivers and background listeners
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
        self.unregister_completion_listener();
    }

    /// Driver-side finalizer: forgets the download only if the package
    /// still maps to this handle, so a replacing operation is untouched.
    async fn finish_download(&self, package: &str, id: DownloadId) {
        {
            let mut active = self.active_downloads.write();
            if active.get(package) == Some(&id) {
                active.remove(package);
            }
        }
        self.remove_download_record(id).await;
        self.maybe_unregister_listener();
    }

    async fn remove_download_record(&self, id: DownloadId) {
        if let Err(e) = self.downloads.remove(id).await {
            warn!("Could not remove download {}: {}", id, e);
        }
    }

    fn maybe_unregister_listener(&self) {
        if self.active_downloads.read().is_empty() {
            self.unregister_completion_listener();
        }
    }

    fn package_for_download(&self, id: DownloadId) -> Option<String> {
        self.active_downloads
            .read()
            .iter()
            .find(|(_, download)| **download == id)
            .map(|(package, _)| package.clone())
    }

    fn is_privileged_queued(&self, package: &str) -> bool {
        self.privileged
            .read()
            .as_ref()
            .map_or(false, |installer| installer.is_queued(package))
    }

    /// Per-package view of the bus. The first completed step is
    /// delivered and ends the stream right away, without waiting for
    /// another event to arrive.
    fn package_stream(
        package: String,
        events: broadcast::Receiver<ProgressEvent>,
    ) -> impl Stream<Item = InstallInfo> {
        let events = BroadcastStream::new(events);
        stream::unfold(
            (events, package, false),
            |(mut events, package, done)| async move {
                if done {
                    return None;
                }
                loop {
                    match events.next().await {
                        Some(Ok(event)) if event.package == package => {
                            let done = event.info.is_completed();
                            return Some((event.info, (events, package, done)));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                            warn!("Progress subscriber lagged, skipped {} events", skipped);
                        }
                        None => return None,
                    }
                }
            },
        )
    }

    /// Owns one operation end to end: publishes the merged polling
    /// events, stops on the first completed step for the package (from
    /// any source), and always removes the download afterwards.
    async fn drive_operation(self: Arc<Self>, id: DownloadId, package: String) {
        let mut bus_events = self.bus.subscribe();
        let merged = stream::select(self.poll_download(id), self.poll_install(package.clone()));
        tokio::pin!(merged);

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                event = bus_events.recv() => match event {
                    Ok(event) if event.package == package && event.info.is_completed() => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Driver for {} lagged, skipped {} events", package, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                item = merged.next() => match item {
                    Some(Ok(info)) => {
                        let completed = info.is_completed();
                        self.bus.publish(&package, info);
                        if completed {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Progress polling for {} failed: {}", package, e);
                        self.bus.publish(&package, InstallInfo::new(InstallStep::Error));
                        break;
                    }
                    None => break,
                },
            }
        }

        self.finish_download(&package, id).await;
        debug!("Operation for {} finished", package);
    }

    /// Download-status sub-stream: queries immediately, drops repeats,
    /// and ends unannounced on a terminal status. Query failures and
    /// unknown handles are retried on the next tick.
    fn poll_download(self: &Arc<Self>, id: DownloadId) -> impl Stream<Item = Result<InstallInfo>> {
        let this = Arc::clone(self);
        stream::unfold(
            (this, None::<DownloadStatus>),
            move |(this, mut last)| async move {
                loop {
                    match this.downloads.query(id).await {
                        Err(e) => {
                            debug!("Download {} status query failed: {}", id, e);
                        }
                        Ok(None) => {
                            debug!("Download {} not known to the backend", id);
                        }
                        Ok(Some(status)) => {
                            if last != Some(status) {
                                last = Some(status);
                                if status.is_terminal() {
                                    return None;
                                }
                                match status {
                                    DownloadStatus::Pending => {
                                        return Some((
                                            Ok(InstallInfo::new(InstallStep::Pending)),
                                            (this, last),
                                        ));
                                    }
                                    DownloadStatus::Running => {
                                        return Some((
                                            Ok(InstallInfo::new(InstallStep::Downloading)),
                                            (this, last),
                                        ));
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                    tokio::time::sleep(this.config.download_poll()).await;
                }
            },
        )
    }

    /// Install-session sub-stream: reports Installing while a session is
    /// alive or the package sits in the privileged queue, then ends with
    /// Done once a session it has seen is gone.
    fn poll_install(self: &Arc<Self>, package: String) -> impl Stream<Item = Result<InstallInfo>> {
        let this = Arc::clone(self);
        stream::unfold(
            (this, package, false, false),
            |(this, package, mut seen, done)| async move {
                if done {
                    return None;
                }
                loop {
                    tokio::time::sleep(this.config.session_poll()).await;

                    let session = this.install_sessions.read().get(&package).copied();
                    if let Some(id) = session {
                        seen = true;
                        match this.sessions.session_info(id).await {
                            Ok(Some(info)) => {
                                return Some((
                                    Ok(InstallInfo::with_session(
                                        InstallStep::Installing,
                                        Some(info),
                                    )),
                                    (this, package, seen, false),
                                ));
                            }
                            Ok(None) => {
                                // Privileged queue entries have no backend record
                                if this.is_privileged_queued(&package) {
                                    return Some((
                                        Ok(InstallInfo::new(InstallStep::Installing)),
                                        (this, package, seen, false),
                                    ));
                                }
                                return Some((
                                    Ok(InstallInfo::new(InstallStep::Done)),
                                    (this, package, seen, true),
                                ));
                            }
                            Err(e) if e.is_transient() => {
                                debug!("Session {} query failed: {}", id, e);
                            }
                            Err(e) => {
                                return Some((Err(e), (this, package, seen, true)));
                            }
                        }
                    } else if this.is_privileged_queued(&package) {
                        seen = true;
                        return Some((
                            Ok(InstallInfo::new(InstallStep::Installing)),
                            (this, package, seen, false),
                        ));
                    } else if seen {
                        return Some((
                            Ok(InstallInfo::new(InstallStep::Done)),
                            (this, package, seen, true),
                        ));
                    }
                }
            },
        )
    }

    /// Listen for completion events of the download backend. Registered
    /// with the first tracked download and dropped with the last.
    fn register_completion_listener(self: &Arc<Self>) {
        let mut guard = self.completion_listener.lock();
        if guard.is_some() {
            return;
        }

        let this = Arc::clone(self);
        let mut events = self.downloads.completion_events();
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.cancel_token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(id) => this.handle_download_completed(id).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Completion listener lagged, skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }));
        debug!("Download completion listener registered");
    }

    fn unregister_completion_listener(&self) {
        if let Some(handle) = self.completion_listener.lock().take() {
            handle.abort();
            debug!("Download completion listener unregistered");
        }
    }

    /// A download finished: resolve its artifact and start the install,
    /// or broadcast Error when no usable artifact exists.
    async fn handle_download_completed(self: &Arc<Self>, id: DownloadId) {
        let Some(package) = self.package_for_download(id) else {
            debug!("Ignoring completion of untracked download {}", id);
            return;
        };

        match self.downloads.local_artifact(id).await {
            Ok(Some(artifact)) => {
                self.bus
                    .publish(&package, InstallInfo::new(InstallStep::Loading));
                if let Err(e) = self.install_artifact(id, &artifact).await {
                    error!("Could not start install of {}: {}", package, e);
                    self.bus
                        .publish(&package, InstallInfo::new(InstallStep::Error));
                }
            }
            Ok(None) => {
                error!(
                    "Download {} for {} finished without a usable artifact",
                    id, package
                );
                self.bus
                    .publish(&package, InstallInfo::new(InstallStep::Error));
            }
            Err(e) => {
                error!("Could not resolve artifact of download {}: {}", id, e);
                self.bus
                    .publish(&package, InstallInfo::new(InstallStep::Error));
            }
        }
    }

    /// Start installing a downloaded artifact, preferring the privileged
    /// path when configured and available. The standard path picks the
    /// unattended mode only for packages this launcher already owns on
    /// a platform that supports it.
    pub async fn install_artifact(self: &Arc<Self>, id: DownloadId, artifact: &Path) -> Result<()> {
        let package = self
            .package_for_download(id)
            .ok_or(SideloadError::UnknownDownload(id))?;

        if self.config.use_privileged {
            if let Some(privileged) = self.privileged_installer().await {
                let session = privileged.enqueue(id, &package, artifact.to_path_buf())?;
                self.set_installing(&package, session);
                return Ok(());
            }
        }

        let mode = if self.launcher.installed_by_self(&package) && self.launcher.supports_background()
        {
            InstallMode::Background
        } else {
            InstallMode::Foreground
        };

        let session = self.sessions.open_session(&package);
        self.set_installing(&package, session);

        let this = Arc::clone(self);
        let artifact = artifact.to_path_buf();
        tokio::spawn(async move {
            let result = this.launcher.install(&package, &artifact, mode).await;
            // Record the result before closing the session so the poll
            // never observes a vanished session without an outcome
            match result {
                Ok(()) => this.set_installation_result(&package, true),
                Err(e) => {
                    warn!("Install of {} failed: {}", package, e);
                    this.set_installation_result(&package, false);
                }
            }
            this.sessions.close_session(session);
        });

        Ok(())
    }

    /// The privileged installer, built lazily on first use. Returns
    /// `None` (with a notice) when the shell is missing or unusable.
    async fn privileged_installer(self: &Arc<Self>) -> Option<Arc<PrivilegedInstaller>> {
        if let Some(installer) = self.privileged.read().clone() {
            return Some(installer);
        }

        let shell = self.privileged_shell.clone()?;
        let slot = Arc::clone(&self.privileged);
        let sink = Arc::new(CoordinatorSink {
            coordinator: Arc::downgrade(self),
        });
        let teardown = Box::new(move || {
            *slot.write() = None;
            debug!("Privileged installer torn down");
        });

        match PrivilegedInstaller::new(shell, sink, teardown).await {
            Ok(installer) => {
                *self.privileged.write() = Some(Arc::clone(&installer));
                Some(installer)
            }
            Err(e) => {
                warn!("Privileged install path unavailable: {}", e);
                if let Some(notify) = &self.notify {
                    notify("Privileged installer unavailable, using the standard install flow");
                }
                None
            }
        }
    }
}

/// Routes privileged install outcomes back into the coordinator
struct CoordinatorSink {
    coordinator: Weak<InstallCoordinator>,
}

impl InstallResultSink for CoordinatorSink {
    fn result(&self, package: &str, success: bool) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.set_installation_result(package, success);
        }
    }
}
