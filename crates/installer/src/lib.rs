//! Sideload Installer - package download & install coordination
//!
//! Drives "download an installable package, then install it" end to end:
//! one coordinator tracks every in-flight package operation, merges
//! download and install-session polling into a single progress stream per
//! package, and exposes install/uninstall commands on top of pluggable
//! backends.

pub mod coordinator;
pub mod download;
pub mod launcher;
pub mod privileged;
pub mod session;

pub use coordinator::{InstallCoordinator, NoticeCallback};
pub use download::{
    DownloadBackend, DownloadError, DownloadRequest, DownloadStatus, HttpDownloadManager, APK_MIME,
};
pub use launcher::{AdbLauncher, InstallLauncher, InstallMode};
pub use privileged::{InstallResultSink, PrivilegedInstaller, PrivilegedShell};
pub use session::{SessionBackend, SessionRegistry};
