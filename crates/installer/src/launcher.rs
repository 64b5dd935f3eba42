//! Platform Install Launcher
//!
//! Dispatches the actual install and uninstall requests, here over adb
//! the way a desktop host reaches an Android device.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::process::Command;
use tracing::{debug, warn};

use sideload_core::{SideloadConfig, SideloadError};

/// Minimum device SDK level for unattended (background) installs.
const BACKGROUND_MIN_SDK: u32 = 31;

/// How an install is dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// Interactive flow, the platform may ask the user to confirm
    Foreground,
    /// Unattended update flow for packages this launcher already owns
    Background,
}

/// Interface of the platform install/uninstall launcher
#[async_trait]
pub trait InstallLauncher: Send + Sync {
    /// Install an artifact; resolves once the platform reports an outcome
    async fn install(
        &self,
        package: &str,
        artifact: &Path,
        mode: InstallMode,
    ) -> Result<(), SideloadError>;

    /// Request removal of a package
    async fn uninstall(&self, package: &str) -> Result<(), SideloadError>;

    /// Whether this launcher installed the package earlier
    fn installed_by_self(&self, package: &str) -> bool;

    /// Whether the platform supports the background flow
    fn supports_background(&self) -> bool;
}

/// adb-backed launcher
pub struct AdbLauncher {
    adb: PathBuf,
    serial: Option<String>,
    device_sdk: Option<u32>,
    installed: RwLock<HashSet<String>>,
}

impl AdbLauncher {
    /// Connect to a device and probe its SDK level
    pub async fn connect(
        adb: Option<PathBuf>,
        serial: Option<String>,
    ) -> Result<Self, SideloadError> {
        let mut launcher = Self {
            adb: adb.unwrap_or_else(|| PathBuf::from("adb")),
            serial,
            device_sdk: None,
            installed: RwLock::new(HashSet::new()),
        };

        match launcher.get_prop("ro.build.version.sdk").await {
            Ok(value) => launcher.device_sdk = value.trim().parse().ok(),
            Err(e) => warn!("Could not probe device SDK level: {}", e),
        }

        Ok(launcher)
    }

    /// Connect using the configured adb path and device serial
    pub async fn from_config(config: &SideloadConfig) -> Result<Self, SideloadError> {
        Self::connect(config.adb_path.clone(), config.device_serial.clone()).await
    }

    async fn run(&self, args: &[&str]) -> Result<String, SideloadError> {
        let mut full_args: Vec<&str> = Vec::new();
        if let Some(serial) = &self.serial {
            full_args.push("-s");
            full_args.push(serial);
        }
        full_args.extend_from_slice(args);

        debug!("adb {:?}", full_args);

        let output = Command::new(&self.adb)
            .args(&full_args)
            .output()
            .await
            .map_err(|e| SideloadError::Launcher(format!("adb spawn failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SideloadError::Launcher(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn get_prop(&self, prop: &str) -> Result<String, SideloadError> {
        self.run(&["shell", "getprop", prop]).await
    }
}

#[async_trait]
impl InstallLauncher for AdbLauncher {
    async fn install(
        &self,
        package: &str,
        artifact: &Path,
        mode: InstallMode,
    ) -> Result<(), SideloadError> {
        let path = artifact.to_string_lossy();
        match mode {
            InstallMode::Foreground => self.run(&["install", path.as_ref()]).await?,
            InstallMode::Background => self.run(&["install", "-r", path.as_ref()]).await?,
        };
        self.installed.write().insert(package.to_string());
        Ok(())
    }

    async fn uninstall(&self, package: &str) -> Result<(), SideloadError> {
        self.run(&["uninstall", package]).await?;
        self.installed.write().remove(package);
        Ok(())
    }

    fn installed_by_self(&self, package: &str) -> bool {
        self.installed.read().contains(package)
    }

    fn supports_background(&self) -> bool {
        self.device_sdk.map_or(false, |sdk| sdk >= BACKGROUND_MIN_SDK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_records_ownership() {
        // /bin/echo accepts any arguments and exits 0, standing in for adb
        let launcher = AdbLauncher::connect(Some(PathBuf::from("/bin/echo")), None)
            .await
            .unwrap();

        assert!(!launcher.installed_by_self("com.example.ext"));
        launcher
            .install(
                "com.example.ext",
                Path::new("/tmp/ext.apk"),
                InstallMode::Foreground,
            )
            .await
            .unwrap();
        assert!(launcher.installed_by_self("com.example.ext"));

        launcher.uninstall("com.example.ext").await.unwrap();
        assert!(!launcher.installed_by_self("com.example.ext"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unknown_sdk_disables_background() {
        // echo output is not a number, so the SDK probe yields None
        let launcher = AdbLauncher::connect(Some(PathBuf::from("/bin/echo")), None)
            .await
            .unwrap();
        assert!(!launcher.supports_background());
    }

    #[tokio::test]
    async fn test_missing_adb_is_an_error() {
        let launcher = AdbLauncher::connect(Some(PathBuf::from("/nonexistent/adb")), None)
            .await
            .unwrap();
        let result = launcher
            .install(
                "com.example.ext",
                Path::new("/tmp/ext.apk"),
                InstallMode::Foreground,
            )
            .await;
        assert!(matches!(result, Err(SideloadError::Launcher(_))));
    }
}
