//! Error types for Sideload
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::step::DownloadId;

/// Main error type for Sideload
#[derive(Error, Debug)]
pub enum SideloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid package identifier")]
    InvalidPackage,

    #[error("Download error: {0}")]
    Download(String),

    #[error("Download query failed: {0}")]
    DownloadQuery(String),

    #[error("Unknown download handle: {0}")]
    UnknownDownload(DownloadId),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Session query failed: {0}")]
    SessionQuery(String),

    #[error("Privileged installer unavailable: {0}")]
    PrivilegedUnavailable(String),

    #[error("Launcher error: {0}")]
    Launcher(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Result type alias for Sideload operations
pub type Result<T> = std::result::Result<T, SideloadError>;

impl SideloadError {
    /// Whether the failure is transient: polling retries it on the next
    /// tick instead of ending the stream.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SideloadError::DownloadQuery(_) | SideloadError::SessionQuery(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SideloadError::DownloadQuery("backend busy".into()).is_transient());
        assert!(SideloadError::SessionQuery("no response".into()).is_transient());

        assert!(!SideloadError::Session("abandoned".into()).is_transient());
        assert!(!SideloadError::InvalidPackage.is_transient());
        assert!(!SideloadError::UnknownDownload(7).is_transient());
    }
}
