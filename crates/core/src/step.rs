//! Install Step Model
//!
//! The states a package operation moves through, and the session snapshot
//! attached to `Installing` emissions.

use serde::{Deserialize, Serialize};

/// Backend-issued identifier for one enqueued download request.
pub type DownloadId = u64;

/// Backend-issued identifier for one in-progress install session.
pub type SessionId = i32;

/// Step of a package install operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStep {
    /// Queued, nothing transferred yet
    Pending,
    /// Download in progress
    Downloading,
    /// Downloaded, artifact being resolved before install
    Loading,
    /// Install session in progress
    Installing,
    /// Install finished successfully
    Installed,
    /// Operation failed
    Error,
    /// A polling sub-stream closed without a recorded result
    Done,
}

impl InstallStep {
    /// Whether this step ends a progress stream.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            InstallStep::Installed | InstallStep::Error | InstallStep::Done
        )
    }
}

/// Snapshot of a tracked install session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier
    pub session_id: SessionId,
    /// Package the session installs
    pub package: String,
}

/// One progress emission: the current step and, while installing, the
/// session snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallInfo {
    /// Current install step
    pub step: InstallStep,
    /// Session snapshot, present for `Installing` emissions from polling
    pub session: Option<SessionInfo>,
}

impl InstallInfo {
    /// Emission carrying a bare step.
    pub fn new(step: InstallStep) -> Self {
        Self {
            step,
            session: None,
        }
    }

    /// Emission carrying a step and a session snapshot.
    pub fn with_session(step: InstallStep, session: Option<SessionInfo>) -> Self {
        Self { step, session }
    }

    /// Whether this emission ends a progress stream.
    pub fn is_completed(&self) -> bool {
        self.step.is_completed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_steps() {
        assert!(InstallStep::Installed.is_completed());
        assert!(InstallStep::Error.is_completed());
        assert!(InstallStep::Done.is_completed());

        assert!(!InstallStep::Pending.is_completed());
        assert!(!InstallStep::Downloading.is_completed());
        assert!(!InstallStep::Loading.is_completed());
        assert!(!InstallStep::Installing.is_completed());
    }

    #[test]
    fn test_info_completion_follows_step() {
        assert!(InstallInfo::new(InstallStep::Done).is_completed());
        assert!(!InstallInfo::with_session(
            InstallStep::Installing,
            Some(SessionInfo {
                session_id: 1,
                package: "com.example.ext".to_string(),
            })
        )
        .is_completed());
    }
}
