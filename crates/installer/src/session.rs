//! Install Session Broker
//!
//! Tracks install sessions opened by this process and answers the
//! coordinator's session polls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use sideload_core::{SessionId, SessionInfo, SideloadError};

/// Interface of the install-session backend
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Open a session for a package and return its id
    fn open_session(&self, package: &str) -> SessionId;

    /// Close a finished session, dropping its record
    fn close_session(&self, id: SessionId);

    /// Snapshot of a session, `None` once it is gone
    async fn session_info(&self, id: SessionId) -> Result<Option<SessionInfo>, SideloadError>;

    /// Abandon a session; callers treat failures as best-effort
    async fn abandon_session(&self, id: SessionId) -> Result<(), SideloadError>;
}

/// In-process session registry
pub struct SessionRegistry {
    next_id: AtomicI32,
    sessions: RwLock<HashMap<SessionId, SessionInfo>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            next_id: AtomicI32::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Number of open sessions
    pub fn open_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionBackend for SessionRegistry {
    fn open_session(&self, package: &str) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.write().insert(
            id,
            SessionInfo {
                session_id: id,
                package: package.to_string(),
            },
        );
        debug!("Opened install session {} for {}", id, package);
        id
    }

    fn close_session(&self, id: SessionId) {
        if self.sessions.write().remove(&id).is_some() {
            debug!("Closed install session {}", id);
        }
    }

    async fn session_info(&self, id: SessionId) -> Result<Option<SessionInfo>, SideloadError> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    async fn abandon_session(&self, id: SessionId) -> Result<(), SideloadError> {
        if self.sessions.write().remove(&id).is_none() {
            return Err(SideloadError::Session(format!("no session {}", id)));
        }
        debug!("Abandoned install session {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let registry = SessionRegistry::new();
        let id = registry.open_session("com.example.ext");

        let info = registry.session_info(id).await.unwrap().unwrap();
        assert_eq!(info.package, "com.example.ext");
        assert_eq!(info.session_id, id);
        assert_eq!(registry.open_count(), 1);

        registry.close_session(id);
        assert!(registry.session_info(id).await.unwrap().is_none());
        assert_eq!(registry.open_count(), 0);
    }

    #[tokio::test]
    async fn test_abandon_unknown_session_fails() {
        let registry = SessionRegistry::new();
        assert!(registry.abandon_session(42).await.is_err());

        let id = registry.open_session("com.example.ext");
        registry.abandon_session(id).await.unwrap();
        assert!(registry.session_info(id).await.unwrap().is_none());
    }
}
