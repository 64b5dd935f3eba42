//! Sideload Core - shared types and ambient services
//!
//! This crate provides the pieces shared between the install coordinator
//! and its callers: the install step model, the progress broadcast bus,
//! configuration, and error types.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod step;

pub use config::SideloadConfig;
pub use error::{Result, SideloadError};
pub use events::{ProgressBus, ProgressEvent};
pub use step::{DownloadId, InstallInfo, InstallStep, SessionId, SessionInfo};

/// Sideload version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
