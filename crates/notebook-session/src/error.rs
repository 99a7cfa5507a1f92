//! Error types for document, session and lifecycle operations.
//!
//! Session lookup failures never surface here on their own: the resolver
//! turns them into a fallback. Only failures that a caller has to report
//! (session start, content load/save, invalid lifecycle requests) do.

use std::path::PathBuf;

use crate::container::{ContainerId, ContainerState};
use crate::session::SessionId;

/// Errors loading or storing notebook content.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Failed to parse notebook: {0}")]
    Parse(String),

    #[error("Failed to serialize notebook: {0}")]
    Serialize(String),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the session-management and kernelspec collaborators.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No session for {}", .0.display())]
    NotFound(PathBuf),

    #[error("Session {id} is unreachable: {reason}")]
    Unreachable { id: SessionId, reason: String },

    #[error("Failed to start session: {0}")]
    StartFailed(String),

    #[error("Failed to shut down session: {0}")]
    Shutdown(String),

    #[error("Failed to fetch kernelspecs: {0}")]
    Catalog(String),

    #[error("No kernelspecs available")]
    NoKernelspec,
}

/// Errors from lifecycle transitions on a document container.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Unknown container: {0}")]
    UnknownContainer(ContainerId),

    #[error("Container {id} is {actual}, expected {expected}")]
    InvalidState {
        id: ContainerId,
        actual: ContainerState,
        expected: ContainerState,
    },

    #[error("Session resolution still pending for container {0}")]
    ResolutionPending(ContainerId),
}

/// The confirmation prompt was dismissed or failed to show.
#[derive(Debug, thiserror::Error)]
#[error("Prompt dismissed: {0}")]
pub struct PromptDismissed(pub String);

/// Errors reading or writing the settings file.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}
