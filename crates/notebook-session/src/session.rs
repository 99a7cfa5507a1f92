//! Session-management contract.
//!
//! A session is a live kernel connection bound to one notebook path. The
//! session manager owns sessions; containers only hold a shared reference and
//! may ask for shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use jupyter_protocol::ExecutionState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::comm::CommHandler;
use crate::error::SessionError;

/// Identifier of a session within its manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel status as seen through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unknown,
    /// Kernel is starting up
    Starting,
    /// Kernel is ready and idle
    Idle,
    /// Kernel is executing code
    Busy,
    Restarting,
    /// Kernel is shutting down
    Terminating,
    /// Kernel is gone; terminal
    Dead,
}

impl SessionStatus {
    /// Whether the kernel behind the session can no longer be used.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Dead)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Unknown => write!(f, "unknown"),
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Busy => write!(f, "busy"),
            SessionStatus::Restarting => write!(f, "restarting"),
            SessionStatus::Terminating => write!(f, "terminating"),
            SessionStatus::Dead => write!(f, "dead"),
        }
    }
}

impl From<&ExecutionState> for SessionStatus {
    fn from(state: &ExecutionState) -> Self {
        match state {
            ExecutionState::Starting => SessionStatus::Starting,
            ExecutionState::Idle => SessionStatus::Idle,
            ExecutionState::Busy => SessionStatus::Busy,
            ExecutionState::Restarting => SessionStatus::Restarting,
            ExecutionState::Terminating => SessionStatus::Terminating,
            ExecutionState::Dead => SessionStatus::Dead,
            #[allow(unreachable_patterns)]
            _ => SessionStatus::Unknown,
        }
    }
}

/// Parameters for starting a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub kernel_name: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait KernelSession: Send + Sync {
    fn id(&self) -> &SessionId;

    fn kernel_name(&self) -> &str;

    /// Human-readable kernel name used in prompts.
    fn kernel_display_name(&self) -> String {
        self.kernel_name().to_string()
    }

    fn path(&self) -> &Path;

    fn status(&self) -> SessionStatus;

    /// Register a handler for comms opened against `target_name`.
    ///
    /// A second registration under the same name replaces the first.
    fn register_comm_target(&self, target_name: &str, handler: CommHandler);

    async fn shutdown(&self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Find the running session bound to `path`.
    async fn find_by_path(&self, path: &Path) -> Result<SessionId, SessionError>;

    /// Attach to an existing session.
    async fn connect(&self, id: &SessionId) -> Result<Arc<dyn KernelSession>, SessionError>;

    /// Start a new session.
    async fn start(&self, options: StartOptions) -> Result<Arc<dyn KernelSession>, SessionError>;
}

/// Result of looking up an existing session for a path.
pub enum SessionLookup {
    Found(Arc<dyn KernelSession>),
    /// No session is registered for the path
    NotFound,
    /// A session is registered but connecting to it failed
    Unreachable { id: SessionId, reason: String },
}

impl std::fmt::Debug for SessionLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionLookup::Found(session) => f.debug_tuple("Found").field(session.id()).finish(),
            SessionLookup::NotFound => write!(f, "NotFound"),
            SessionLookup::Unreachable { id, reason } => f
                .debug_struct("Unreachable")
                .field("id", id)
                .field("reason", reason)
                .finish(),
        }
    }
}
