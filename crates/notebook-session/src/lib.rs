//! notebook-session - binds notebook documents to live kernel sessions.
//!
//! This crate coordinates the lifecycle of open `.ipynb` documents: it loads
//! persisted content into a document model, reattaches to a running kernel
//! session for the same path (or starts a new one), routes widget comm
//! traffic, mirrors the model's dirty flag into a per-document registry, and
//! tears the session down on close after asking the user.
//!
//! ## Flow
//!
//! ```text
//! open(path)
//!   -> create container          (Created)
//!   -> deserialize file          (Populated)
//!   -> resolve session           (reuse by path, else start via kernelspec)
//!   -> bind + register comms     (SessionAttached)
//! close(id)
//!   -> confirm if session live   (Closing)
//!   -> shutdown on "OK" only
//!   -> release container         (Closed)
//! ```
//!
//! Collaborators (session management, kernelspec catalog, widget manager,
//! confirmation prompt) are traits so the coordinator can be driven by the
//! local `runtimelib`-backed implementations in [`local`] or by test stubs.

use std::path::Path;

use serde::Serialize;

pub mod cells;
pub mod comm;
pub mod container;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod kernelspec;
pub mod local;
pub mod prompt;
pub mod resolver;
pub mod session;
pub mod settings;
pub mod tracker;
pub mod widgets;

pub use container::{ContainerId, ContainerState, DocumentContainer};
pub use coordinator::{CloseOutcome, Collaborators, LifecycleCoordinator};
pub use document::{ModelChange, ModelId, NotebookModel};
pub use error::{DocumentError, LifecycleError, SessionError};
pub use session::{KernelSession, SessionId, SessionManager, SessionStatus};

/// File type registration exposed to the surrounding application shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileType {
    /// Registry name of the handler (e.g. `"notebook"`).
    pub name: &'static str,
    /// Human-readable name shown in open dialogs.
    pub display_name: &'static str,
    /// Extensions handled, including the leading dot.
    pub extensions: &'static [&'static str],
}

/// The notebook file type handled by [`LifecycleCoordinator`].
pub const NOTEBOOK_FILE_TYPE: FileType = FileType {
    name: "notebook",
    display_name: "Jupyter Notebook",
    extensions: &[".ipynb"],
};

impl FileType {
    /// Whether `path` carries one of this file type's extensions.
    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.extensions
                    .iter()
                    .any(|known| known.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}
