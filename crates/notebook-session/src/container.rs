//! Document containers: one per open notebook.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::cells::CellManager;
use crate::document::NotebookModel;
use crate::session::KernelSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContainerId(u64);

impl ContainerId {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "doc-{}", self.0)
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Empty model, nothing loaded
    Created,
    /// Content loaded, no session
    Populated,
    /// Fully live
    SessionAttached,
    /// Close in progress
    Closing,
    /// Released; terminal
    Closed,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Populated => write!(f, "populated"),
            ContainerState::SessionAttached => write!(f, "session_attached"),
            ContainerState::Closing => write!(f, "closing"),
            ContainerState::Closed => write!(f, "closed"),
        }
    }
}

pub struct DocumentContainer {
    id: ContainerId,
    path: PathBuf,
    model: Arc<NotebookModel>,
    cells: CellManager,
    session: Mutex<Option<Arc<dyn KernelSession>>>,
    state: Mutex<ContainerState>,
    resolving: AtomicBool,
}

impl DocumentContainer {
    pub(crate) fn new(id: ContainerId, path: PathBuf) -> Self {
        let model = Arc::new(NotebookModel::new());
        Self {
            id,
            path,
            cells: CellManager::new(model.clone()),
            model,
            session: Mutex::new(None),
            state: Mutex::new(ContainerState::Created),
            resolving: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model(&self) -> &Arc<NotebookModel> {
        &self.model
    }

    pub fn cells(&self) -> &CellManager {
        &self.cells
    }

    pub fn session(&self) -> Option<Arc<dyn KernelSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> ContainerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether session resolution is in flight for this container.
    pub fn is_resolving(&self) -> bool {
        self.resolving.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, state: ContainerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Move from `expected` to `next`; returns the actual state on mismatch.
    pub(crate) fn transition(
        &self,
        expected: ContainerState,
        next: ContainerState,
    ) -> Result<(), ContainerState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != expected {
            return Err(*state);
        }
        *state = next;
        Ok(())
    }

    /// Mark session resolution as in flight until the guard is dropped.
    ///
    /// Returns None if another resolution already holds the flag.
    pub(crate) fn begin_resolving(&self) -> Option<ResolvingGuard<'_>> {
        self.resolving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ResolvingGuard { container: self })
    }

    pub(crate) fn bind_session(&self, session: Arc<dyn KernelSession>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    pub(crate) fn take_session(&self) -> Option<Arc<dyn KernelSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Clears the resolving flag when dropped, including when the resolving
/// future is cancelled.
pub(crate) struct ResolvingGuard<'a> {
    container: &'a DocumentContainer,
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        self.container.resolving.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for DocumentContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentContainer")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state())
            .field("session", &self.session().map(|s| s.id().clone()))
            .finish()
    }
}
