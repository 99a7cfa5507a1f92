//! Lifecycle coordination for open notebook documents.
//!
//! ## Container lifecycle
//!
//! 1. `create` registers an empty container (`Created`) and starts mirroring
//!    its dirty flag
//! 2. `populate` loads the file into the model (`Populated`)
//! 3. `attach_session` resolves a session, binds it and registers the widget
//!    comm targets (`SessionAttached`)
//! 4. `close` asks before shutting down a live session, then releases the
//!    container (`Closing` -> `Closed`)
//!
//! `open` runs steps 1-3 and releases the container if any of them fails or
//! the `open` future is dropped part way, so a container is never left bound
//! to a session that failed to resolve. Opening a path that is already open
//! returns the existing container.
//!
//! A close request that arrives while session resolution is in flight is
//! rejected with [`LifecycleError::ResolutionPending`]; the container stays
//! open and the caller may close it once `open` returns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};

use crate::comm::{CommRouter, WidgetManager};
use crate::container::{ContainerId, ContainerState, DocumentContainer};
use crate::document::NotebookModel;
use crate::error::{DocumentError, LifecycleError};
use crate::kernelspec::KernelspecCatalog;
use crate::prompt::{ConfirmPrompt, Dialog};
use crate::resolver::SessionResolver;
use crate::session::{KernelSession, SessionManager};
use crate::settings::Settings;
use crate::tracker::DirtyTracker;
use crate::{FileType, NOTEBOOK_FILE_TYPE};

/// External collaborators the coordinator drives.
pub struct Collaborators {
    pub sessions: Arc<dyn SessionManager>,
    pub kernelspecs: Arc<dyn KernelspecCatalog>,
    pub widgets: Arc<dyn WidgetManager>,
    pub prompt: Arc<dyn ConfirmPrompt>,
}

/// What happened to the session when a container closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseOutcome {
    /// The user was asked to confirm shutdown
    pub prompted: bool,
    /// The session was shut down successfully
    pub shutdown: bool,
}

pub struct LifecycleCoordinator {
    resolver: SessionResolver,
    router: CommRouter,
    tracker: Arc<DirtyTracker>,
    prompt: Arc<dyn ConfirmPrompt>,
    containers: Mutex<HashMap<ContainerId, Arc<DocumentContainer>>>,
    next_id: AtomicU64,
    confirm_shutdown: bool,
}

impl LifecycleCoordinator {
    pub fn new(collaborators: Collaborators, settings: &Settings) -> Self {
        Self {
            resolver: SessionResolver::new(
                collaborators.sessions,
                collaborators.kernelspecs,
                settings.default_kernel.clone(),
                settings.unreachable_session,
            ),
            router: CommRouter::new(collaborators.widgets),
            tracker: Arc::new(DirtyTracker::new()),
            prompt: collaborators.prompt,
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            confirm_shutdown: settings.confirm_shutdown_on_close,
        }
    }

    /// File type this coordinator handles.
    pub fn file_type(&self) -> &'static FileType {
        &NOTEBOOK_FILE_TYPE
    }

    /// Open a notebook: create, populate, and attach a session.
    ///
    /// If `path` is already open, its container id is returned as is.
    pub async fn open(&self, path: impl Into<PathBuf>) -> Result<ContainerId, LifecycleError> {
        let path = path.into();
        let container = {
            let mut containers = self.lock_containers();
            if let Some(existing) = containers.values().find(|c| c.path() == path) {
                info!(
                    "[coordinator] {} is already open as {}",
                    path.display(),
                    existing.id()
                );
                return Ok(existing.id());
            }
            let container = self.new_container(path);
            containers.insert(container.id(), container.clone());
            container
        };
        let id = container.id();
        let mut pending = PendingOpen {
            coordinator: self,
            container: Some(container),
        };

        let result = async {
            self.populate(id).await?;
            self.attach_session(id).await?;
            Ok::<(), LifecycleError>(())
        }
        .await;

        match result {
            Ok(()) => {
                pending.container = None;
                Ok(id)
            }
            Err(e) => {
                error!("[coordinator] Failed to open {}: {}", id, e);
                Err(e)
            }
        }
    }

    /// Register an empty container for `path`.
    pub fn create(&self, path: impl Into<PathBuf>) -> Arc<DocumentContainer> {
        let container = self.new_container(path.into());
        self.lock_containers()
            .insert(container.id(), container.clone());
        container
    }

    /// Load the container's file from disk into its model.
    pub async fn populate(&self, id: ContainerId) -> Result<(), LifecycleError> {
        let container = self.get(id)?;
        expect_state(&container, ContainerState::Created)?;

        let content = tokio::fs::read_to_string(container.path())
            .await
            .map_err(|source| DocumentError::Read {
                path: container.path().to_path_buf(),
                source,
            })?;
        self.populate_from(id, &content)
    }

    /// Load `.ipynb` content into the container's model.
    pub fn populate_from(&self, id: ContainerId, content: &str) -> Result<(), LifecycleError> {
        let container = self.get(id)?;
        expect_state(&container, ContainerState::Created)?;

        container.model().deserialize(content)?;
        container
            .transition(ContainerState::Created, ContainerState::Populated)
            .map_err(|actual| LifecycleError::InvalidState {
                id,
                actual,
                expected: ContainerState::Created,
            })?;
        debug!("[coordinator] Populated {}", id);
        Ok(())
    }

    /// Resolve a session for a populated container and bind it.
    pub async fn attach_session(
        &self,
        id: ContainerId,
    ) -> Result<Arc<dyn KernelSession>, LifecycleError> {
        let container = self.get(id)?;
        if container.is_resolving() {
            return Err(LifecycleError::ResolutionPending(id));
        }
        expect_state(&container, ContainerState::Populated)?;

        let session = {
            let Some(_resolving) = container.begin_resolving() else {
                return Err(LifecycleError::ResolutionPending(id));
            };
            self.resolver
                .resolve(container.path(), container.model())
                .await?
        };

        container
            .transition(ContainerState::Populated, ContainerState::SessionAttached)
            .map_err(|actual| LifecycleError::InvalidState {
                id,
                actual,
                expected: ContainerState::Populated,
            })?;
        container.bind_session(session.clone());
        self.router.attach(session.as_ref());

        info!(
            "[coordinator] Attached session {} ({}) to {}",
            session.id(),
            session.kernel_name(),
            id
        );
        Ok(session)
    }

    /// Close a container.
    ///
    /// With a live session the user is asked first; only an affirmative
    /// answer shuts the session down. The container is released either way.
    pub async fn close(&self, id: ContainerId) -> Result<CloseOutcome, LifecycleError> {
        let container = self.get(id)?;
        if container.is_resolving() {
            return Err(LifecycleError::ResolutionPending(id));
        }
        let state = container.state();
        if matches!(state, ContainerState::Closing | ContainerState::Closed) {
            return Err(LifecycleError::InvalidState {
                id,
                actual: state,
                expected: ContainerState::SessionAttached,
            });
        }
        container.set_state(ContainerState::Closing);

        let mut outcome = CloseOutcome::default();
        match container.session() {
            None => debug!("[coordinator] {} has no session", id),
            Some(session) if session.status().is_terminal() => {
                debug!(
                    "[coordinator] Session {} for {} is {}, skipping shutdown",
                    session.id(),
                    id,
                    session.status()
                );
            }
            Some(session) => {
                let confirmed = if self.confirm_shutdown {
                    outcome.prompted = true;
                    self.confirm_shutdown(&container, session.as_ref()).await
                } else {
                    true
                };
                if confirmed {
                    match session.shutdown().await {
                        Ok(()) => {
                            info!("[coordinator] Shut down session {}", session.id());
                            outcome.shutdown = true;
                        }
                        Err(e) => {
                            warn!(
                                "[coordinator] Failed to shut down session {}: {}",
                                session.id(),
                                e
                            );
                        }
                    }
                } else {
                    info!(
                        "[coordinator] Leaving session {} running after closing {}",
                        session.id(),
                        id
                    );
                }
            }
        }

        self.release(&container);
        Ok(outcome)
    }

    /// Write the model back to the container's path.
    ///
    /// The model is marked clean only if it was not edited while the write
    /// was in flight.
    pub async fn save(&self, id: ContainerId) -> Result<(), LifecycleError> {
        let container = self.get(id)?;
        let (content, revision) = container.model().snapshot()?;
        tokio::fs::write(container.path(), content)
            .await
            .map_err(|source| DocumentError::Write {
                path: container.path().to_path_buf(),
                source,
            })?;
        if container.model().mark_saved(revision) {
            info!(
                "[coordinator] Saved {} to {}",
                id,
                container.path().display()
            );
        } else {
            info!(
                "[coordinator] Saved {} to {}; edited during save, still dirty",
                id,
                container.path().display()
            );
        }
        Ok(())
    }

    pub fn container(&self, id: ContainerId) -> Option<Arc<DocumentContainer>> {
        self.lock_containers().get(&id).cloned()
    }

    pub fn current_model(&self, id: ContainerId) -> Option<Arc<NotebookModel>> {
        self.container(id).map(|c| c.model().clone())
    }

    pub fn current_session(&self, id: ContainerId) -> Option<Arc<dyn KernelSession>> {
        self.container(id).and_then(|c| c.session())
    }

    /// Open container for `path`, if any.
    pub fn find_by_path(&self, path: &Path) -> Option<ContainerId> {
        self.lock_containers()
            .values()
            .find(|c| c.path() == path)
            .map(|c| c.id())
    }

    pub fn open_containers(&self) -> Vec<ContainerId> {
        let mut ids: Vec<ContainerId> = self.lock_containers().keys().copied().collect();
        ids.sort();
        ids
    }

    /// File-handler-level dirty flag for a container.
    pub fn is_dirty(&self, id: ContainerId) -> bool {
        self.tracker.is_dirty(id)
    }

    pub fn dirty_containers(&self) -> Vec<ContainerId> {
        self.tracker.dirty_containers()
    }

    async fn confirm_shutdown(
        &self,
        container: &DocumentContainer,
        session: &dyn KernelSession,
    ) -> bool {
        let dialog = Dialog {
            title: "Shut down kernel?".to_string(),
            body: format!(
                "Shut down the {} kernel for {}?",
                session.kernel_display_name(),
                container.path().display()
            ),
            host: container.id(),
        };
        match self.prompt.show(dialog).await {
            Ok(response) => response.is_affirmative(),
            Err(e) => {
                debug!("[coordinator] {}", e);
                false
            }
        }
    }

    fn new_container(&self, path: PathBuf) -> Arc<DocumentContainer> {
        let id = ContainerId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let container = Arc::new(DocumentContainer::new(id, path));

        self.tracker.track(id, container.model());
        container
            .model()
            .connect_changed(self.tracker.listener());
        info!(
            "[coordinator] Created {} for {}",
            id,
            container.path().display()
        );
        container
    }

    fn release(&self, container: &DocumentContainer) {
        let id = container.id();
        self.lock_containers().remove(&id);
        self.tracker.untrack(id);
        container.model().disconnect_all();
        container.take_session();
        container.set_state(ContainerState::Closed);
        info!("[coordinator] Closed {}", id);
    }

    fn get(&self, id: ContainerId) -> Result<Arc<DocumentContainer>, LifecycleError> {
        self.container(id)
            .ok_or(LifecycleError::UnknownContainer(id))
    }

    fn lock_containers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ContainerId, Arc<DocumentContainer>>> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a container whose `open` did not complete, whether it failed or
/// was dropped mid-way.
struct PendingOpen<'a> {
    coordinator: &'a LifecycleCoordinator,
    container: Option<Arc<DocumentContainer>>,
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        if let Some(container) = self.container.take() {
            self.coordinator.release(&container);
        }
    }
}

fn expect_state(
    container: &DocumentContainer,
    expected: ContainerState,
) -> Result<(), LifecycleError> {
    let actual = container.state();
    if actual != expected {
        return Err(LifecycleError::InvalidState {
            id: container.id(),
            actual,
            expected,
        });
    }
    Ok(())
}
