//! Session resolution: reuse the session bound to a path, else start one.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::document::NotebookModel;
use crate::error::SessionError;
use crate::kernelspec::{select_kernel_name, KernelspecCache, KernelspecCatalog};
use crate::session::{KernelSession, SessionLookup, SessionManager, StartOptions};
use crate::settings::UnreachablePolicy;

pub struct SessionResolver {
    manager: Arc<dyn SessionManager>,
    kernelspecs: KernelspecCache,
    default_kernel: String,
    unreachable: UnreachablePolicy,
}

impl SessionResolver {
    pub fn new(
        manager: Arc<dyn SessionManager>,
        catalog: Arc<dyn KernelspecCatalog>,
        default_kernel: impl Into<String>,
        unreachable: UnreachablePolicy,
    ) -> Self {
        Self {
            manager,
            kernelspecs: KernelspecCache::new(catalog),
            default_kernel: default_kernel.into(),
            unreachable,
        }
    }

    /// Look for an existing session bound to `path` and try to attach.
    ///
    /// A failed lookup means no session is registered; a failed connect
    /// means one is registered but unusable.
    pub async fn lookup(&self, path: &Path) -> SessionLookup {
        let id = match self.manager.find_by_path(path).await {
            Ok(id) => id,
            Err(e) => {
                debug!("[resolver] No session for {}: {}", path.display(), e);
                return SessionLookup::NotFound;
            }
        };
        match self.manager.connect(&id).await {
            Ok(session) => SessionLookup::Found(session),
            Err(e) => SessionLookup::Unreachable {
                id,
                reason: e.to_string(),
            },
        }
    }

    /// Produce a live session for the notebook at `path`, preferring reuse.
    pub async fn resolve(
        &self,
        path: &Path,
        model: &NotebookModel,
    ) -> Result<Arc<dyn KernelSession>, SessionError> {
        match self.lookup(path).await {
            SessionLookup::Found(session) => {
                info!(
                    "[resolver] Reusing session {} for {}",
                    session.id(),
                    path.display()
                );
                return Ok(session);
            }
            SessionLookup::NotFound => {}
            SessionLookup::Unreachable { id, reason } => match self.unreachable {
                UnreachablePolicy::StartNew => {
                    warn!(
                        "[resolver] Session {} for {} is unreachable ({}), starting a new one",
                        id,
                        path.display(),
                        reason
                    );
                }
                UnreachablePolicy::Fail => {
                    return Err(SessionError::Unreachable { id, reason });
                }
            },
        }

        let kernel_name = self.select_kernel(model).await?;
        info!(
            "[resolver] Starting {} session for {}",
            kernel_name,
            path.display()
        );
        self.manager
            .start(StartOptions {
                kernel_name,
                path: path.to_path_buf(),
            })
            .await
    }

    /// Choose the kernel for `model` from the cached catalog.
    pub async fn select_kernel(&self, model: &NotebookModel) -> Result<String, SessionError> {
        let specs = self.kernelspecs.get().await?;
        select_kernel_name(&model.kernel_hint(), &specs, &self.default_kernel)
    }
}
