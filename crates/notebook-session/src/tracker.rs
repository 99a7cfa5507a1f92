//! Dirty-state mirroring from document models to the file handler.
//!
//! The tracker keeps a map from model identity to the container that owns it,
//! updated as containers are tracked and untracked, so a change notification
//! resolves to its container with one lookup. Only notifications for the
//! dirty attribute are applied, and only to the owning container.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::debug;

use crate::container::ContainerId;
use crate::document::{ChangeListener, ModelChange, ModelId, NotebookModel};

#[derive(Default)]
struct TrackerState {
    owners: HashMap<ModelId, ContainerId>,
    dirty: HashMap<ContainerId, bool>,
}

#[derive(Default)]
pub struct DirtyTracker {
    state: Mutex<TrackerState>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start mirroring `model` into the flag for `container`.
    pub fn track(&self, container: ContainerId, model: &NotebookModel) {
        let mut state = self.lock();
        state.owners.insert(model.id(), container);
        state.dirty.insert(container, model.is_dirty());
    }

    /// Stop mirroring for `container`. Later notifications from its model
    /// are ignored.
    pub fn untrack(&self, container: ContainerId) {
        let mut state = self.lock();
        state.owners.retain(|_, owner| *owner != container);
        state.dirty.remove(&container);
    }

    /// Apply a model change notification.
    pub fn on_model_change(&self, model: ModelId, change: &ModelChange) {
        if !change.is_dirty_change() {
            return;
        }
        let Some(dirty) = change.new_value.as_bool() else {
            debug!("[dirty] Non-boolean dirty value from model {}", model);
            return;
        };

        let mut state = self.lock();
        let Some(container) = state.owners.get(&model).copied() else {
            debug!("[dirty] Model {} has no open container", model);
            return;
        };
        state.dirty.insert(container, dirty);
        debug!("[dirty] Container {} dirty={}", container, dirty);
    }

    /// Listener suitable for [`NotebookModel::connect_changed`].
    pub fn listener(self: &Arc<Self>) -> ChangeListener {
        let tracker: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |model, change| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.on_model_change(model, change);
            }
        })
    }

    /// Handler-level dirty flag for `container`.
    pub fn is_dirty(&self, container: ContainerId) -> bool {
        self.lock().dirty.get(&container).copied().unwrap_or(false)
    }

    pub fn dirty_containers(&self) -> Vec<ContainerId> {
        let mut dirty: Vec<ContainerId> = self
            .lock()
            .dirty
            .iter()
            .filter(|(_, dirty)| **dirty)
            .map(|(id, _)| *id)
            .collect();
        dirty.sort();
        dirty
    }

    pub fn is_tracking(&self, container: ContainerId) -> bool {
        self.lock().dirty.contains_key(&container)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
