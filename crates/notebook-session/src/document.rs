//! Notebook document model.
//!
//! A [`NotebookModel`] owns the nbformat content of one open notebook plus its
//! dirty flag. Attribute changes are announced synchronously to connected
//! listeners as [`ModelChange`] notifications carrying the sending model's
//! [`ModelId`].
//!
//! Models are never cloned: every model gets a fresh id at construction, so two
//! models with identical content still compare unequal by id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use nbformat::v4::{Cell, CellId, CellMetadata, Metadata, Notebook};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::DocumentError;
use crate::kernelspec::KernelHint;

/// Name of the dirty attribute in change notifications.
pub const DIRTY_ATTRIBUTE: &str = "dirty";

/// Identity of a model instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ModelId(Uuid);

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An attribute change on a model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelChange {
    pub name: String,
    pub old_value: Value,
    pub new_value: Value,
}

impl ModelChange {
    /// Whether this change concerns the dirty attribute.
    pub fn is_dirty_change(&self) -> bool {
        self.name == DIRTY_ATTRIBUTE
    }
}

/// Callback invoked with the sending model's id for every change.
pub type ChangeListener = Arc<dyn Fn(ModelId, &ModelChange) + Send + Sync>;

struct ModelState {
    notebook: Notebook,
    dirty: bool,
    /// Bumped when the model is marked dirty or its content is replaced.
    revision: u64,
}

pub struct NotebookModel {
    id: ModelId,
    state: Mutex<ModelState>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl NotebookModel {
    /// Create a model holding an empty notebook with a single code cell.
    pub fn new() -> Self {
        Self {
            id: ModelId(Uuid::new_v4()),
            state: Mutex::new(ModelState {
                notebook: empty_notebook(),
                dirty: false,
                revision: 0,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn is_dirty(&self) -> bool {
        self.lock_state().dirty
    }

    /// Edit counter; changes whenever the model is marked dirty or reloaded.
    pub fn revision(&self) -> u64 {
        self.lock_state().revision
    }

    /// Set the dirty flag, notifying listeners only when the value changes.
    pub fn set_dirty(&self, dirty: bool) {
        let old = {
            let mut state = self.lock_state();
            if dirty {
                state.revision += 1;
            }
            if state.dirty == dirty {
                return;
            }
            std::mem::replace(&mut state.dirty, dirty)
        };
        self.emit_dirty(old, dirty);
    }

    /// Clear the dirty flag for content saved at `revision`.
    ///
    /// Returns false, leaving the model dirty, if it was marked dirty again
    /// after that revision was taken.
    pub fn mark_saved(&self, revision: u64) -> bool {
        {
            let mut state = self.lock_state();
            if state.revision != revision {
                return false;
            }
            if !state.dirty {
                return true;
            }
            state.dirty = false;
        }
        self.emit_dirty(true, false);
        true
    }

    /// Replace the model content with a parsed `.ipynb` document.
    ///
    /// Legacy (pre-4.5) notebooks are upgraded. On failure the model is left
    /// untouched. On success the model is clean.
    pub fn deserialize(&self, content: &str) -> Result<(), DocumentError> {
        let notebook = match nbformat::parse_notebook(content)
            .map_err(|e| DocumentError::Parse(e.to_string()))?
        {
            nbformat::Notebook::V4(nb) => nb,
            nbformat::Notebook::Legacy(legacy) => nbformat::upgrade_legacy_notebook(legacy)
                .map_err(|e| DocumentError::Parse(e.to_string()))?,
            nbformat::Notebook::V3(v3) => nbformat::upgrade_v3_notebook(v3)
                .map_err(|e| DocumentError::Parse(e.to_string()))?,
        };
        debug!(
            "[document] Loaded notebook with {} cells into model {}",
            notebook.cells.len(),
            self.id
        );
        {
            let mut state = self.lock_state();
            state.notebook = notebook;
            state.revision += 1;
        }
        self.set_dirty(false);
        Ok(())
    }

    /// Render the model content as `.ipynb` JSON.
    pub fn serialize(&self) -> Result<String, DocumentError> {
        self.snapshot().map(|(content, _)| content)
    }

    /// Render the content together with the revision it reflects.
    pub fn snapshot(&self) -> Result<(String, u64), DocumentError> {
        let (notebook, revision) = {
            let state = self.lock_state();
            (state.notebook.clone(), state.revision)
        };
        let content = nbformat::serialize_notebook(&nbformat::Notebook::V4(notebook))
            .map_err(|e| DocumentError::Serialize(e.to_string()))?;
        Ok((content, revision))
    }

    /// Kernel metadata declared by the notebook.
    ///
    /// Reads `metadata.kernelspec.{name,language}`, falling back to
    /// `metadata.language_info.name` for the language.
    pub fn kernel_hint(&self) -> KernelHint {
        let metadata = self
            .read(|nb| serde_json::to_value(&nb.metadata))
            .unwrap_or(Value::Null);

        let kernelspec = metadata.get("kernelspec");
        let name = kernelspec
            .and_then(|k| k.get("name"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from);
        let language = kernelspec
            .and_then(|k| k.get("language"))
            .and_then(Value::as_str)
            .or_else(|| {
                metadata
                    .get("language_info")
                    .and_then(|li| li.get("name"))
                    .and_then(Value::as_str)
            })
            .filter(|s| !s.is_empty())
            .map(String::from);

        KernelHint { name, language }
    }

    /// Run `f` with shared access to the notebook content.
    pub fn read<R>(&self, f: impl FnOnce(&Notebook) -> R) -> R {
        f(&self.lock_state().notebook)
    }

    /// Run `f` with exclusive access to the notebook content.
    ///
    /// Does not touch the dirty flag; callers mark the model dirty when the
    /// edit actually changed something.
    pub fn edit<R>(&self, f: impl FnOnce(&mut Notebook) -> R) -> R {
        f(&mut self.lock_state().notebook)
    }

    /// Subscribe to change notifications.
    pub fn connect_changed(&self, listener: ChangeListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Drop all listeners.
    pub fn disconnect_all(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn emit_dirty(&self, old: bool, new: bool) {
        self.emit(ModelChange {
            name: DIRTY_ATTRIBUTE.to_string(),
            old_value: Value::Bool(old),
            new_value: Value::Bool(new),
        });
    }

    fn emit(&self, change: ModelChange) {
        // Snapshot so listeners may touch the model without deadlocking.
        let listeners: Vec<ChangeListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(self.id, &change);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for NotebookModel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotebookModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookModel")
            .field("id", &self.id)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

fn empty_notebook() -> Notebook {
    Notebook {
        metadata: Metadata {
            kernelspec: None,
            language_info: None,
            authors: None,
            additional: HashMap::new(),
        },
        nbformat: 4,
        nbformat_minor: 5,
        cells: vec![Cell::Code {
            id: CellId::from(Uuid::new_v4()),
            metadata: empty_cell_metadata(),
            execution_count: None,
            source: Vec::new(),
            outputs: Vec::new(),
        }],
    }
}

pub(crate) fn empty_cell_metadata() -> CellMetadata {
    CellMetadata {
        id: None,
        collapsed: None,
        scrolled: None,
        deletable: None,
        editable: None,
        format: None,
        name: None,
        tags: None,
        jupyter: None,
        execution: None,
        additional: HashMap::new(),
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_NOTEBOOK: &str = r##"{
  "cells": [
    {
      "cell_type": "code",
      "id": "cell-1",
      "metadata": {},
      "execution_count": null,
      "outputs": [],
      "source": ["print('hello')\n", "x = 1"]
    },
    {
      "cell_type": "markdown",
      "id": "cell-2",
      "metadata": {},
      "source": ["# Title"]
    }
  ],
  "metadata": {
    "kernelspec": {
      "name": "python3",
      "display_name": "Python 3",
      "language": "python"
    }
  },
  "nbformat": 4,
  "nbformat_minor": 5
}"##;
