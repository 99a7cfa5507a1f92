//! Cell-level operations on an open notebook.
//!
//! Every mutation marks the owning model dirty, which flows through the
//! model's change notifications like any other edit.

use std::sync::Arc;

use nbformat::v4::{Cell, CellId};
use uuid::Uuid;

use crate::document::{empty_cell_metadata, NotebookModel};

/// Kind of cell to insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
}

impl std::str::FromStr for CellKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(CellKind::Code),
            "markdown" => Ok(CellKind::Markdown),
            "raw" => Ok(CellKind::Raw),
            other => Err(format!("Unknown cell type: {other}")),
        }
    }
}

/// Convert source string back to nbformat's Vec<String> (lines with newlines).
fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

pub struct CellManager {
    model: Arc<NotebookModel>,
}

impl CellManager {
    pub fn new(model: Arc<NotebookModel>) -> Self {
        Self { model }
    }

    pub fn cell_ids(&self) -> Vec<String> {
        self.model
            .read(|nb| nb.cells.iter().map(|c| c.id().to_string()).collect())
    }

    pub fn find_cell_index(&self, cell_id: &str) -> Option<usize> {
        self.model
            .read(|nb| nb.cells.iter().position(|c| c.id().as_str() == cell_id))
    }

    pub fn cell_source(&self, cell_id: &str) -> Option<String> {
        self.model.read(|nb| {
            nb.cells
                .iter()
                .find(|c| c.id().as_str() == cell_id)
                .map(|c| c.source().join(""))
        })
    }

    /// Replace a cell's source. Returns false if the cell does not exist.
    pub fn update_cell_source(&self, cell_id: &str, source: &str) -> bool {
        let lines = source_to_lines(source);
        let updated = self.model.edit(|nb| {
            let Some(cell) = nb.cells.iter_mut().find(|c| c.id().as_str() == cell_id) else {
                return false;
            };
            match cell {
                Cell::Code { source: s, .. }
                | Cell::Markdown { source: s, .. }
                | Cell::Raw { source: s, .. } => *s = lines,
            }
            true
        });
        if updated {
            self.model.set_dirty(true);
        }
        updated
    }

    /// Insert a new empty cell after `after_cell_id`, or at the top when
    /// `None`. An unknown anchor appends at the end. Returns the new cell id.
    pub fn add_cell(&self, kind: CellKind, after_cell_id: Option<&str>) -> String {
        let new_id = CellId::from(Uuid::new_v4());
        let id_string = new_id.to_string();
        let cell = match kind {
            CellKind::Code => Cell::Code {
                id: new_id,
                metadata: empty_cell_metadata(),
                execution_count: None,
                source: Vec::new(),
                outputs: Vec::new(),
            },
            CellKind::Markdown => Cell::Markdown {
                id: new_id,
                metadata: empty_cell_metadata(),
                source: Vec::new(),
                attachments: None,
            },
            CellKind::Raw => Cell::Raw {
                id: new_id,
                metadata: empty_cell_metadata(),
                source: Vec::new(),
            },
        };

        let insert_idx = match after_cell_id {
            Some(id) => self.find_cell_index(id).map(|i| i + 1),
            None => Some(0),
        };
        self.model.edit(|nb| match insert_idx {
            Some(idx) => nb.cells.insert(idx, cell),
            None => nb.cells.push(cell),
        });
        self.model.set_dirty(true);
        id_string
    }

    /// Remove a cell. The last remaining cell is never removed.
    pub fn delete_cell(&self, cell_id: &str) -> bool {
        let removed = self.model.edit(|nb| {
            if nb.cells.len() <= 1 {
                return false;
            }
            match nb.cells.iter().position(|c| c.id().as_str() == cell_id) {
                Some(idx) => {
                    nb.cells.remove(idx);
                    true
                }
                None => false,
            }
        });
        if removed {
            self.model.set_dirty(true);
        }
        removed
    }

    /// Clear outputs and execution count of a code cell.
    pub fn clear_outputs(&self, cell_id: &str) -> bool {
        let cleared = self.model.edit(|nb| {
            match nb.cells.iter_mut().find(|c| c.id().as_str() == cell_id) {
                Some(Cell::Code {
                    outputs,
                    execution_count,
                    ..
                }) => {
                    outputs.clear();
                    *execution_count = None;
                    true
                }
                _ => false,
            }
        });
        if cleared {
            self.model.set_dirty(true);
        }
        cleared
    }
}
