//! The notebook builder: the single-writer mutable document plus
//! `apply_delta`, total and idempotent-on-replay for every delta variant.

use std::collections::HashSet;

use rt_protocol::notebook::{Cell, CodeCell, TextCell};
use rt_protocol::{Delta, DeltaDecodeError, DeltaPayload, Metadata, Notebook, Output};
use thiserror::Error;
use uuid::Uuid;

use crate::patch::{self, PatchError};
use crate::path::apply_nested_path_update;

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error(transparent)]
    Decode(#[from] DeltaDecodeError),
    #[error("cell {cell_id} not found")]
    CellNotFound { cell_id: String },
    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// Holds the mutable notebook document and the bookkeeping `apply_delta`
/// needs to behave idempotently under replay: which cells have been
/// deleted (so late-arriving deltas against them are dropped, not errored)
/// and the id of the last delta successfully applied.
pub struct NotebookBuilder {
    notebook: Notebook,
    last_applied_delta_id: Option<Uuid>,
    deleted_cell_ids: HashSet<String>,
}

impl NotebookBuilder {
    pub fn new(notebook: Notebook) -> Self {
        NotebookBuilder {
            notebook,
            last_applied_delta_id: None,
            deleted_cell_ids: HashSet::new(),
        }
    }

    pub fn notebook(&self) -> &Notebook {
        &self.notebook
    }

    pub fn last_applied_delta_id(&self) -> Option<Uuid> {
        self.last_applied_delta_id
    }

    /// Seed `last_applied_delta_id` without applying anything. Used when a
    /// subscription reply's `deltas_to_apply` is empty but `latest_delta_id`
    /// is set — the document is already current, there's just nothing to
    /// replay to get there.
    pub fn seed_last_applied_delta_id(&mut self, id: Uuid) {
        if self.last_applied_delta_id.is_none() {
            self.last_applied_delta_id = Some(id);
        }
    }

    pub fn deleted_cell_ids(&self) -> &HashSet<String> {
        &self.deleted_cell_ids
    }

    pub fn to_json_compact(&self) -> serde_json::Result<String> {
        self.notebook.to_json_compact()
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        self.notebook.to_json_pretty()
    }

    /// Apply one delta. On success, `last_applied_delta_id` advances to
    /// `delta.id`. On error, the document is left exactly as found — the
    /// caller (the RTU client) treats this as catastrophic and does not
    /// retry.
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<(), BuilderError> {
        let payload = DeltaPayload::decode(delta)?;

        match payload {
            DeltaPayload::NbCellsAdd {
                id,
                after_id,
                mut cell,
            } => {
                if self.notebook.cell(&id).is_some() {
                    tracing::warn!(
                        target: "rt_model",
                        cell_id = %id,
                        "nb_cells/add: duplicate cell id, inserting anyway"
                    );
                }
                cell.set_id(id);
                let insert_at = after_id
                    .as_deref()
                    .and_then(|after| self.notebook.index_of(after))
                    .map(|i| i + 1)
                    .unwrap_or(0)
                    .min(self.notebook.cells.len());
                self.notebook.cells.insert(insert_at, cell);
            }
            DeltaPayload::NbCellsDelete { id } => {
                let idx = self
                    .notebook
                    .index_of(&id)
                    .ok_or_else(|| BuilderError::CellNotFound {
                        cell_id: id.clone(),
                    })?;
                self.notebook.cells.remove(idx);
                self.deleted_cell_ids.insert(id);
            }
            DeltaPayload::NbCellsMove { id, after_id } => {
                if after_id.as_deref() == Some(id.as_str()) {
                    tracing::debug!(target: "rt_model", cell_id = %id, "nb_cells/move: id == after_id, no-op");
                } else if let Some(idx) = self.notebook.index_of(&id) {
                    let cell = self.notebook.cells.remove(idx);
                    let insert_at = after_id
                        .as_deref()
                        .and_then(|after| self.notebook.index_of(after))
                        .map(|i| i + 1)
                        .unwrap_or(0)
                        .min(self.notebook.cells.len());
                    self.notebook.cells.insert(insert_at, cell);
                } else {
                    tracing::warn!(target: "rt_model", cell_id = %id, "nb_cells/move: cell not found, ignoring");
                }
            }
            DeltaPayload::CellContentsUpdate { patch: patch_text } => {
                self.with_cell_mut(delta.resource_id.as_deref(), "cell_contents/update", |cell| {
                    let patched = patch::apply_patch(cell.source(), &patch_text)?;
                    cell.set_source(patched);
                    Ok(())
                })?;
            }
            DeltaPayload::CellContentsReplace { source } => {
                self.with_cell_mut(
                    delta.resource_id.as_deref(),
                    "cell_contents/replace",
                    |cell| {
                        cell.set_source(source);
                        Ok(())
                    },
                )?;
            }
            DeltaPayload::CellMetadataUpdate {
                path,
                value,
                prior_value,
            } => {
                self.with_cell_mut(delta.resource_id.as_deref(), "cell_metadata/update", |cell| {
                    apply_nested_path_update(
                        cell.metadata_mut(),
                        &path,
                        value,
                        prior_value,
                        "cell_metadata/update",
                    );
                    Ok(())
                })?;
            }
            DeltaPayload::CellMetadataReplace {
                cell_type,
                language,
                db_connection,
                assign_to,
            } => {
                self.with_cell_mut(
                    delta.resource_id.as_deref(),
                    "cell_metadata/replace",
                    |cell| {
                        if let Some(new_type) = &cell_type {
                            if cell.type_tag() != new_type.as_str() {
                                let placeholder = Cell::Raw(TextCell {
                                    id: String::new(),
                                    source: String::new(),
                                    metadata: Metadata::new(),
                                });
                                let original = std::mem::replace(cell, placeholder);
                                *cell = retag_cell(original, new_type);
                            }
                        }
                        if let Some(lang) = language {
                            let path = vec!["noteable".to_owned(), "cell_type".to_owned()];
                            apply_nested_path_update(
                                cell.metadata_mut(),
                                &path,
                                serde_json::Value::String(lang),
                                None,
                                "cell_metadata/replace",
                            );
                        }
                        if let Some(db_connection) = db_connection {
                            let path = vec!["noteable".to_owned(), "db_connection".to_owned()];
                            apply_nested_path_update(
                                cell.metadata_mut(),
                                &path,
                                serde_json::Value::String(db_connection),
                                None,
                                "cell_metadata/replace",
                            );
                        }
                        if let Some(assign_to) = assign_to {
                            let path = vec!["noteable".to_owned(), "assign_results_to".to_owned()];
                            apply_nested_path_update(
                                cell.metadata_mut(),
                                &path,
                                serde_json::Value::String(assign_to),
                                None,
                                "cell_metadata/replace",
                            );
                        }
                        Ok(())
                    },
                )?;
            }
            DeltaPayload::NbMetadataUpdate {
                path,
                value,
                prior_value,
            } => {
                apply_nested_path_update(
                    &mut self.notebook.metadata,
                    &path,
                    value,
                    prior_value,
                    "nb_metadata/update",
                );
            }
            DeltaPayload::CellOutputCollectionReplace {
                output_collection_id,
            } => {
                self.with_cell_mut(
                    delta.resource_id.as_deref(),
                    "cell_output_collection/replace",
                    |cell| {
                        let path = vec!["noteable".to_owned(), "output_collection_id".to_owned()];
                        apply_nested_path_update(
                            cell.metadata_mut(),
                            &path,
                            serde_json::Value::String(output_collection_id),
                            None,
                            "cell_output_collection/replace",
                        );
                        Ok(())
                    },
                )?;
            }
            DeltaPayload::CellExecute { kind } => {
                tracing::debug!(
                    target: "rt_model",
                    ?kind,
                    resource_id = ?delta.resource_id,
                    "cell_execute delta recorded, no document mutation"
                );
            }
            DeltaPayload::Unknown {
                delta_type,
                delta_action,
            } => {
                tracing::warn!(
                    target: "rt_model",
                    delta_type,
                    delta_action,
                    "unrecognized delta, ignoring"
                );
            }
        }

        self.last_applied_delta_id = Some(delta.id);
        Ok(())
    }

    /// Handles `update_output_collection_event`: replaces the cell's whole
    /// output list. Bypasses `apply_delta` — this event carries no
    /// causality fields and isn't part of the delta chain.
    pub fn apply_update_output_collection(&mut self, cell_id: &str, outputs: Vec<Output>) {
        self.mutate_outputs_or_warn(cell_id, "update_output_collection_event", |existing| {
            *existing = outputs;
        });
    }

    /// Handles `append_output_event`: appends one output. Same bypass as
    /// above.
    pub fn apply_append_output(&mut self, cell_id: &str, output: Output) {
        self.mutate_outputs_or_warn(cell_id, "append_output_event", |existing| {
            existing.push(output);
        });
    }

    fn with_cell_mut(
        &mut self,
        cell_id: Option<&str>,
        op: &'static str,
        f: impl FnOnce(&mut Cell) -> Result<(), BuilderError>,
    ) -> Result<(), BuilderError> {
        let Some(cell_id) = cell_id else {
            tracing::warn!(target: "rt_model", op, "delta has no resource_id; dropping");
            return Ok(());
        };
        if self.deleted_cell_ids.contains(cell_id) {
            return Ok(());
        }
        match self.notebook.cell_mut(cell_id) {
            Some(cell) => f(cell),
            None => {
                tracing::warn!(target: "rt_model", op, cell_id, "target cell missing; dropping");
                Ok(())
            }
        }
    }

    fn mutate_outputs_or_warn(
        &mut self,
        cell_id: &str,
        op: &'static str,
        f: impl FnOnce(&mut Vec<Output>),
    ) {
        if self.deleted_cell_ids.contains(cell_id) {
            return;
        }
        match self.notebook.cell_mut(cell_id) {
            Some(Cell::Code(CodeCell { outputs, .. })) => f(outputs),
            Some(_) => tracing::warn!(
                target: "rt_model",
                op,
                cell_id,
                "target cell is not a code cell; dropping output event"
            ),
            None => tracing::warn!(
                target: "rt_model",
                op,
                cell_id,
                "target cell missing; dropping output event"
            ),
        }
    }
}

fn retag_cell(cell: Cell, new_type: &str) -> Cell {
    let id = cell.id().to_owned();
    let source = cell.source().to_owned();
    let metadata = cell.metadata().clone();
    match new_type {
        "code" => Cell::Code(CodeCell {
            id,
            source,
            metadata,
            execution_count: None,
            outputs: Vec::new(),
        }),
        "markdown" => Cell::Markdown(TextCell {
            id,
            source,
            metadata,
        }),
        "raw" => Cell::Raw(TextCell {
            id,
            source,
            metadata,
        }),
        other => {
            tracing::warn!(
                target: "rt_model",
                new_type = other,
                "unknown cell_type in cell_metadata/replace; leaving cell unchanged"
            );
            cell
        }
    }
}
