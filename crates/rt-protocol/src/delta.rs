//! Delta wire shape and the (delta_type, delta_action) discriminator.
//!
//! `Delta` is what actually crosses the wire: `delta_type`/`delta_action`
//! are plain strings and `properties` is untyped JSON, because the set of
//! shapes the server may send is allowed to grow without breaking older
//! clients (the "lazy, optional discriminated union with catch-all
//! fallback" pattern). [`DeltaPayload::decode`] is the one place that maps
//! the pair onto a closed Rust enum, with an `Unknown` arm for anything
//! the client doesn't recognise yet.

use crate::ids::ROOT_DELTA_ID;
use crate::notebook::Cell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub id: Uuid,
    #[serde(default = "root_delta_id")]
    pub parent_delta_id: Uuid,
    pub file_id: Uuid,
    pub delta_type: String,
    pub delta_action: String,
    /// The cell this delta targets, or `None` for the "no resource" sentinel
    /// (e.g. a brand-new cell that doesn't exist on the document yet).
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub properties: Value,
}

fn root_delta_id() -> Uuid {
    ROOT_DELTA_ID
}

/// A value compared against `prior_value` using the nested-path update
/// algorithm's "compare as string" rule (§4.3 of the spec this implements).
pub fn values_differ_as_string(a: &Value, b: &Value) -> bool {
    value_to_compare_string(a) != value_to_compare_string(b)
}

fn value_to_compare_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Typed view of [`Delta::properties`], keyed by `(delta_type, delta_action)`.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaPayload {
    NbCellsAdd {
        /// Authoritative id for the new cell — overwrites any id embedded
        /// in `cell`.
        id: String,
        after_id: Option<String>,
        cell: Cell,
    },
    NbCellsDelete {
        id: String,
    },
    NbCellsMove {
        id: String,
        after_id: Option<String>,
    },
    CellContentsUpdate {
        patch: String,
    },
    CellContentsReplace {
        source: String,
    },
    CellMetadataUpdate {
        path: Vec<String>,
        value: Value,
        prior_value: Option<Value>,
    },
    CellMetadataReplace {
        cell_type: Option<String>,
        language: Option<String>,
        /// SQL-cell-only fields, written into `metadata.noteable.db_connection`
        /// / `metadata.noteable.assign_results_to` — the second delta a
        /// `change_cell_type` call emits when converting a cell to `sql`.
        db_connection: Option<String>,
        assign_to: Option<String>,
    },
    NbMetadataUpdate {
        path: Vec<String>,
        value: Value,
        prior_value: Option<Value>,
    },
    CellOutputCollectionReplace {
        output_collection_id: String,
    },
    CellExecute {
        kind: CellExecuteKind,
    },
    /// A `(delta_type, delta_action)` pair this client build doesn't
    /// recognise. Carried through rather than rejected, matching the
    /// catch-all fallback design note.
    Unknown {
        delta_type: String,
        delta_action: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellExecuteKind {
    Execute,
    ExecuteAll,
    ExecuteBefore,
    ExecuteAfter,
}

#[derive(Debug, thiserror::Error)]
pub enum DeltaDecodeError {
    #[error("malformed properties for {delta_type}/{delta_action}: {source}")]
    MalformedProperties {
        delta_type: String,
        delta_action: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DeltaPayload {
    pub fn decode(delta: &Delta) -> Result<DeltaPayload, DeltaDecodeError> {
        let err = |source: serde_json::Error| DeltaDecodeError::MalformedProperties {
            delta_type: delta.delta_type.clone(),
            delta_action: delta.delta_action.clone(),
            source,
        };

        Ok(
            match (delta.delta_type.as_str(), delta.delta_action.as_str()) {
                ("nb_cells", "add") => {
                    #[derive(Deserialize)]
                    struct Props {
                        id: String,
                        #[serde(default)]
                        after_id: Option<String>,
                        cell: Cell,
                    }
                    let p: Props =
                        serde_json::from_value(delta.properties.clone()).map_err(err)?;
                    DeltaPayload::NbCellsAdd {
                        id: p.id,
                        after_id: p.after_id,
                        cell: p.cell,
                    }
                }
                ("nb_cells", "delete") => {
                    #[derive(Deserialize)]
                    struct Props {
                        id: String,
                    }
                    let p: Props =
                        serde_json::from_value(delta.properties.clone()).map_err(err)?;
                    DeltaPayload::NbCellsDelete { id: p.id }
                }
                ("nb_cells", "move") => {
                    #[derive(Deserialize)]
                    struct Props {
                        id: String,
                        #[serde(default)]
                        after_id: Option<String>,
                    }
                    let p: Props =
                        serde_json::from_value(delta.properties.clone()).map_err(err)?;
                    DeltaPayload::NbCellsMove {
                        id: p.id,
                        after_id: p.after_id,
                    }
                }
                ("cell_contents", "update") => {
                    #[derive(Deserialize)]
                    struct Props {
                        patch: String,
                    }
                    let p: Props =
                        serde_json::from_value(delta.properties.clone()).map_err(err)?;
                    DeltaPayload::CellContentsUpdate { patch: p.patch }
                }
                ("cell_contents", "replace") => {
                    #[derive(Deserialize)]
                    struct Props {
                        source: String,
                    }
                    let p: Props =
                        serde_json::from_value(delta.properties.clone()).map_err(err)?;
                    DeltaPayload::CellContentsReplace { source: p.source }
                }
                ("cell_metadata", "update") => {
                    #[derive(Deserialize)]
                    struct Props {
                        path: Vec<String>,
                        value: Value,
                        #[serde(default)]
                        prior_value: Option<Value>,
                    }
                    let p: Props =
                        serde_json::from_value(delta.properties.clone()).map_err(err)?;
                    DeltaPayload::CellMetadataUpdate {
                        path: p.path,
                        value: p.value,
                        prior_value: p.prior_value,
                    }
                }
                ("cell_metadata", "replace") => {
                    #[derive(Deserialize)]
                    struct Props {
                        #[serde(default)]
                        cell_type: Option<String>,
                        #[serde(default)]
                        language: Option<String>,
                        #[serde(default)]
                        db_connection: Option<String>,
                        #[serde(default)]
                        assign_to: Option<String>,
                    }
                    let p: Props =
                        serde_json::from_value(delta.properties.clone()).map_err(err)?;
                    DeltaPayload::CellMetadataReplace {
                        cell_type: p.cell_type,
                        language: p.language,
                        db_connection: p.db_connection,
                        assign_to: p.assign_to,
                    }
                }
                ("nb_metadata", "update") => {
                    #[derive(Deserialize)]
                    struct Props {
                        path: Vec<String>,
                        value: Value,
                        #[serde(default)]
                        prior_value: Option<Value>,
                    }
                    let p: Props =
                        serde_json::from_value(delta.properties.clone()).map_err(err)?;
                    DeltaPayload::NbMetadataUpdate {
                        path: p.path,
                        value: p.value,
                        prior_value: p.prior_value,
                    }
                }
                ("cell_output_collection", "replace") => {
                    #[derive(Deserialize)]
                    struct Props {
                        output_collection_id: String,
                    }
                    let p: Props =
                        serde_json::from_value(delta.properties.clone()).map_err(err)?;
                    DeltaPayload::CellOutputCollectionReplace {
                        output_collection_id: p.output_collection_id,
                    }
                }
                ("cell_execute", action) => {
                    let kind = match action {
                        "execute" => CellExecuteKind::Execute,
                        "execute_all" => CellExecuteKind::ExecuteAll,
                        "execute_before" => CellExecuteKind::ExecuteBefore,
                        "execute_after" => CellExecuteKind::ExecuteAfter,
                        other => {
                            return Ok(DeltaPayload::Unknown {
                                delta_type: delta.delta_type.clone(),
                                delta_action: other.to_owned(),
                            });
                        }
                    };
                    DeltaPayload::CellExecute { kind }
                }
                (delta_type, delta_action) => DeltaPayload::Unknown {
                    delta_type: delta_type.to_owned(),
                    delta_action: delta_action.to_owned(),
                },
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta_with(delta_type: &str, delta_action: &str, properties: Value) -> Delta {
        Delta {
            id: Uuid::new_v4(),
            parent_delta_id: ROOT_DELTA_ID,
            file_id: Uuid::new_v4(),
            delta_type: delta_type.to_owned(),
            delta_action: delta_action.to_owned(),
            resource_id: None,
            properties,
        }
    }

    #[test]
    fn decodes_nb_cells_add() {
        let d = delta_with(
            "nb_cells",
            "add",
            json!({
                "id": "c1",
                "after_id": null,
                "cell": {"cell_type": "code", "id": "stale", "source": "", "outputs": []},
            }),
        );
        match DeltaPayload::decode(&d).unwrap() {
            DeltaPayload::NbCellsAdd { id, after_id, cell } => {
                assert_eq!(id, "c1");
                assert_eq!(after_id, None);
                assert_eq!(cell.id(), "stale"); // overwritten by caller, not here
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn unknown_delta_type_decodes_to_unknown_variant() {
        let d = delta_with("future_feature", "frobnicate", json!({"whatever": 1}));
        match DeltaPayload::decode(&d).unwrap() {
            DeltaPayload::Unknown {
                delta_type,
                delta_action,
            } => {
                assert_eq!(delta_type, "future_feature");
                assert_eq!(delta_action, "frobnicate");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn values_differ_as_string_compares_numbers_and_strings_textually() {
        assert!(!values_differ_as_string(&json!(7), &json!("7")));
        assert!(values_differ_as_string(&json!(7), &json!(8)));
    }
}
