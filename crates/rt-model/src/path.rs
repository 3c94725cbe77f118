//! The nested-path metadata update algorithm shared by `cell_metadata/update`
//! and `nb_metadata/update`.

use rt_protocol::delta::values_differ_as_string;
use rt_protocol::{Metadata, NULL_PRIOR_VALUE};
use serde_json::{Map, Value};

/// Walk `path[0..-1]` into `root`, creating empty sub-mappings for any
/// missing intermediate key, then set `path[-1]` to `value`. If `k` is
/// already present, `prior_value` is given and isn't the null-prior
/// sentinel, and the existing value differs from `prior_value` when
/// compared as strings, logs a warning but still overwrites.
pub fn apply_nested_path_update(
    root: &mut Metadata,
    path: &[String],
    value: Value,
    prior_value: Option<Value>,
    op: &'static str,
) {
    let Some((last, ancestors)) = path.split_last() else {
        tracing::warn!(target: "rt_model", op, "metadata update with empty path; ignoring");
        return;
    };

    let mut current = root;
    for key in ancestors {
        let entry = current
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("just normalized to an object");
    }

    if let Some(existing) = current.get(last) {
        if let Some(prior) = &prior_value {
            let is_sentinel = matches!(prior, Value::String(s) if s == NULL_PRIOR_VALUE);
            if !is_sentinel && values_differ_as_string(existing, prior) {
                tracing::warn!(
                    target: "rt_model",
                    op,
                    path = ?path,
                    expected = %prior,
                    found = %existing,
                    "prior_value mismatch on metadata update, overwriting anyway"
                );
            }
        }
    }

    current.insert(last.clone(), value);
}
