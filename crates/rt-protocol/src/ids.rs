//! Sentinel identifiers used throughout the delta protocol.

use uuid::Uuid;

/// `parent_delta_id` sentinel meaning "no parent" — this delta is the first
/// in the chain.
pub const ROOT_DELTA_ID: Uuid = Uuid::nil();

/// `prior_value` sentinel meaning "no prior value was observed by the
/// sender" — never compared against the current value.
pub const NULL_PRIOR_VALUE: &str = "__NULL_PRIOR_VALUE__";

pub fn is_root(id: Uuid) -> bool {
    id == ROOT_DELTA_ID
}
