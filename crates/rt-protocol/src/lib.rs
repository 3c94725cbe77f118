// rt-protocol: wire types for the notebook realtime update (RTU) protocol.
//
// This crate is pure data: frame envelopes, the delta discriminated union,
// and the notebook/cell/output JSON shapes. Mutation semantics (applying a
// delta to a document) live in `rt-model`; connection and dispatch
// machinery live in the top-level `rtu-client` crate.

pub mod delta;
pub mod frame;
pub mod ids;
pub mod messages;
pub mod notebook;

pub use delta::{CellExecuteKind, Delta, DeltaDecodeError, DeltaPayload};
pub use frame::{Channel, RtuFrame};
pub use ids::{NULL_PRIOR_VALUE, ROOT_DELTA_ID};
pub use notebook::{
    Cell, CodeCell, ErrorOutput, ExecuteResultOutput, Metadata, Notebook, Output, RichOutput,
    StreamOutput, TextCell,
};
