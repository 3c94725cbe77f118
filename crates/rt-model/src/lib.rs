//! The notebook document model: the mutable `Notebook` held by a single
//! writer, and the algorithms used to bring it up to date — `apply_delta`,
//! the nested-path metadata update, and diff-match-patch patch application.
//!
//! Wire shapes (`Notebook`, `Cell`, `Delta`, ...) live in `rt-protocol`;
//! this crate only owns what happens to them once the client has decided to
//! apply a given delta.

pub mod builder;
pub mod patch;
pub mod path;

pub use builder::{BuilderError, NotebookBuilder};
pub use patch::{apply_patch, PatchError};
pub use path::apply_nested_path_update;
