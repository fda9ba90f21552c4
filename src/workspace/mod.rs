//! Per-session package roots on disk.
//!
//! Layout of one workspace:
//!
//! ```text
//! <root>/<id>/
//!   manifest.toml
//!   manifest.lock
//!   lib/<source file>
//!   out/
//! ```

pub mod manifest;
pub mod store;

pub use manifest::Manifest;
pub use store::{validate_id, Workspace, WorkspaceStore};
