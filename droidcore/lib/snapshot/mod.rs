//! Device-state snapshots.
//!
//! A snapshot is addressed as `<name>` for an immutable base system image under the toolchain
//! home, or `<org-uuid>/<name>` for a custom capture under the artifacts root.

mod manager;
mod manifest;
mod reference;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use manager::*;
pub use manifest::*;
pub use reference::*;
