//! Transfer of custom snapshots to and from an S3-compatible object store.
//!
//! Objects live under `snapshots/<org-uuid>/<name>/<file>`, with the snapshot's `manifest.json`
//! doubling as the existence marker.

mod artifacts;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use artifacts::*;
pub use store::*;
