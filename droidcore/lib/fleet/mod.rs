//! Reconciliation of the registry against the toolchain's fleet.

mod sync;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use sync::*;
