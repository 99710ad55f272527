//! Sandbox bookkeeping: which sandbox holds which instance number, and the per-sandbox locks
//! that serialize lifecycle operations.

mod instance;
mod locks;
mod registry;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use instance::*;
pub use locks::*;
pub use registry::*;
