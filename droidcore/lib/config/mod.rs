//! Configuration types and helpers.

mod defaults;
mod droid;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use droid::*;
