//! Sandbox lifecycle orchestration.

mod control;
mod create;
mod destroy;
mod orchestrator;
mod recover;
mod status;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use create::*;
pub use orchestrator::*;
