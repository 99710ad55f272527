//! Crash detection for running sandboxes.
//!
//! The toolchain under-reports crashes and, after its own restart, over-reports them, so a
//! sandbox is only declared stopped when the toolchain listing, the device endpoint and the VM
//! process all agree.

mod decision;
mod history;
mod monitor;
mod probe;
mod reporter;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use decision::*;
pub use history::*;
pub use monitor::*;
pub use probe::*;
pub use reporter::*;
