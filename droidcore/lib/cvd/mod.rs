//! The Cuttlefish `cvd` toolchain.
//!
//! [`CvdCommands`] renders the shell command lines, [`Fleet`] interprets `cvd fleet` output and
//! [`Toolchain`] runs both through the command gateway.

mod commands;
mod fleet;
mod toolchain;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use commands::*;
pub use fleet::*;
pub use toolchain::*;
