//! Device control over the Android Debug Bridge.
//!
//! [`AdbClient`] drives one device endpoint, identified by its network serial, through the
//! command gateway so the same calls work whether `adb` runs locally or on the remote host.

mod client;
mod file_info;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
pub use file_info::*;
