//! `droidutils` is a library containing general utilities for the droidcore project.
//!
//! The main export is the [`CommandGateway`]: every OS-level interaction the orchestrator
//! performs goes through it so the same code drives a local host or a remote one over ssh.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod error;
pub mod gateway;
pub mod quote;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use gateway::*;
pub use quote::*;
