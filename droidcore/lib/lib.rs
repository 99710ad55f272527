//! `droidcore` orchestrates a fleet of virtual Android devices ("sandboxes") driven by the
//! Cuttlefish `cvd` toolchain, on the local host or on a remote one reached over ssh.
//!
//! # Overview
//!
//! droidcore handles:
//! - Instance number allocation and the persisted sandbox mapping
//! - Sandbox lifecycle with rollback of failed creates
//! - Reconciliation of the registry with the toolchain's own fleet
//! - Layered crash detection and reporting
//! - Device-state snapshots and their transfer to an object store
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use droidcore::{
//!     config::DroidConfig,
//!     orchestration::{CreateOptions, Orchestrator},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::new(DroidConfig::from_env()?).await?;
//!     orchestrator.recover_orphaned_sandboxes().await?;
//!     orchestrator.sync_cvd_state().await?;
//!
//!     let cancel = CancellationToken::new();
//!     let options = CreateOptions::builder().sandbox_id("sb-1").cpus(4).build();
//!     let info = orchestrator.create(options, &cancel).await?;
//!     println!("adb connect {}", info.adb_serial);
//!
//!     orchestrator.destroy("sb-1").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`adb`] - Device control over ADB
//! - [`cli`] - Command-line arguments of the `droidd` daemon
//! - [`config`] - Configuration and its environment loader
//! - [`cvd`] - `cvd` command lines and fleet parsing
//! - [`fleet`] - Registry and toolchain reconciliation
//! - [`health`] - Crash detection loop
//! - [`metrics`] - Host resource metrics
//! - [`orchestration`] - Sandbox lifecycle
//! - [`registry`] - Sandbox bookkeeping
//! - [`snapshot`] - Snapshot addressing and storage
//! - [`transfer`] - Snapshot upload and download

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod error;
mod log;

#[cfg(test)]
pub(crate) mod testing;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod adb;
pub mod cli;
pub mod config;
pub mod cvd;
pub mod fleet;
pub mod health;
pub mod metrics;
pub mod orchestration;
pub mod registry;
pub mod snapshot;
pub mod transfer;

pub use error::*;
pub use log::*;
