use std::path::PathBuf;

use clap::Parser;

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// droidd - orchestrates a fleet of Cuttlefish Android sandboxes
#[derive(Debug, Parser)]
#[command(name = "droidd", author, about, version, styles=styles::styles())]
pub struct DroiddArgs {
    /// The subcommand to run. Defaults to `serve`
    #[command(subcommand)]
    pub subcommand: Option<DroiddSubcommand>,

    /// Also append logs to this file
    #[arg(long, env = "LOG_FILE_PATH")]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands of the daemon
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
pub enum DroiddSubcommand {
    /// Recover state, reconcile with the toolchain and run the health monitor until interrupted
    #[command(name = "serve")]
    Serve,

    /// Print the registered sandboxes with their probed state as JSON
    #[command(name = "list")]
    List,

    /// Remove toolchain instances the registry does not know
    #[command(name = "sync")]
    Sync,

    /// Print the available snapshots as JSON
    #[command(name = "snapshots")]
    Snapshots {
        /// Only list the custom snapshots of this organization
        #[arg(long)]
        org: Option<String>,
    },

    /// Print host resource usage as JSON
    #[command(name = "metrics")]
    Metrics,

    /// Upload a custom snapshot to the object store
    #[command(name = "upload")]
    Upload {
        /// The organization owning the snapshot
        #[arg(long)]
        org: String,

        /// The snapshot name
        #[arg(long)]
        name: String,
    },

    /// Download a custom snapshot from the object store onto the device host
    #[command(name = "download")]
    Download {
        /// The organization owning the snapshot
        #[arg(long)]
        org: String,

        /// The snapshot name
        #[arg(long)]
        name: String,
    },

    /// Print whether the object store holds a custom snapshot
    #[command(name = "exists")]
    Exists {
        /// The organization owning the snapshot
        #[arg(long)]
        org: String,

        /// The snapshot name
        #[arg(long)]
        name: String,
    },
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let args = DroiddArgs::parse_from(["droidd"]);
        assert!(args.subcommand.is_none());

        let args = DroiddArgs::parse_from(["droidd", "snapshots", "--org", "org-1"]);
        assert_eq!(
            args.subcommand,
            Some(DroiddSubcommand::Snapshots {
                org: Some("org-1".to_string())
            })
        );

        let args = DroiddArgs::parse_from(["droidd", "--log-file", "/tmp/droidd.log", "sync"]);
        assert_eq!(args.subcommand, Some(DroiddSubcommand::Sync));
        assert_eq!(args.log_file, Some(PathBuf::from("/tmp/droidd.log")));

        let args = DroiddArgs::parse_from(["droidd", "download", "--org", "org-1", "--name", "snap"]);
        assert_eq!(
            args.subcommand,
            Some(DroiddSubcommand::Download {
                org: "org-1".to_string(),
                name: "snap".to_string()
            })
        );
        assert!(DroiddArgs::try_parse_from(["droidd", "upload", "--org", "org-1"]).is_err());
    }
}
