//! Command execution gateway.
//!
//! A [`CommandGateway`] runs commands and small file operations on the host that owns the
//! virtual devices. [`LocalGateway`] executes directly, [`SshGateway`] tunnels everything over a
//! non-interactive ssh session. Callers never need to know which one they hold.

mod local;
mod ssh;
mod stream;

use std::{
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
};

use async_trait::async_trait;
use futures::Stream;
use tokio::io::AsyncRead;

use crate::{join_command, DroidutilsError, DroidutilsResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use local::*;
pub use ssh::*;
pub use stream::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An owned, pinned async reader.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// A stream of output lines from a long-running command.
pub type LineStream = Pin<Box<dyn Stream<Item = DroidutilsResult<String>> + Send>>;

/// The outcome of a command that was spawned successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Combined stdout and stderr.
    pub output: String,

    /// The exit code. `None` if the process was killed by a signal.
    pub code: Option<i32>,
}

/// A directory entry as seen by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The entry's file name
    pub name: String,

    /// Whether the entry is a directory (symlinks followed)
    pub is_dir: bool,
}

/// A regular file found by [`CommandGateway::list_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File name inside the listed directory
    pub name: String,

    /// Real path with symlinks resolved
    pub path: PathBuf,

    /// Size in bytes of the resolved target
    pub size: u64,
}

/// Executes commands and file operations on the device host.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    /// Whether commands are tunnelled to a remote host.
    fn is_remote(&self) -> bool;

    /// Runs a program with arguments, returning its combined output whatever the exit code.
    async fn exec(&self, program: &str, args: &[String]) -> DroidutilsResult<CommandOutput>;

    /// Runs a shell script with `/bin/sh`, returning its combined output whatever the exit code.
    async fn exec_script(&self, script: &str) -> DroidutilsResult<CommandOutput>;

    /// Returns true if the path exists.
    async fn exists(&self, path: &Path) -> bool;

    /// Returns true if the path exists and is a directory.
    async fn is_dir(&self, path: &Path) -> bool;

    /// Reads a whole file.
    async fn read_file(&self, path: &Path) -> DroidutilsResult<Vec<u8>>;

    /// Writes a whole file, replacing any previous content.
    async fn write_file(&self, path: &Path, contents: &[u8]) -> DroidutilsResult<()>;

    /// Lists the entries of a directory, hidden entries included.
    async fn list_dir(&self, path: &Path) -> DroidutilsResult<Vec<DirEntry>>;

    /// Creates a directory and all of its parents.
    async fn create_dir_all(&self, path: &Path) -> DroidutilsResult<()>;

    /// Removes a file or a directory tree. Missing paths are not an error.
    async fn remove_all(&self, path: &Path) -> DroidutilsResult<()>;

    /// Lists the regular files directly under `dir`, skipping dotfiles and resolving symlinks.
    async fn list_files(&self, dir: &Path) -> DroidutilsResult<Vec<FileEntry>>;

    /// Opens a file for streaming, returning its size and a reader over its content.
    async fn open_read(&self, path: &Path) -> DroidutilsResult<(u64, BoxedReader)>;

    /// Streams `reader` into a file, returning the number of bytes written.
    async fn write_from_reader(&self, path: &Path, reader: BoxedReader) -> DroidutilsResult<u64>;

    /// Spawns a long-running command and streams its stdout line by line.
    ///
    /// The process is killed when the stream is dropped.
    async fn spawn_stream(&self, program: &str, args: &[String]) -> DroidutilsResult<LineStream>;

    /// Runs a program and fails if it exits unsuccessfully.
    async fn run(&self, program: &str, args: &[String]) -> DroidutilsResult<String> {
        self.exec(program, args)
            .await?
            .into_result(join_command(program, args))
    }

    /// Runs a shell script and fails if it exits unsuccessfully.
    async fn run_script(&self, script: &str) -> DroidutilsResult<String> {
        self.exec_script(script).await?.into_result(script)
    }
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CommandOutput {
    /// Builds a `CommandOutput` from a finished process, appending stderr to stdout.
    pub fn from_process(output: std::process::Output) -> Self {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Self {
            output: combined,
            code: output.status.code(),
        }
    }

    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts a non-zero exit into [`DroidutilsError::CommandFailed`].
    pub fn into_result(self, command: impl Into<String>) -> DroidutilsResult<String> {
        if self.success() {
            return Ok(self.output);
        }

        Err(DroidutilsError::CommandFailed {
            command: command.into(),
            code: self.code,
            output: self.output,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the gateway for the given placement: ssh when a host is configured, local otherwise.
pub fn connect(ssh_host: Option<&str>, ssh_key_path: Option<&Path>) -> Arc<dyn CommandGateway> {
    match ssh_host {
        Some(host) if !host.is_empty() => {
            tracing::info!(host, "using remote command gateway");
            Arc::new(SshGateway::new(host, ssh_key_path.map(Path::to_path_buf)))
        }
        _ => Arc::new(LocalGateway),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_result_keeps_output_on_failure() {
        let output = CommandOutput {
            output: "device offline".to_string(),
            code: Some(1),
        };

        let err = output.into_result("adb get-state").unwrap_err();
        assert_eq!(err.output(), Some("device offline"));
        assert!(err.to_string().contains("adb get-state"));
    }

    #[test]
    fn test_connect_selects_placement() {
        assert!(!connect(None, None).is_remote());
        assert!(!connect(Some(""), None).is_remote());
        assert!(connect(Some("vsoc@10.0.0.5"), None).is_remote());
    }
}
