use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{join_command, quote_arg, DroidutilsError, DroidutilsResult};

use super::{
    line_stream, BoxedReader, ChildReader, CommandGateway, CommandOutput, DirEntry, FileEntry,
    LineStream,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Options passed to every ssh invocation.
const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=accept-new",
    "-o",
    "ConnectTimeout=10",
    "-o",
    "BatchMode=yes",
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Tunnels commands to a fixed host over non-interactive ssh.
#[derive(Debug, Clone)]
pub struct SshGateway {
    /// The ssh destination, e.g. `user@host`
    host: String,

    /// Private key used for authentication
    key_path: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SshGateway {
    /// Creates a gateway for `host`, authenticating with `key_path` when given.
    pub fn new(host: impl Into<String>, key_path: Option<PathBuf>) -> Self {
        Self {
            host: host.into(),
            key_path,
        }
    }

    /// The ssh destination.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Builds the ssh invocation that runs `remote` on the host.
    fn command(&self, remote: &str) -> DroidutilsResult<Command> {
        let mut command = Command::new("ssh");
        if let Some(key_path) = &self.key_path {
            if !key_path.exists() {
                return Err(DroidutilsError::SshKeyNotFound(key_path.clone()));
            }
            command.arg("-i").arg(key_path);
        }

        command.args(SSH_OPTIONS).arg(&self.host).arg(remote);
        Ok(command)
    }

    async fn exec_remote(&self, remote: &str) -> DroidutilsResult<CommandOutput> {
        tracing::debug!(host = %self.host, command = remote, "running ssh command");
        let output = self
            .command(remote)?
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DroidutilsError::Spawn("ssh".to_string(), e))?;

        let output = CommandOutput::from_process(output);
        if !output.success() {
            tracing::debug!(host = %self.host, command = remote, code = ?output.code, output = %output.output, "ssh command failed");
        }

        Ok(output)
    }

    /// Runs `remote` and returns its raw stdout, failing on a non-zero exit.
    async fn stdout_of(&self, remote: &str) -> DroidutilsResult<Vec<u8>> {
        let output = self
            .command(remote)?
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DroidutilsError::Spawn("ssh".to_string(), e))?;

        if !output.status.success() {
            return Err(DroidutilsError::CommandFailed {
                command: remote.to_string(),
                code: output.status.code(),
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(output.stdout)
    }

    async fn test(&self, flag: &str, path: &Path) -> bool {
        self.exec_remote(&format!("test {flag} {}", quote_path(path)))
            .await
            .map(|output| output.success())
            .unwrap_or(false)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CommandGateway for SshGateway {
    fn is_remote(&self) -> bool {
        true
    }

    async fn exec(&self, program: &str, args: &[String]) -> DroidutilsResult<CommandOutput> {
        self.exec_remote(&join_command(program, args)).await
    }

    async fn exec_script(&self, script: &str) -> DroidutilsResult<CommandOutput> {
        self.exec_remote(script).await
    }

    async fn exists(&self, path: &Path) -> bool {
        self.test("-e", path).await
    }

    async fn is_dir(&self, path: &Path) -> bool {
        self.test("-d", path).await
    }

    async fn read_file(&self, path: &Path) -> DroidutilsResult<Vec<u8>> {
        self.stdout_of(&format!("cat {}", quote_path(path))).await
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> DroidutilsResult<()> {
        let reader: BoxedReader = Box::pin(std::io::Cursor::new(contents.to_vec()));
        self.write_from_reader(path, reader).await?;
        Ok(())
    }

    async fn list_dir(&self, path: &Path) -> DroidutilsResult<Vec<DirEntry>> {
        let script = format!(
            "find -L {} -mindepth 1 -maxdepth 1 -printf '%y\\t%f\\n'",
            quote_path(path)
        );
        let output = self.stdout_of(&script).await?;

        let mut entries: Vec<_> = String::from_utf8_lossy(&output)
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .map(|(kind, name)| DirEntry {
                name: name.to_string(),
                is_dir: kind == "d",
            })
            .collect();

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_dir_all(&self, path: &Path) -> DroidutilsResult<()> {
        self.run_script(&format!("mkdir -p {}", quote_path(path)))
            .await?;
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> DroidutilsResult<()> {
        self.run_script(&format!("rm -rf {}", quote_path(path)))
            .await?;
        Ok(())
    }

    async fn list_files(&self, dir: &Path) -> DroidutilsResult<Vec<FileEntry>> {
        // `*` skips dotfiles and `-f` follows symlinks.
        let script = format!(
            r#"cd {} && for f in *; do [ -f "$f" ] || continue; printf '%s\t%s\t%s\n' "$f" "$(stat -L -c %s "$f")" "$(readlink -f "$f")"; done"#,
            quote_path(dir)
        );
        let output = self.stdout_of(&script).await?;

        let mut files = Vec::new();
        for line in String::from_utf8_lossy(&output).lines() {
            let mut fields = line.splitn(3, '\t');
            let (Some(name), Some(size), Some(path)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            files.push(FileEntry {
                name: name.to_string(),
                path: PathBuf::from(path),
                size: size.trim().parse().unwrap_or(0),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn open_read(&self, path: &Path) -> DroidutilsResult<(u64, BoxedReader)> {
        let quoted = quote_path(path);
        let size = self
            .run_script(&format!("stat -L -c %s {quoted}"))
            .await?
            .trim()
            .parse::<u64>()
            .map_err(DroidutilsError::custom)?;

        let child = self
            .command(&format!("cat {quoted}"))?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DroidutilsError::Spawn("ssh".to_string(), e))?;

        Ok((size, Box::pin(ChildReader::new(child)?)))
    }

    async fn write_from_reader(
        &self,
        path: &Path,
        mut reader: BoxedReader,
    ) -> DroidutilsResult<u64> {
        let remote = format!("cat > {}", quote_path(path));
        let mut child = self
            .command(&remote)?
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DroidutilsError::Spawn("ssh".to_string(), e))?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            DroidutilsError::custom(anyhow::anyhow!("ssh stdin was not piped"))
        })?;
        let written = tokio::io::copy(&mut reader, &mut stdin).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(DroidutilsError::CommandFailed {
                command: remote,
                code: output.status.code(),
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(written)
    }

    async fn spawn_stream(&self, program: &str, args: &[String]) -> DroidutilsResult<LineStream> {
        let child = self
            .command(&join_command(program, args))?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DroidutilsError::Spawn("ssh".to_string(), e))?;

        line_stream(child)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn quote_path(path: &Path) -> String {
    quote_arg(&path.to_string_lossy())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
