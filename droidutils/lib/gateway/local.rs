use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    process::Command,
};

use crate::{join_command, DroidutilsError, DroidutilsResult};

use super::{
    line_stream, BoxedReader, CommandGateway, CommandOutput, DirEntry, FileEntry, LineStream,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Executes everything on the current host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalGateway;

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CommandGateway for LocalGateway {
    fn is_remote(&self) -> bool {
        false
    }

    async fn exec(&self, program: &str, args: &[String]) -> DroidutilsResult<CommandOutput> {
        tracing::debug!(program, ?args, "running local command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DroidutilsError::Spawn(join_command(program, args), e))?;

        Ok(CommandOutput::from_process(output))
    }

    async fn exec_script(&self, script: &str) -> DroidutilsResult<CommandOutput> {
        tracing::debug!(script, "running local shell script");
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DroidutilsError::Spawn("/bin/sh".to_string(), e))?;

        let output = CommandOutput::from_process(output);
        if !output.success() {
            tracing::debug!(script, code = ?output.code, output = %output.output, "local shell script failed");
        }

        Ok(output)
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::metadata(path).await.is_ok()
    }

    async fn is_dir(&self, path: &Path) -> bool {
        fs::metadata(path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    async fn read_file(&self, path: &Path) -> DroidutilsResult<Vec<u8>> {
        Ok(fs::read(path).await?)
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> DroidutilsResult<()> {
        Ok(fs::write(path, contents).await?)
    }

    async fn list_dir(&self, path: &Path) -> DroidutilsResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(path).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let is_dir = fs::metadata(entry.path())
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false);

            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_dir_all(&self, path: &Path) -> DroidutilsResult<()> {
        Ok(fs::create_dir_all(path).await?)
    }

    async fn remove_all(&self, path: &Path) -> DroidutilsResult<()> {
        let Ok(meta) = fs::symlink_metadata(path).await else {
            return Ok(());
        };

        if meta.is_dir() {
            fs::remove_dir_all(path).await?;
        } else {
            fs::remove_file(path).await?;
        }

        Ok(())
    }

    async fn list_files(&self, dir: &Path) -> DroidutilsResult<Vec<FileEntry>> {
        let mut files = Vec::new();
        let mut read_dir = fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }

            // Follows symlinks; dangling links are skipped.
            let Ok(meta) = fs::metadata(entry.path()).await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }

            files.push(FileEntry {
                name,
                path: fs::canonicalize(entry.path()).await?,
                size: meta.len(),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn open_read(&self, path: &Path) -> DroidutilsResult<(u64, BoxedReader)> {
        let size = fs::metadata(path).await?.len();
        let file = File::open(path).await?;
        Ok((size, Box::pin(file)))
    }

    async fn write_from_reader(
        &self,
        path: &Path,
        mut reader: BoxedReader,
    ) -> DroidutilsResult<u64> {
        let mut file = File::create(path).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(written)
    }

    async fn spawn_stream(&self, program: &str, args: &[String]) -> DroidutilsResult<LineStream> {
        tracing::debug!(program, ?args, "spawning local streaming command");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DroidutilsError::Spawn(join_command(program, args), e))?;

        line_stream(child)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::io::AsyncReadExt;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_local_exec_captures_output_and_code() -> anyhow::Result<()> {
        let gateway = LocalGateway;

        let output = gateway.exec_script("echo out; echo err >&2; exit 3").await?;
        assert_eq!(output.code, Some(3));
        assert!(output.output.contains("out"));
        assert!(output.output.contains("err"));

        let err = gateway.run_script("echo boom; exit 1").await.unwrap_err();
        assert_eq!(err.output().map(str::trim), Some("boom"));

        let ok = gateway.run("echo", &["ready".to_string()]).await?;
        assert_eq!(ok.trim(), "ready");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_local_file_operations() -> anyhow::Result<()> {
        let gateway = LocalGateway;
        let dir = tempfile::tempdir()?;
        let nested = dir.path().join("a/b");

        gateway.create_dir_all(&nested).await?;
        assert!(gateway.is_dir(&nested).await);

        let file = nested.join("instance.json");
        gateway.write_file(&file, b"{}").await?;
        assert!(gateway.exists(&file).await);
        assert!(!gateway.is_dir(&file).await);
        assert_eq!(gateway.read_file(&file).await?, b"{}");

        let entries = gateway.list_dir(&dir.path().join("a")).await?;
        assert_eq!(
            entries,
            vec![DirEntry {
                name: "b".to_string(),
                is_dir: true
            }]
        );

        gateway.remove_all(&dir.path().join("a")).await?;
        assert!(!gateway.exists(&nested).await);

        // Removing a missing path is not an error.
        gateway.remove_all(&dir.path().join("missing")).await?;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_local_list_files_resolves_symlinks() -> anyhow::Result<()> {
        let gateway = LocalGateway;
        let dir = tempfile::tempdir()?;
        let target_dir = tempfile::tempdir()?;

        fs::write(dir.path().join("super.img"), b"1234").await?;
        fs::write(dir.path().join(".hidden"), b"x").await?;
        fs::create_dir(dir.path().join("sub")).await?;
        fs::write(target_dir.path().join("real.bin"), b"123456").await?;
        fs::symlink(
            target_dir.path().join("real.bin"),
            dir.path().join("linked.bin"),
        )
        .await?;

        let files = gateway.list_files(dir.path()).await?;
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["linked.bin", "super.img"]);

        let linked = &files[0];
        assert_eq!(linked.size, 6);
        assert_eq!(
            linked.path,
            fs::canonicalize(target_dir.path().join("real.bin")).await?
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_local_streaming_io() -> anyhow::Result<()> {
        let gateway = LocalGateway;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blob");

        let reader: BoxedReader = Box::pin(std::io::Cursor::new(b"hello world".to_vec()));
        let written = gateway.write_from_reader(&path, reader).await?;
        assert_eq!(written, 11);

        let (size, mut reader) = gateway.open_read(&path).await?;
        assert_eq!(size, 11);
        let mut contents = String::new();
        reader.read_to_string(&mut contents).await?;
        assert_eq!(contents, "hello world");

        let mut lines = gateway
            .spawn_stream("printf", &["one\\ntwo\\n".to_string()])
            .await?;
        assert_eq!(lines.next().await.transpose()?, Some("one".to_string()));
        assert_eq!(lines.next().await.transpose()?, Some("two".to_string()));
        assert!(lines.next().await.is_none());

        Ok(())
    }
}
