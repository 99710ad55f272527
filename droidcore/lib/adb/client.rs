use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use droidutils::{quote_arg, BoxedReader, CommandGateway, CommandOutput, LineStream};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{DroidcoreError, DroidcoreResult};

use super::{device_parent, FileInfo};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Marker appended to shell commands whose exit code must be recovered from the output.
const EXIT_CODE_MARKER: &str = "EXITCODE:";

/// Directory on the device host used to stage transfers.
const HOST_STAGING_DIR: &str = "/tmp";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for one device endpoint.
#[derive(Clone)]
pub struct AdbClient {
    /// Gateway to the host running `adb`
    gateway: Arc<dyn CommandGateway>,

    /// Path to the `adb` binary on that host
    adb_path: String,

    /// Network serial of the device, e.g. `0.0.0.0:6520`
    serial: String,
}

/// The result of a device shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// What the command printed
    pub output: String,

    /// Its exit code
    pub exit_code: i32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AdbClient {
    /// Creates a client for the device with the given serial.
    pub fn new(
        gateway: Arc<dyn CommandGateway>,
        adb_path: impl Into<String>,
        serial: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            adb_path: adb_path.into(),
            serial: serial.into(),
        }
    }

    /// The device serial.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = vec!["-s".to_string(), self.serial.clone()];
        args.extend(rest.into_iter().map(Into::into));
        args
    }

    async fn exec_adb(&self, args: Vec<String>) -> DroidcoreResult<CommandOutput> {
        Ok(self.gateway.exec(&self.adb_path, &args).await?)
    }

    async fn run_adb(&self, args: Vec<String>) -> DroidcoreResult<String> {
        Ok(self.gateway.run(&self.adb_path, &args).await?)
    }

    /// Runs a shell command on the device. A non-zero exit is reported through `exit_code`.
    pub async fn shell(&self, command: &str) -> DroidcoreResult<ShellOutput> {
        let output = self.exec_adb(self.args(["shell", command])).await?;
        Ok(ShellOutput {
            exit_code: output.code.unwrap_or(1),
            output: output.output,
        })
    }

    /// Runs a shell command and recovers its exit code from the output.
    ///
    /// Older `adb` servers do not propagate the device exit status, so the command is suffixed
    /// with an echo of `$?` that is stripped from the returned output.
    pub async fn shell_with_exit_code(&self, command: &str) -> DroidcoreResult<ShellOutput> {
        let wrapped = format!("{command}; echo \"\\n{EXIT_CODE_MARKER}$?\"");
        let output = self.run_adb(self.args(["shell", wrapped.as_str()])).await?;
        Ok(parse_exit_code(&output))
    }

    /// Pushes a file from the device host to the device.
    pub async fn push(&self, host_path: &Path, device_path: &str) -> DroidcoreResult<()> {
        self.run_adb(self.args([
            "push".to_string(),
            host_path.to_string_lossy().into_owned(),
            device_path.to_string(),
        ]))
        .await?;
        Ok(())
    }

    /// Streams content to a file on the device, staging it on the device host.
    pub async fn push_from_reader(
        &self,
        reader: BoxedReader,
        device_path: &str,
    ) -> DroidcoreResult<()> {
        let staged = staging_path("adb_push", "");
        self.gateway.write_from_reader(&staged, reader).await?;

        let result = self.push(&staged, device_path).await;
        self.discard_staged(&staged).await;
        result
    }

    /// Pulls a file from the device to the device host.
    pub async fn pull(&self, device_path: &str, host_path: &Path) -> DroidcoreResult<()> {
        self.run_adb(self.args([
            "pull".to_string(),
            device_path.to_string(),
            host_path.to_string_lossy().into_owned(),
        ]))
        .await?;
        Ok(())
    }

    /// Streams a device file into `writer`, returning the number of bytes copied.
    pub async fn pull_to_writer<W>(&self, device_path: &str, writer: &mut W) -> DroidcoreResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let staged = staging_path("adb_pull", "");
        let result = async {
            self.pull(device_path, &staged).await?;
            let (_, mut reader) = self.gateway.open_read(&staged).await?;
            let copied = tokio::io::copy(&mut reader, writer).await?;
            writer.flush().await?;
            Ok::<_, DroidcoreError>(copied)
        }
        .await;

        self.discard_staged(&staged).await;
        result
    }

    /// Captures the screen as PNG bytes.
    pub async fn screencap(&self) -> DroidcoreResult<Vec<u8>> {
        let staged = staging_path("screencap", ".png");
        let script = format!(
            "{} -s {} exec-out screencap -p > {}",
            quote_arg(&self.adb_path),
            quote_arg(&self.serial),
            quote_arg(&staged.to_string_lossy())
        );

        let result = async {
            self.gateway.run_script(&script).await?;
            Ok::<_, DroidcoreError>(self.gateway.read_file(&staged).await?)
        }
        .await;

        self.discard_staged(&staged).await;
        result
    }

    /// Injects an input event, e.g. `tap 10 20`.
    pub async fn input(&self, kind: &str, args: &[String]) -> DroidcoreResult<()> {
        let mut command = vec!["shell".to_string(), "input".to_string(), kind.to_string()];
        command.extend(args.iter().cloned());
        self.run_adb(self.args(command)).await?;
        Ok(())
    }

    /// Taps the screen at `(x, y)`.
    pub async fn tap(&self, x: i32, y: i32) -> DroidcoreResult<()> {
        self.input("tap", &[x.to_string(), y.to_string()]).await
    }

    /// Swipes from `(x1, y1)` to `(x2, y2)` over `duration_ms`.
    pub async fn swipe(
        &self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u32,
    ) -> DroidcoreResult<()> {
        let args = [x1, y1, x2, y2]
            .iter()
            .map(ToString::to_string)
            .chain([duration_ms.to_string()])
            .collect::<Vec<_>>();
        self.input("swipe", &args).await
    }

    /// Types text into the focused field. Spaces are encoded as `%s` for `input text`.
    pub async fn type_text(&self, text: &str) -> DroidcoreResult<()> {
        let encoded = quote_arg(&text.replace(' ', "%s"));
        self.input("text", &[encoded]).await
    }

    /// Sends a key event, e.g. `KEYCODE_HOME` or `3`.
    pub async fn key_event(&self, keycode: &str) -> DroidcoreResult<()> {
        self.input("keyevent", &[keycode.to_string()]).await
    }

    /// Installs an APK located on the device host.
    pub async fn install(&self, apk_path: &Path, flags: &[String]) -> DroidcoreResult<()> {
        let mut args = vec!["install".to_string()];
        args.extend(flags.iter().cloned());
        args.push(apk_path.to_string_lossy().into_owned());

        let output = self.run_adb(self.args(args)).await?;
        if output.contains("Failure") {
            return Err(DroidcoreError::UnexpectedOutput(format!(
                "install failed: {}",
                output.trim()
            )));
        }

        Ok(())
    }

    /// Installs an APK streamed from `reader`, staging it on the device host.
    pub async fn install_from_reader(
        &self,
        reader: BoxedReader,
        flags: &[String],
    ) -> DroidcoreResult<()> {
        let staged = staging_path("install", ".apk");
        self.gateway.write_from_reader(&staged, reader).await?;

        let result = self.install(&staged, flags).await;
        self.discard_staged(&staged).await;
        result
    }

    /// Uninstalls a package.
    pub async fn uninstall(&self, package: &str) -> DroidcoreResult<()> {
        self.run_adb(self.args(["uninstall", package])).await?;
        Ok(())
    }

    /// Lists installed packages, optionally filtered with `pm list packages` flags.
    pub async fn list_packages(&self, flags: &[String]) -> DroidcoreResult<Vec<String>> {
        let mut args = vec![
            "shell".to_string(),
            "pm".to_string(),
            "list".to_string(),
            "packages".to_string(),
        ];
        args.extend(flags.iter().cloned());

        let output = self.run_adb(self.args(args)).await?;
        Ok(parse_packages(&output))
    }

    /// Reads a system property.
    pub async fn get_prop(&self, prop: &str) -> DroidcoreResult<String> {
        let output = self.shell(&format!("getprop {}", quote_arg(prop))).await?;
        Ok(output.output.trim().to_string())
    }

    /// Sets a system property.
    pub async fn set_prop(&self, prop: &str, value: &str) -> DroidcoreResult<()> {
        let command = format!("setprop {} {}", quote_arg(prop), quote_arg(value));
        self.expect_success(&command, "setprop").await
    }

    /// Lists a device directory.
    pub async fn list_files(&self, path: &str) -> DroidcoreResult<Vec<FileInfo>> {
        let quoted = quote_arg(path);
        let output = self
            .shell(&format!("ls -la {quoted} 2>/dev/null || ls -l {quoted}"))
            .await?;
        if output.exit_code != 0 {
            return Err(DroidcoreError::UnexpectedOutput(format!(
                "ls failed with exit code {}: {}",
                output.exit_code,
                output.output.trim()
            )));
        }

        Ok(output
            .output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("total"))
            .filter_map(|line| FileInfo::parse_ls_line(line, path))
            .collect())
    }

    /// Stats a device path, falling back to `ls -ld` on devices without `stat -c`.
    pub async fn stat(&self, path: &str) -> DroidcoreResult<FileInfo> {
        let quoted = quote_arg(path);
        let output = self
            .shell(&format!("stat -c '%n|%s|%F|%U|%G|%y' {quoted} 2>/dev/null"))
            .await?;
        if output.exit_code == 0 {
            return FileInfo::parse_stat(&output.output).ok_or_else(|| {
                DroidcoreError::UnexpectedOutput(format!("stat output: {}", output.output.trim()))
            });
        }

        let output = self.shell(&format!("ls -ld {quoted}")).await?;
        if output.exit_code != 0 {
            return Err(DroidcoreError::InvalidArgument(format!(
                "file not found: {path}"
            )));
        }

        FileInfo::parse_ls_line(output.output.trim(), &device_parent(path)).ok_or_else(|| {
            DroidcoreError::UnexpectedOutput(format!("ls output: {}", output.output.trim()))
        })
    }

    /// Creates a device directory.
    pub async fn mkdir(&self, path: &str, parents: bool) -> DroidcoreResult<()> {
        let flag = if parents { "-p " } else { "" };
        self.expect_success(&format!("mkdir {flag}{}", quote_arg(path)), "mkdir")
            .await
    }

    /// Removes a device path.
    pub async fn remove(&self, path: &str, recursive: bool) -> DroidcoreResult<()> {
        let flag = if recursive { "-rf" } else { "-f" };
        self.expect_success(&format!("rm {flag} {}", quote_arg(path)), "rm")
            .await
    }

    /// Moves a device path.
    pub async fn move_path(&self, src: &str, dst: &str) -> DroidcoreResult<()> {
        let command = format!("mv {} {}", quote_arg(src), quote_arg(dst));
        self.expect_success(&command, "mv").await
    }

    /// Copies a device path recursively.
    pub async fn copy_path(&self, src: &str, dst: &str) -> DroidcoreResult<()> {
        let command = format!("cp -r {} {}", quote_arg(src), quote_arg(dst));
        self.expect_success(&command, "cp").await
    }

    /// Streams `logcat` output. The process stops when the stream is dropped.
    pub async fn logcat(&self, args: &[String]) -> DroidcoreResult<LineStream> {
        let mut command = vec!["logcat".to_string()];
        command.extend(args.iter().cloned());
        Ok(self
            .gateway
            .spawn_stream(&self.adb_path, &self.args(command))
            .await?)
    }

    /// Starts an activity, e.g. `com.android.settings/.Settings`.
    pub async fn start_activity(&self, component: &str, extras: &[String]) -> DroidcoreResult<()> {
        let mut command = format!("am start -n {}", quote_arg(component));
        for extra in extras {
            command.push(' ');
            command.push_str(extra);
        }

        self.expect_success(&command, "am start").await
    }

    /// Force-stops an application.
    pub async fn force_stop(&self, package: &str) -> DroidcoreResult<()> {
        self.expect_success(
            &format!("am force-stop {}", quote_arg(package)),
            "force-stop",
        )
        .await
    }

    /// Returns the device state as reported by `adb get-state` (`device`, `offline`, ...).
    pub async fn get_state(&self) -> DroidcoreResult<String> {
        let output = self.run_adb(self.args(["get-state"])).await?;
        Ok(output.trim().to_string())
    }

    /// Blocks until the device is visible to the adb server.
    pub async fn wait_for_device(&self) -> DroidcoreResult<()> {
        self.run_adb(self.args(["wait-for-device"])).await?;
        Ok(())
    }

    /// Reboots the device through adb.
    pub async fn reboot(&self) -> DroidcoreResult<()> {
        self.run_adb(self.args(["reboot"])).await?;
        Ok(())
    }

    /// Returns true if the device answers a trivial shell command.
    pub async fn is_responsive(&self) -> bool {
        match self.exec_adb(self.args(["shell", "echo ready"])).await {
            Ok(output) => output.success() && output.output.contains("ready"),
            Err(_) => false,
        }
    }

    async fn expect_success(&self, command: &str, what: &str) -> DroidcoreResult<()> {
        let output = self.shell(command).await?;
        if output.exit_code != 0 {
            return Err(DroidcoreError::UnexpectedOutput(format!(
                "{what} failed with exit code {}: {}",
                output.exit_code,
                output.output.trim()
            )));
        }

        Ok(())
    }

    async fn discard_staged(&self, path: &Path) {
        if let Err(e) = self.gateway.remove_all(path).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove staged file");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn staging_path(prefix: &str, suffix: &str) -> PathBuf {
    PathBuf::from(HOST_STAGING_DIR).join(format!("{prefix}_{}{suffix}", uuid::Uuid::new_v4()))
}

/// Splits the trailing exit-code marker line from shell output.
pub(crate) fn parse_exit_code(output: &str) -> ShellOutput {
    let trimmed = output.trim_end();
    if let Some((body, last)) = trimmed.rsplit_once('\n') {
        if let Some(code) = last.trim().strip_prefix(EXIT_CODE_MARKER) {
            return ShellOutput {
                output: body.trim_end().to_string(),
                exit_code: code.trim().parse().unwrap_or(0),
            };
        }
    } else if let Some(code) = trimmed.trim().strip_prefix(EXIT_CODE_MARKER) {
        return ShellOutput {
            output: String::new(),
            exit_code: code.trim().parse().unwrap_or(0),
        };
    }

    ShellOutput {
        output: output.to_string(),
        exit_code: 0,
    }
}

fn parse_packages(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(ToString::to_string)
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::testing::ScriptedGateway;

    use super::*;

    #[test]
    fn test_parse_exit_code() {
        let parsed = parse_exit_code("hello\nworld\n\nEXITCODE:3\n");
        assert_eq!(parsed.exit_code, 3);
        assert_eq!(parsed.output, "hello\nworld");

        let parsed = parse_exit_code("\nEXITCODE:0");
        assert_eq!(parsed.exit_code, 0);
        assert_eq!(parsed.output, "");

        let parsed = parse_exit_code("no marker");
        assert_eq!(parsed.exit_code, 0);
        assert_eq!(parsed.output, "no marker");
    }

    #[test]
    fn test_parse_packages() {
        let packages = parse_packages("package:com.android.settings\npackage:com.example.app\n\n");
        assert_eq!(packages, vec!["com.android.settings", "com.example.app"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_commands_target_serial() -> anyhow::Result<()> {
        let gateway = ScriptedGateway::new(|command| {
            if command.contains("echo ready") {
                (0, "ready\n".to_string())
            } else if command.contains("get-state") {
                (0, "device\n".to_string())
            } else {
                (0, String::new())
            }
        });
        let adb = AdbClient::new(gateway.clone(), "adb", "0.0.0.0:6521");

        assert!(adb.is_responsive().await);
        assert_eq!(adb.get_state().await?, "device");
        adb.type_text("hello world").await?;
        adb.tap(10, 20).await?;

        let history = gateway.history();
        assert!(history.iter().all(|c| c.starts_with("adb -s 0.0.0.0:6521 ")));
        assert!(history
            .iter()
            .any(|c| c == "adb -s 0.0.0.0:6521 shell input text hello%sworld"));
        assert!(history
            .iter()
            .any(|c| c == "adb -s 0.0.0.0:6521 shell input tap 10 20"));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unresponsive_device() {
        let gateway = ScriptedGateway::new(|_| (1, "error: device offline".to_string()));
        let adb = AdbClient::new(gateway, "adb", "0.0.0.0:6520");

        assert!(!adb.is_responsive().await);
        assert!(adb.get_state().await.is_err());
    }
}
