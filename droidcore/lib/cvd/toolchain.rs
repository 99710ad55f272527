use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use droidutils::CommandGateway;

use crate::{config::DroidConfig, DroidcoreResult};

use super::{
    clean_stale_sockets, kill_instance_processes, vm_process_probe, CvdCommands, Fleet, LaunchSpec,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives the `cvd` toolchain on the device host.
#[derive(Clone)]
pub struct Toolchain {
    /// Gateway to the device host
    gateway: Arc<dyn CommandGateway>,

    /// Command line renderer
    commands: CvdCommands,

    /// System-installed host tools
    host_tools_path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Toolchain {
    /// Creates a toolchain driver from the orchestrator configuration.
    pub fn new(gateway: Arc<dyn CommandGateway>, config: &DroidConfig) -> Self {
        Self {
            gateway,
            commands: CvdCommands::new(config.get_cvd_path(), config.get_cvd_home()),
            host_tools_path: config.get_host_tools_path().clone(),
        }
    }

    /// The gateway commands run through.
    pub fn gateway(&self) -> &Arc<dyn CommandGateway> {
        &self.gateway
    }

    /// The command line renderer.
    pub fn commands(&self) -> &CvdCommands {
        &self.commands
    }

    /// Picks the host tools for an image directory.
    ///
    /// Snapshots that bundle `bin/assemble_cvd` carry a matching toolchain and must use it.
    pub async fn host_path_for(&self, image_dir: Option<&Path>) -> PathBuf {
        if let Some(dir) = image_dir {
            if self.gateway.exists(&dir.join("bin").join("assemble_cvd")).await {
                tracing::debug!(dir = %dir.display(), "using host tools bundled with the image");
                return dir.to_path_buf();
            }
        }

        self.host_tools_path.clone()
    }

    /// Boots an instance with `cvd create`.
    pub async fn launch(&self, spec: &LaunchSpec) -> DroidcoreResult<String> {
        let script = self.commands.create(spec);
        tracing::info!(instance_num = spec.instance_num, image = ?spec.image, "launching instance");
        Ok(self.gateway.run_script(&script).await?)
    }

    /// Starts a stopped group.
    pub async fn start_group(&self, instance_num: u32) -> DroidcoreResult<()> {
        self.gateway
            .run_script(&self.commands.start_group(instance_num))
            .await?;
        Ok(())
    }

    /// Stops a group.
    pub async fn stop_group(&self, instance_num: u32) -> DroidcoreResult<()> {
        self.gateway
            .run_script(&self.commands.stop_group(instance_num))
            .await?;
        Ok(())
    }

    /// Captures a running instance's state into `snapshot_path`.
    pub async fn snapshot_take(&self, instance_num: u32, snapshot_path: &Path) -> DroidcoreResult<()> {
        let output = self
            .gateway
            .run_script(&self.commands.snapshot_take(instance_num, snapshot_path))
            .await?;
        tracing::debug!(instance_num, output = output.trim(), "snapshot_take finished");
        Ok(())
    }

    /// Reads the toolchain's fleet listing.
    ///
    /// A non-zero exit is tolerated since the listing often still parses.
    pub async fn fleet(&self) -> DroidcoreResult<Fleet> {
        let result = self.gateway.exec_script(&self.commands.fleet()).await?;
        if !result.success() {
            tracing::debug!(code = ?result.code, "cvd fleet exited unsuccessfully, parsing anyway");
        }

        Ok(Fleet::parse(&result.output))
    }

    /// Wipes every trace of an instance number. Never fails.
    pub async fn force_cleanup(&self, instance_num: u32) {
        for step in self.commands.force_cleanup(instance_num) {
            self.run_best_effort(instance_num, &step).await;
        }
    }

    /// Stops and removes an instance the registry does not know. Never fails.
    pub async fn force_remove(&self, instance_num: u32) {
        for step in self.commands.force_remove(instance_num) {
            self.run_best_effort(instance_num, &step).await;
        }
    }

    /// Removes leftover sockets of an instance number. Never fails.
    pub async fn clean_stale_sockets(&self, instance_num: u32) {
        self.run_best_effort(instance_num, &clean_stale_sockets(instance_num))
            .await;
    }

    /// Kills every process matching the instance number. Never fails.
    pub async fn kill_processes(&self, instance_num: u32) {
        self.run_best_effort(instance_num, &kill_instance_processes(instance_num))
            .await;
    }

    /// Whether a VM process for the instance number exists.
    pub async fn vm_process_alive(&self, instance_num: u32) -> DroidcoreResult<bool> {
        let output = self
            .gateway
            .run_script(&vm_process_probe(instance_num))
            .await?;
        Ok(output.trim() == "running")
    }

    async fn run_best_effort(&self, instance_num: u32, script: &str) {
        match self.gateway.exec_script(script).await {
            Ok(result) if !result.success() => {
                tracing::debug!(instance_num, script, output = result.output.trim(), "cleanup step failed");
            }
            Err(e) => {
                tracing::debug!(instance_num, script, error = %e, "cleanup step failed");
            }
            Ok(_) => {}
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
