use tokio_util::sync::CancellationToken;

use crate::{registry::InstanceState, DroidcoreError, DroidcoreResult};

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Starts a stopped sandbox.
    ///
    /// If the toolchain cannot restart the group, leftover sockets are cleared and the instance
    /// is relaunched from the snapshot it was created from.
    pub async fn start(&self, sandbox_id: &str, cancel: &CancellationToken) -> DroidcoreResult<()> {
        let _guard = self.locks.lock(sandbox_id).await;
        let instance = self.instance(sandbox_id).await?;
        let number = *instance.get_instance_num();

        match instance.get_state() {
            InstanceState::Running => {
                tracing::debug!(sandbox_id, "sandbox already running");
                return Ok(());
            }
            InstanceState::Unknown if self.toolchain.vm_process_alive(number).await.unwrap_or(false) => {
                tracing::info!(sandbox_id, instance_num = number, "sandbox found running");
                self.registry
                    .set_state(sandbox_id, InstanceState::Running)
                    .await;
                self.history.clear(sandbox_id);
                return Ok(());
            }
            _ => {}
        }

        tracing::info!(sandbox_id, instance_num = number, "starting sandbox");
        self.registry
            .set_state(sandbox_id, InstanceState::Starting)
            .await;

        if let Err(e) = self.toolchain.start_group(number).await {
            tracing::warn!(sandbox_id, error = %e, "cvd start failed, relaunching instance");
            self.toolchain.clean_stale_sockets(number).await;

            let snapshot = Self::creation_snapshot(&instance);
            if let Err(e) = self.launch(&instance, snapshot.as_ref()).await {
                tracing::error!(sandbox_id, error = %e, "failed to relaunch sandbox");
                self.registry
                    .set_state(sandbox_id, InstanceState::Stopped)
                    .await;
                return Err(e);
            }
        }

        if let Err(e) = self.wait_for_adb(&instance, cancel).await {
            tracing::warn!(sandbox_id, error = %e, "adb not ready after start");
        }

        self.registry
            .set_state(sandbox_id, InstanceState::Running)
            .await;
        self.history.clear(sandbox_id);
        tracing::info!(sandbox_id, "sandbox started");
        Ok(())
    }

    /// Alias of [`Orchestrator::start`].
    pub async fn resume(&self, sandbox_id: &str, cancel: &CancellationToken) -> DroidcoreResult<()> {
        self.start(sandbox_id, cancel).await
    }

    /// Alias of [`Orchestrator::start`].
    pub async fn boot(&self, sandbox_id: &str, cancel: &CancellationToken) -> DroidcoreResult<()> {
        self.start(sandbox_id, cancel).await
    }

    /// Stops a sandbox, keeping its disk state. A failed stop leaves the recorded state as it was.
    pub async fn stop(&self, sandbox_id: &str) -> DroidcoreResult<()> {
        let _guard = self.locks.lock(sandbox_id).await;
        let instance = self.instance(sandbox_id).await?;
        let previous = *instance.get_state();
        if previous == InstanceState::Stopped {
            tracing::debug!(sandbox_id, "sandbox already stopped");
            return Ok(());
        }

        tracing::info!(sandbox_id, instance_num = *instance.get_instance_num(), "stopping sandbox");
        self.registry
            .set_state(sandbox_id, InstanceState::Stopping)
            .await;

        if let Err(e) = self.toolchain.stop_group(*instance.get_instance_num()).await {
            tracing::error!(sandbox_id, error = %e, "failed to stop sandbox");
            self.registry.set_state(sandbox_id, previous).await;
            return Err(e);
        }

        self.registry
            .set_state(sandbox_id, InstanceState::Stopped)
            .await;
        tracing::info!(sandbox_id, "sandbox stopped");
        Ok(())
    }

    /// Alias of [`Orchestrator::stop`].
    pub async fn pause(&self, sandbox_id: &str) -> DroidcoreResult<()> {
        self.stop(sandbox_id).await
    }

    /// Alias of [`Orchestrator::stop`].
    pub async fn shutdown(&self, sandbox_id: &str) -> DroidcoreResult<()> {
        self.stop(sandbox_id).await
    }

    /// Stops a sandbox and kills whatever of its processes survive.
    pub async fn force_stop(&self, sandbox_id: &str) -> DroidcoreResult<()> {
        let _guard = self.locks.lock(sandbox_id).await;
        let instance = self.instance(sandbox_id).await?;
        let number = *instance.get_instance_num();

        tracing::info!(sandbox_id, instance_num = number, "force stopping sandbox");
        if let Err(e) = self.toolchain.stop_group(number).await {
            tracing::debug!(sandbox_id, error = %e, "cvd stop failed during force stop");
        }
        self.toolchain.kill_processes(number).await;

        self.registry
            .set_state(sandbox_id, InstanceState::Stopped)
            .await;
        Ok(())
    }

    /// Reboots the device of a sandbox that is not stopped.
    pub async fn reboot(&self, sandbox_id: &str, cancel: &CancellationToken) -> DroidcoreResult<()> {
        let _guard = self.locks.lock(sandbox_id).await;
        let instance = self.instance(sandbox_id).await?;
        if *instance.get_state() == InstanceState::Stopped {
            return Err(DroidcoreError::SandboxNotRunning(sandbox_id.to_string()));
        }

        tracing::info!(sandbox_id, "rebooting sandbox");
        self.adb(&instance).reboot().await?;

        if let Err(e) = self.wait_for_adb(&instance, cancel).await {
            tracing::warn!(sandbox_id, error = %e, "adb not ready after reboot");
        }
        Ok(())
    }
}
