use crate::{registry::InstanceState, DroidcoreResult};

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Destroys a sandbox and everything it left on the device host.
    ///
    /// Cleanup steps are best-effort. The sandbox is deregistered even if some of them fail.
    pub async fn destroy(&self, sandbox_id: &str) -> DroidcoreResult<()> {
        let guard = self.locks.lock(sandbox_id).await;
        let instance = match self.instance(sandbox_id).await {
            Ok(instance) => instance,
            Err(e) => {
                drop(guard);
                self.locks.remove(sandbox_id);
                return Err(e);
            }
        };
        let number = *instance.get_instance_num();
        tracing::info!(sandbox_id, instance_num = number, "destroying sandbox");

        if *instance.get_state() != InstanceState::Stopped {
            if let Err(e) = self.toolchain.stop_group(number).await {
                tracing::warn!(sandbox_id, error = %e, "failed to stop sandbox before destroy");
            }
        }

        self.toolchain.kill_processes(number).await;
        self.toolchain.force_cleanup(number).await;

        for dir in [
            instance.get_runtime_dir().clone(),
            self.config.instance_dir(sandbox_id),
        ] {
            if let Err(e) = self.gateway.remove_all(&dir).await {
                tracing::warn!(sandbox_id, dir = %dir.display(), error = %e, "failed to remove directory");
            }
        }

        self.registry.deregister(sandbox_id).await;
        if let Err(e) = self.registry.persist().await {
            tracing::warn!(sandbox_id, error = %e, "failed to persist instance mappings");
        }

        self.history.clear(sandbox_id);
        drop(guard);
        if !self.locks.remove(sandbox_id) {
            tracing::debug!(sandbox_id, "lock still in use, keeping it");
        }

        tracing::info!(sandbox_id, "sandbox destroyed");
        Ok(())
    }

    /// Alias of [`Orchestrator::destroy`].
    pub async fn delete(&self, sandbox_id: &str) -> DroidcoreResult<()> {
        self.destroy(sandbox_id).await
    }
}
