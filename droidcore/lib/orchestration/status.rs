use futures::future::join_all;

use crate::{
    metrics::{collect_host_metrics, HostMetrics},
    registry::{Instance, InstanceState, SandboxInfo},
    snapshot::SnapshotInfo,
    DroidcoreResult,
};

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Every registered sandbox, ordered by instance number.
    pub async fn list(&self) -> Vec<Instance> {
        self.registry.list().await
    }

    /// Every registered sandbox with its probed state.
    pub async fn list_with_info(&self) -> Vec<SandboxInfo> {
        let instances = self.registry.list().await;
        join_all(instances.iter().map(|instance| self.probe_info(instance))).await
    }

    /// A sandbox with its probed state.
    pub async fn get_info(&self, sandbox_id: &str) -> DroidcoreResult<SandboxInfo> {
        let instance = self.instance(sandbox_id).await?;
        Ok(self.probe_info(&instance).await)
    }

    /// Captures a running sandbox into a custom snapshot of `org_id`.
    pub async fn create_snapshot(
        &self,
        sandbox_id: &str,
        org_id: &str,
        name: &str,
        description: &str,
    ) -> DroidcoreResult<SnapshotInfo> {
        let _guard = self.locks.lock(sandbox_id).await;
        self.snapshots
            .create_snapshot_from_instance(sandbox_id, org_id, name, description)
            .await
    }

    /// Resource usage of the device host.
    pub async fn host_metrics(&self) -> DroidcoreResult<HostMetrics> {
        collect_host_metrics(self.gateway.as_ref()).await
    }

    /// Reconciles the registry with the toolchain's fleet. Returns the removed instance numbers.
    pub async fn sync_cvd_state(&self) -> DroidcoreResult<Vec<u32>> {
        self.fleet.sync_cvd_state().await
    }

    /// Transitional states are reported as recorded. Settled states are checked against the VM
    /// process, and a failing check reports unknown.
    async fn probe_info(&self, instance: &Instance) -> SandboxInfo {
        let recorded = *instance.get_state();
        let state = match recorded {
            InstanceState::Starting | InstanceState::Stopping => recorded,
            _ => match self
                .toolchain
                .vm_process_alive(*instance.get_instance_num())
                .await
            {
                Ok(true) => InstanceState::Running,
                Ok(false) => InstanceState::Stopped,
                Err(e) => {
                    tracing::debug!(sandbox_id = %instance.get_sandbox_id(), error = %e, "vm process probe failed");
                    InstanceState::Unknown
                }
            },
        };

        instance.info(state)
    }
}
