use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{
    adb::AdbClient,
    cvd::{FleetStatus, Toolchain},
    registry::Instance,
    DroidcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The liveness signals the health monitor consults.
#[async_trait]
pub trait FleetProbe: Send + Sync {
    /// The toolchain's status of every listed instance number.
    async fn fleet_status(&self) -> DroidcoreResult<BTreeMap<u32, FleetStatus>>;

    /// Whether the device endpoint answers a trivial command.
    async fn device_responds(&self, instance: &Instance) -> bool;

    /// Whether a VM process for the instance number exists. Probe failures count as absent.
    async fn vm_process_alive(&self, instance_num: u32) -> bool;
}

/// Probes the real toolchain and devices through the gateway.
#[derive(Clone)]
pub struct ToolchainProbe {
    /// The toolchain driver
    toolchain: Toolchain,

    /// Path to `adb` on the device host
    adb_path: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ToolchainProbe {
    /// Creates a probe.
    pub fn new(toolchain: Toolchain, adb_path: impl Into<String>) -> Self {
        Self {
            toolchain,
            adb_path: adb_path.into(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl FleetProbe for ToolchainProbe {
    async fn fleet_status(&self) -> DroidcoreResult<BTreeMap<u32, FleetStatus>> {
        Ok(self.toolchain.fleet().await?.status_table())
    }

    async fn device_responds(&self, instance: &Instance) -> bool {
        AdbClient::new(
            self.toolchain.gateway().clone(),
            self.adb_path.clone(),
            instance.get_adb_serial().clone(),
        )
        .is_responsive()
        .await
    }

    async fn vm_process_alive(&self, instance_num: u32) -> bool {
        match self.toolchain.vm_process_alive(instance_num).await {
            Ok(alive) => alive,
            Err(e) => {
                tracing::debug!(instance_num, error = %e, "vm process probe failed");
                false
            }
        }
    }
}
