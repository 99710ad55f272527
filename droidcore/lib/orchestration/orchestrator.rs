use std::{sync::Arc, time::Instant};

use droidutils::CommandGateway;
use tokio_util::sync::CancellationToken;

use crate::{
    adb::AdbClient,
    config::DroidConfig,
    cvd::{LaunchImage, LaunchSpec, Toolchain},
    fleet::FleetSynchronizer,
    health::{CrashReporter, FleetProbe, HealthChecker, HealthHistory, ToolchainProbe},
    registry::{Instance, Registry, SandboxInfo, SandboxLocks},
    snapshot::{SnapshotManager, SnapshotRef},
    transfer::ArtifactTransfer,
    DroidcoreError, DroidcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The orchestrator of the sandbox fleet.
pub struct Orchestrator {
    /// The orchestrator configuration.
    pub(super) config: DroidConfig,

    /// Gateway to the device host.
    pub(super) gateway: Arc<dyn CommandGateway>,

    /// The toolchain driver.
    pub(super) toolchain: Toolchain,

    /// Sandboxes and their instance numbers.
    pub(super) registry: Arc<Registry>,

    /// Serializes lifecycle operations per sandbox.
    pub(super) locks: SandboxLocks,

    /// Reconciles the registry with the toolchain's fleet.
    pub(super) fleet: FleetSynchronizer,

    /// Snapshot lookup and capture.
    pub(super) snapshots: SnapshotManager,

    /// Snapshot upload and download.
    pub(super) transfer: ArtifactTransfer,

    /// Liveness history shared with the health monitor.
    pub(super) history: HealthHistory,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Creates an orchestrator for the configured device host and loads the mapping file.
    pub async fn new(config: DroidConfig) -> DroidcoreResult<Self> {
        let gateway = droidutils::connect(
            config.get_ssh_host().as_deref(),
            config.get_ssh_key_path().as_deref(),
        );
        Self::with_gateway(config, gateway).await
    }

    /// Creates an orchestrator on top of an existing gateway and loads the mapping file.
    pub async fn with_gateway(
        config: DroidConfig,
        gateway: Arc<dyn CommandGateway>,
    ) -> DroidcoreResult<Self> {
        config.validate()?;
        gateway.create_dir_all(config.get_instances_path()).await?;

        let toolchain = Toolchain::new(gateway.clone(), &config);
        let registry = Arc::new(Registry::new(gateway.clone(), config.clone()));
        registry.load().await?;

        let fleet = FleetSynchronizer::new(toolchain.clone(), registry.clone());
        let snapshots = SnapshotManager::new(toolchain.clone(), registry.clone(), &config);
        let transfer = ArtifactTransfer::from_config(gateway.clone(), &config)?;

        tracing::info!(
            remote = gateway.is_remote(),
            instances = %config.get_instances_path().display(),
            "orchestrator ready"
        );

        Ok(Self {
            config,
            gateway,
            toolchain,
            registry,
            locks: SandboxLocks::new(),
            fleet,
            snapshots,
            transfer,
            history: HealthHistory::new(),
        })
    }

    /// The orchestrator configuration.
    pub fn config(&self) -> &DroidConfig {
        &self.config
    }

    /// The gateway to the device host.
    pub fn gateway(&self) -> &Arc<dyn CommandGateway> {
        &self.gateway
    }

    /// The toolchain driver.
    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// The sandbox registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The fleet synchronizer.
    pub fn fleet(&self) -> &FleetSynchronizer {
        &self.fleet
    }

    /// The snapshot manager.
    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Moves custom snapshots to and from the object store.
    pub fn transfer(&self) -> &ArtifactTransfer {
        &self.transfer
    }

    /// The liveness history shared with the health monitor.
    pub fn history(&self) -> &HealthHistory {
        &self.history
    }

    /// A health checker over this orchestrator's sandboxes, sharing its history.
    pub fn health_checker(&self, reporter: Arc<dyn CrashReporter>) -> HealthChecker {
        let probe: Arc<dyn FleetProbe> = Arc::new(ToolchainProbe::new(
            self.toolchain.clone(),
            self.config.get_adb_path().clone(),
        ));

        HealthChecker::new(
            self.registry.clone(),
            probe,
            reporter,
            self.history.clone(),
            *self.config.get_health_max_retries(),
        )
    }

    /// An ADB client for a sandbox's device.
    pub fn adb(&self, instance: &Instance) -> AdbClient {
        AdbClient::new(
            self.gateway.clone(),
            self.config.get_adb_path().clone(),
            instance.get_adb_serial().clone(),
        )
    }

    /// An ADB client for a registered sandbox.
    pub async fn adb_for(&self, sandbox_id: &str) -> DroidcoreResult<AdbClient> {
        let instance = self.instance(sandbox_id).await?;
        Ok(self.adb(&instance))
    }

    /// Forking is not supported by this backend.
    pub async fn fork(&self, sandbox_id: &str, _new_sandbox_id: &str) -> DroidcoreResult<Option<SandboxInfo>> {
        tracing::warn!(sandbox_id, "fork is not supported for android sandboxes");
        Ok(None)
    }

    /// Cloning is not supported by this backend.
    pub async fn clone_sandbox(
        &self,
        sandbox_id: &str,
        _new_sandbox_id: &str,
    ) -> DroidcoreResult<Option<SandboxInfo>> {
        tracing::warn!(sandbox_id, "clone is not supported for android sandboxes");
        Ok(None)
    }

    /// Looks up a registered sandbox.
    pub(super) async fn instance(&self, sandbox_id: &str) -> DroidcoreResult<Instance> {
        self.registry
            .get(sandbox_id)
            .await
            .ok_or_else(|| DroidcoreError::SandboxNotFound(sandbox_id.to_string()))
    }

    /// Boots an instance from the given image source.
    pub(super) async fn launch(
        &self,
        instance: &Instance,
        snapshot: Option<&SnapshotRef>,
    ) -> DroidcoreResult<()> {
        let (image, image_dir) = match snapshot {
            None => (LaunchImage::Default, None),
            Some(snapshot) => {
                let dir = self.snapshots.snapshot_dir(snapshot);
                let image = if snapshot.is_base() {
                    LaunchImage::Base {
                        product_path: dir.clone(),
                    }
                } else {
                    LaunchImage::Restore {
                        snapshot_dir: dir.clone(),
                    }
                };
                (image, Some(dir))
            }
        };

        let spec = LaunchSpec {
            instance_num: *instance.get_instance_num(),
            cpus: *instance.get_cpus(),
            memory_mb: *instance.get_memory_mb(),
            host_path: self.toolchain.host_path_for(image_dir.as_deref()).await,
            image,
        };

        self.toolchain.launch(&spec).await?;
        tracing::info!(sandbox_id = %instance.get_sandbox_id(), instance_num = spec.instance_num, "cvd create completed");
        Ok(())
    }

    /// Waits until the device answers over ADB, the configured timeout expires or `cancel` fires.
    pub async fn wait_for_adb(
        &self,
        instance: &Instance,
        cancel: &CancellationToken,
    ) -> DroidcoreResult<()> {
        let adb = self.adb(instance);
        let timeout = *self.config.get_adb_ready_timeout();
        let deadline = Instant::now() + timeout;
        tracing::info!(serial = adb.serial(), ?timeout, "waiting for adb");

        loop {
            let responsive = tokio::select! {
                _ = cancel.cancelled() => return Err(DroidcoreError::Cancelled(format!("waiting for adb on {}", adb.serial()))),
                responsive = adb.is_responsive() => responsive,
            };

            if responsive {
                tracing::info!(serial = adb.serial(), "adb ready");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(DroidcoreError::Timeout(format!(
                    "adb on {} not ready after {:?}",
                    adb.serial(),
                    timeout
                )));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(DroidcoreError::Cancelled(format!("waiting for adb on {}", adb.serial()))),
                _ = tokio::time::sleep(*self.config.get_adb_poll_interval()) => {}
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
