use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    registry::{Instance, InstanceState, SandboxInfo},
    snapshot::SnapshotRef,
    DroidcoreError, DroidcoreResult,
};

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options for creating a sandbox.
#[derive(Debug, Clone, TypedBuilder)]
pub struct CreateOptions {
    /// The caller-assigned sandbox id.
    #[builder(setter(into))]
    pub sandbox_id: String,

    /// vCPUs. Defaults to the configured value.
    #[builder(default, setter(strip_option))]
    pub cpus: Option<u32>,

    /// RAM in MiB. Defaults to the configured value.
    #[builder(default, setter(strip_option))]
    pub memory_mb: Option<u32>,

    /// Disk in GiB. Defaults to the configured value.
    #[builder(default, setter(strip_option))]
    pub disk_gb: Option<u32>,

    /// Snapshot to boot from, `<name>` or `<org-uuid>/<name>`.
    #[builder(default, setter(strip_option, into))]
    pub snapshot: Option<String>,

    /// Free-form metadata stored with the sandbox.
    #[builder(default)]
    pub metadata: HashMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Creates and boots a sandbox.
    ///
    /// Creating a sandbox that already exists returns its current info without touching it. On
    /// failure after an instance number was taken, every side effect is rolled back.
    ///
    /// ## Examples
    ///
    /// ```no_run
    /// use droidcore::{config::DroidConfig, orchestration::{CreateOptions, Orchestrator}};
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # async fn example() -> anyhow::Result<()> {
    /// let orchestrator = Orchestrator::new(DroidConfig::from_env()?).await?;
    /// let options = CreateOptions::builder()
    ///     .sandbox_id("sb-1")
    ///     .snapshot("aosp_cf_x86_64_phone")
    ///     .build();
    ///
    /// let info = orchestrator.create(options, &CancellationToken::new()).await?;
    /// println!("{} listens on {}", info.id, info.adb_serial);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn create(
        &self,
        options: CreateOptions,
        cancel: &CancellationToken,
    ) -> DroidcoreResult<SandboxInfo> {
        let sandbox_id = options.sandbox_id.trim().to_string();
        let sandbox_id = sandbox_id.as_str();
        if sandbox_id.is_empty() {
            return Err(DroidcoreError::InvalidArgument(
                "sandbox id is required".to_string(),
            ));
        }

        let _guard = self.locks.lock(sandbox_id).await;

        if let Some(existing) = self.registry.get(sandbox_id).await {
            tracing::info!(sandbox_id, state = %existing.get_state(), "sandbox already exists");
            return Ok(existing.info(*existing.get_state()));
        }

        let snapshot = match options.snapshot.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => Some(self.snapshots.require(path).await?),
            _ => None,
        };

        let mut metadata = options.metadata;
        if let Some(snapshot) = &snapshot {
            metadata.insert("snapshot".to_string(), snapshot.to_string());
        }

        let number = self.registry.allocate_number(sandbox_id).await?;
        if let Err(e) = self.fleet.ensure_instance_available(number).await {
            self.registry.release_number(number, sandbox_id).await;
            return Err(e);
        }

        let instance = Instance::builder()
            .sandbox_id(sandbox_id)
            .instance_num(number)
            .cpus(options.cpus.unwrap_or(*self.config.get_default_cpus()))
            .memory_mb(options.memory_mb.unwrap_or(*self.config.get_default_memory_mb()))
            .disk_gb(options.disk_gb.unwrap_or(*self.config.get_default_disk_gb()))
            .adb_port(self.config.adb_port(number))
            .adb_serial(self.config.adb_serial(number))
            .webrtc_port(self.config.webrtc_port(number))
            .runtime_dir(self.config.runtime_dir(number))
            .metadata(metadata)
            .build();

        tracing::info!(
            sandbox_id,
            instance_num = number,
            cpus = *instance.get_cpus(),
            memory_mb = *instance.get_memory_mb(),
            snapshot = ?instance.snapshot(),
            "creating sandbox"
        );

        let instance_dir = self.config.instance_dir(sandbox_id);
        if let Err(e) = self.gateway.create_dir_all(&instance_dir).await {
            self.registry.release_number(number, sandbox_id).await;
            return Err(e.into());
        }

        if let Err(e) = instance
            .save(self.gateway.as_ref(), &self.registry.record_path(sandbox_id))
            .await
        {
            self.rollback_create(&instance).await;
            return Err(e);
        }

        self.registry.register(instance.clone()).await;
        if let Err(e) = self.registry.persist().await {
            tracing::warn!(sandbox_id, error = %e, "failed to persist instance mappings");
        }

        if let Err(e) = self.launch(&instance, snapshot.as_ref()).await {
            tracing::error!(sandbox_id, instance_num = number, error = %e, "failed to launch sandbox");
            self.rollback_create(&instance).await;
            return Err(e);
        }

        if let Err(e) = self.wait_for_adb(&instance, cancel).await {
            tracing::warn!(sandbox_id, error = %e, "adb not ready, sandbox may still be booting");
        }

        self.registry
            .set_state(sandbox_id, InstanceState::Running)
            .await;
        tracing::info!(sandbox_id, instance_num = number, "sandbox created");

        Ok(instance.info(InstanceState::Running))
    }

    /// The snapshot a sandbox was created from, if it parses.
    pub(super) fn creation_snapshot(instance: &Instance) -> Option<SnapshotRef> {
        let path = instance.snapshot()?;
        match SnapshotRef::parse(path) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(sandbox_id = %instance.get_sandbox_id(), path, error = %e, "ignoring unparsable snapshot reference");
                None
            }
        }
    }

    async fn rollback_create(&self, instance: &Instance) {
        let sandbox_id = instance.get_sandbox_id().as_str();
        let number = *instance.get_instance_num();
        tracing::info!(sandbox_id, instance_num = number, "rolling back sandbox creation");

        if let Err(e) = self.toolchain.stop_group(number).await {
            tracing::debug!(sandbox_id, error = %e, "stop during rollback failed");
        }
        self.toolchain.force_cleanup(number).await;

        self.registry.deregister(sandbox_id).await;
        self.registry.release_number(number, sandbox_id).await;
        if let Err(e) = self.registry.persist().await {
            tracing::warn!(sandbox_id, error = %e, "failed to persist instance mappings");
        }

        if let Err(e) = self
            .gateway
            .remove_all(&self.config.instance_dir(sandbox_id))
            .await
        {
            tracing::warn!(sandbox_id, error = %e, "failed to remove instance directory");
        }
    }
}
