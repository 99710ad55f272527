use std::{collections::BTreeMap, sync::Arc};

use crate::{cvd::Toolchain, registry::Registry, DroidcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Removes toolchain instances the registry does not account for.
#[derive(Clone)]
pub struct FleetSynchronizer {
    /// The toolchain driver
    toolchain: Toolchain,

    /// The registry to reconcile against
    registry: Arc<Registry>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FleetSynchronizer {
    /// Creates a synchronizer.
    pub fn new(toolchain: Toolchain, registry: Arc<Registry>) -> Self {
        Self {
            toolchain,
            registry,
        }
    }

    /// Maps every instance number the toolchain knows to its group label.
    pub async fn list_external_instance_numbers(&self) -> DroidcoreResult<BTreeMap<u32, String>> {
        Ok(self.toolchain.fleet().await?.instance_numbers())
    }

    /// Force-removes every toolchain instance whose number the registry neither holds nor has
    /// reserved. Returns the removed numbers.
    ///
    /// Repairs drift left behind when the orchestrator restarted while the toolchain kept running.
    pub async fn sync_cvd_state(&self) -> DroidcoreResult<Vec<u32>> {
        tracing::info!("synchronizing toolchain state with the registry");

        let external = self.list_external_instance_numbers().await?;
        if external.is_empty() {
            tracing::info!("no toolchain instances found on host");
            return Ok(Vec::new());
        }

        let known = self.registry.known_numbers().await;
        tracing::info!(external = ?external, known = ?known, "comparing fleets");

        let orphaned = external
            .iter()
            .filter(|(number, _)| !known.contains_key(*number))
            .map(|(number, group)| {
                tracing::warn!(instance_num = number, group = %group, "found orphaned toolchain instance");
                *number
            })
            .collect::<Vec<_>>();

        for number in &orphaned {
            tracing::info!(instance_num = number, "removing orphaned toolchain instance");
            self.toolchain.force_remove(*number).await;
        }

        if orphaned.is_empty() {
            tracing::info!("no orphaned toolchain instances found");
        } else {
            tracing::info!(count = orphaned.len(), "removed orphaned toolchain instances");
        }

        Ok(orphaned)
    }

    /// Prepares a freshly reserved number for launch.
    ///
    /// Removes a toolchain registration under the number unless a registered instance owns it,
    /// then clears leftover sockets. A failed fleet lookup is logged and ignored.
    pub async fn ensure_instance_available(&self, number: u32) -> DroidcoreResult<()> {
        match self.list_external_instance_numbers().await {
            Ok(external) => {
                if let Some(group) = external.get(&number) {
                    if !self.registry.owns_number(number).await {
                        tracing::warn!(
                            instance_num = number,
                            group = %group,
                            "instance exists in the toolchain but not in the registry, removing it"
                        );
                        self.toolchain.force_remove(number).await;
                        tracing::info!(instance_num = number, "removed stale toolchain instance");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(instance_num = number, error = %e, "failed to check toolchain state, continuing");
            }
        }

        self.toolchain.clean_stale_sockets(number).await;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::{config::DroidConfig, registry::Instance, testing::ScriptedGateway};

    use super::*;

    const FLEET: &str = r#"{"groups":[{"group_name":"cvd_1"},{"group_name":"cvd_2"},{"group_name":"cvd_3"}]}"#;

    async fn setup() -> (Arc<ScriptedGateway>, FleetSynchronizer, Arc<Registry>) {
        let gateway = ScriptedGateway::new(|command| {
            if command.contains(" fleet ") {
                (0, FLEET.to_string())
            } else {
                (0, String::new())
            }
        });
        let config = DroidConfig::builder().build();
        let registry = Arc::new(Registry::new(gateway.clone(), config.clone()));
        let toolchain = Toolchain::new(gateway.clone(), &config);
        let sync = FleetSynchronizer::new(toolchain, registry.clone());
        (gateway, sync, registry)
    }

    async fn register(registry: &Registry, sandbox_id: &str, number: u32) {
        let instance = Instance::builder()
            .sandbox_id(sandbox_id)
            .instance_num(number)
            .cpus(2)
            .memory_mb(4096)
            .disk_gb(20)
            .adb_port(6520)
            .adb_serial("0.0.0.0:6520")
            .webrtc_port(8443)
            .runtime_dir("/tmp")
            .build();
        registry.register(instance).await;
    }

    #[test_log::test(tokio::test)]
    async fn test_sync_removes_unknown_numbers_only() -> anyhow::Result<()> {
        let (gateway, sync, registry) = setup().await;
        register(&registry, "a", 1).await;
        let reserved = registry.allocate_number("in-flight").await?;
        assert_eq!(reserved, 2);

        let removed = sync.sync_cvd_state().await?;
        assert_eq!(removed, vec![3]);
        assert_eq!(gateway.count("rm --group_name=cvd_3"), 1);
        assert_eq!(gateway.count("rm --group_name=cvd_1"), 0);
        assert_eq!(gateway.count("rm --group_name=cvd_2"), 0);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_ensure_available_removes_unowned_registration() -> anyhow::Result<()> {
        let (gateway, sync, registry) = setup().await;
        register(&registry, "a", 1).await;

        let number = registry.allocate_number("b").await?;
        assert_eq!(number, 2);
        sync.ensure_instance_available(number).await?;
        assert_eq!(gateway.count("rm --group_name=cvd_2"), 1);
        assert_eq!(gateway.count("/tmp/cf_avd_*/cvd-2"), 1);

        sync.ensure_instance_available(1).await?;
        assert_eq!(gateway.count("rm --group_name=cvd_1"), 0);

        Ok(())
    }
}
