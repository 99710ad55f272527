use crate::{
    config::INSTANCE_FILENAME,
    registry::{Adoption, Instance, InstanceState},
    DroidcoreResult,
};

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Registers sandboxes whose working directory survived but whose mapping was lost.
    ///
    /// A sandbox is adopted only if its instance number is still free. Returns the adopted ids.
    pub async fn recover_orphaned_sandboxes(&self) -> DroidcoreResult<Vec<String>> {
        let root = self.config.get_instances_path();
        if !self.gateway.is_dir(root).await {
            return Ok(Vec::new());
        }

        let mut adopted = Vec::new();
        for entry in self.gateway.list_dir(root).await? {
            if !entry.is_dir || entry.name.starts_with('.') {
                continue;
            }

            let sandbox_id = entry.name.as_str();
            if self.registry.get(sandbox_id).await.is_some() {
                continue;
            }

            let record_path = root.join(sandbox_id).join(INSTANCE_FILENAME);
            if !self.gateway.exists(&record_path).await {
                continue;
            }

            let mut instance = match Instance::load(self.gateway.as_ref(), &record_path).await {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::warn!(sandbox_id, error = %e, "unreadable instance record, skipping");
                    continue;
                }
            };

            if instance.get_sandbox_id() != sandbox_id {
                tracing::warn!(
                    sandbox_id,
                    recorded = %instance.get_sandbox_id(),
                    "instance record does not match its directory, skipping"
                );
                continue;
            }

            instance.state = InstanceState::Unknown;
            let number = *instance.get_instance_num();
            match self.registry.adopt(instance).await {
                Adoption::Adopted => {
                    tracing::info!(sandbox_id, instance_num = number, "recovered orphaned sandbox");
                    adopted.push(sandbox_id.to_string());
                }
                Adoption::AlreadyKnown => {}
                Adoption::NumberTaken(holder) => {
                    tracing::warn!(sandbox_id, instance_num = number, holder = %holder, "instance number already taken, skipping orphan");
                }
                Adoption::OutOfRange => {
                    tracing::warn!(sandbox_id, instance_num = number, "instance number outside the pool, skipping orphan");
                }
            }
        }

        if !adopted.is_empty() {
            self.registry.persist().await?;
            tracing::info!(count = adopted.len(), "recovered orphaned sandboxes");
        }

        Ok(adopted)
    }
}
