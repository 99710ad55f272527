use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
};

use droidutils::CommandGateway;
use tokio::sync::{Mutex, RwLock};

use crate::{
    config::{DroidConfig, INSTANCE_FILENAME},
    DroidcoreError, DroidcoreResult,
};

use super::{Instance, InstanceMapping, InstanceState};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The in-memory registry of sandboxes and the instance numbers they hold.
///
/// Both maps live behind one lock that is only held for lookups and mutations, never across a
/// command on the device host.
pub struct Registry {
    /// Gateway to the host holding the mapping file
    gateway: Arc<dyn CommandGateway>,

    /// Pool, port and path settings
    config: DroidConfig,

    /// Sandbox and reverse maps
    state: RwLock<RegistryState>,

    /// Serializes mapping file rewrites
    persist_lock: Mutex<()>,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Registered instances by sandbox id
    instances: HashMap<String, Instance>,

    /// Sandbox id by instance number. Also holds reservations of creates in flight.
    numbers: BTreeMap<u32, String>,
}

/// The outcome of trying to adopt an instance found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adoption {
    /// The instance was registered.
    Adopted,

    /// The sandbox is already registered.
    AlreadyKnown,

    /// Another sandbox holds the number.
    NumberTaken(String),

    /// The number is outside the configured pool.
    OutOfRange,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Registry {
    /// Creates an empty registry.
    pub fn new(gateway: Arc<dyn CommandGateway>, config: DroidConfig) -> Self {
        Self {
            gateway,
            config,
            state: RwLock::new(RegistryState::default()),
            persist_lock: Mutex::new(()),
        }
    }

    /// Loads the mapping file, rebuilding every instance from its mapping and derived fields.
    ///
    /// A missing file is an empty registry. Sizing and metadata are restored from each sandbox's
    /// `instance.json` when it is still there. Returns the number of loaded mappings.
    pub async fn load(&self) -> DroidcoreResult<usize> {
        let path = self.config.mappings_file();
        if !self.gateway.exists(&path).await {
            tracing::info!(path = %path.display(), "no mapping file yet");
            return Ok(0);
        }

        let data = self.gateway.read_file(&path).await?;
        let mappings: Vec<InstanceMapping> = serde_json::from_slice(&data)?;

        let mut loaded = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let mut instance = self.instance_from_mapping(&mapping);
            let record_path = self
                .config
                .instance_dir(&mapping.sandbox_id)
                .join(INSTANCE_FILENAME);
            if self.gateway.exists(&record_path).await {
                match Instance::load(self.gateway.as_ref(), &record_path).await {
                    Ok(record) => instance.enrich_from(&record),
                    Err(e) => {
                        tracing::warn!(sandbox_id = %mapping.sandbox_id, error = %e, "unreadable instance record")
                    }
                }
            }
            loaded.push(instance);
        }

        let count = loaded.len();
        let mut state = self.state.write().await;
        for instance in loaded {
            state
                .numbers
                .insert(instance.instance_num, instance.sandbox_id.clone());
            state.instances.insert(instance.sandbox_id.clone(), instance);
        }

        tracing::info!(count, "loaded instance mappings");
        Ok(count)
    }

    /// Rewrites the mapping file from the registered instances.
    ///
    /// The file is replaced wholesale. Reservations of creates in flight are not written.
    pub async fn persist(&self) -> DroidcoreResult<()> {
        let _guard = self.persist_lock.lock().await;

        let mut mappings = {
            let state = self.state.read().await;
            state
                .instances
                .values()
                .map(Instance::mapping)
                .collect::<Vec<_>>()
        };
        mappings.sort_by_key(|mapping| mapping.instance_number);

        let data = serde_json::to_vec_pretty(&mappings)?;
        self.gateway
            .create_dir_all(self.config.get_instances_path())
            .await?;
        self.gateway
            .write_file(&self.config.mappings_file(), &data)
            .await?;

        tracing::debug!(count = mappings.len(), "persisted instance mappings");
        Ok(())
    }

    /// Reserves the lowest free instance number of the pool for a sandbox.
    pub async fn allocate_number(&self, sandbox_id: &str) -> DroidcoreResult<u32> {
        let mut state = self.state.write().await;
        let base = *self.config.get_base_instance();
        let number = (base..self.config.instance_range_end())
            .find(|number| !state.numbers.contains_key(number))
            .ok_or(DroidcoreError::PoolExhausted {
                max: *self.config.get_max_instances(),
            })?;

        state.numbers.insert(number, sandbox_id.to_string());
        Ok(number)
    }

    /// Releases a number reserved or held by `sandbox_id`.
    pub async fn release_number(&self, number: u32, sandbox_id: &str) {
        let mut state = self.state.write().await;
        if state.numbers.get(&number).map(String::as_str) == Some(sandbox_id) {
            state.numbers.remove(&number);
        }
    }

    /// Registers an instance under its sandbox id and number.
    pub async fn register(&self, instance: Instance) {
        let mut state = self.state.write().await;
        state
            .numbers
            .insert(instance.instance_num, instance.sandbox_id.clone());
        state
            .instances
            .insert(instance.sandbox_id.clone(), instance);
    }

    /// Registers an instance found on disk if neither its id nor its number is taken.
    pub async fn adopt(&self, instance: Instance) -> Adoption {
        let number = instance.instance_num;
        if number < *self.config.get_base_instance() || number >= self.config.instance_range_end() {
            return Adoption::OutOfRange;
        }

        let mut state = self.state.write().await;
        if state.instances.contains_key(&instance.sandbox_id) {
            return Adoption::AlreadyKnown;
        }

        if let Some(holder) = state.numbers.get(&number) {
            return Adoption::NumberTaken(holder.clone());
        }

        state.numbers.insert(number, instance.sandbox_id.clone());
        state
            .instances
            .insert(instance.sandbox_id.clone(), instance);
        Adoption::Adopted
    }

    /// Removes a sandbox and frees its number.
    pub async fn deregister(&self, sandbox_id: &str) -> Option<Instance> {
        let mut state = self.state.write().await;
        let instance = state.instances.remove(sandbox_id)?;
        if state.numbers.get(&instance.instance_num).map(String::as_str) == Some(sandbox_id) {
            state.numbers.remove(&instance.instance_num);
        }

        Some(instance)
    }

    /// Looks up a sandbox.
    pub async fn get(&self, sandbox_id: &str) -> Option<Instance> {
        self.state.read().await.instances.get(sandbox_id).cloned()
    }

    /// Looks up the sandbox holding or reserving an instance number.
    pub async fn get_by_number(&self, number: u32) -> Option<String> {
        self.state.read().await.numbers.get(&number).cloned()
    }

    /// Every registered instance, ordered by instance number.
    pub async fn list(&self) -> Vec<Instance> {
        let mut instances = self
            .state
            .read()
            .await
            .instances
            .values()
            .cloned()
            .collect::<Vec<_>>();
        instances.sort_by_key(|instance| instance.instance_num);
        instances
    }

    /// Every held or reserved instance number with its sandbox id.
    pub async fn known_numbers(&self) -> BTreeMap<u32, String> {
        self.state.read().await.numbers.clone()
    }

    /// Whether a registered instance holds the number. Reservations do not count.
    pub async fn owns_number(&self, number: u32) -> bool {
        let state = self.state.read().await;
        state
            .numbers
            .get(&number)
            .and_then(|sandbox_id| state.instances.get(sandbox_id))
            .is_some_and(|instance| instance.instance_num == number)
    }

    /// Whether the number is held or reserved.
    pub async fn is_known_number(&self, number: u32) -> bool {
        self.state.read().await.numbers.contains_key(&number)
    }

    /// Updates the recorded state of a sandbox. Returns false if it is not registered.
    pub async fn set_state(&self, sandbox_id: &str, new_state: InstanceState) -> bool {
        let mut state = self.state.write().await;
        match state.instances.get_mut(sandbox_id) {
            Some(instance) => {
                instance.state = new_state;
                true
            }
            None => false,
        }
    }

    /// Moves a sandbox from `from` to `to`. Returns false, changing nothing, if it is not
    /// registered or is in another state.
    pub async fn transition(&self, sandbox_id: &str, from: InstanceState, to: InstanceState) -> bool {
        let mut state = self.state.write().await;
        match state.instances.get_mut(sandbox_id) {
            Some(instance) if instance.state == from => {
                instance.state = to;
                true
            }
            _ => false,
        }
    }

    /// The configuration the registry derives ports and paths from.
    pub fn config(&self) -> &DroidConfig {
        &self.config
    }

    /// Path of a sandbox's full instance record.
    pub fn record_path(&self, sandbox_id: &str) -> PathBuf {
        self.config.instance_dir(sandbox_id).join(INSTANCE_FILENAME)
    }

    fn instance_from_mapping(&self, mapping: &InstanceMapping) -> Instance {
        let number = mapping.instance_number;
        Instance::builder()
            .sandbox_id(mapping.sandbox_id.clone())
            .instance_num(number)
            .state(InstanceState::Unknown)
            .cpus(*self.config.get_default_cpus())
            .memory_mb(*self.config.get_default_memory_mb())
            .disk_gb(*self.config.get_default_disk_gb())
            .adb_port(self.config.adb_port(number))
            .adb_serial(self.config.adb_serial(number))
            .webrtc_port(self.config.webrtc_port(number))
            .created_at(mapping.created_at)
            .runtime_dir(self.config.runtime_dir(number))
            .build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use droidutils::LocalGateway;

    use super::*;

    fn registry(root: &std::path::Path, max: u32) -> Registry {
        let config = DroidConfig::builder()
            .instances_path(root)
            .max_instances(max)
            .build();
        Registry::new(Arc::new(LocalGateway), config)
    }

    fn instance(registry: &Registry, sandbox_id: &str, number: u32) -> Instance {
        registry.instance_from_mapping(&InstanceMapping {
            sandbox_id: sandbox_id.to_string(),
            instance_number: number,
            created_at: chrono::Utc::now(),
        })
    }

    #[test_log::test(tokio::test)]
    async fn test_allocation_is_unique_until_exhausted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path(), 3);

        assert_eq!(registry.allocate_number("a").await?, 1);
        assert_eq!(registry.allocate_number("b").await?, 2);
        assert_eq!(registry.allocate_number("c").await?, 3);
        assert!(matches!(
            registry.allocate_number("d").await,
            Err(DroidcoreError::PoolExhausted { max: 3 })
        ));

        registry.release_number(2, "someone-else").await;
        assert!(registry.is_known_number(2).await);

        registry.release_number(2, "b").await;
        assert_eq!(registry.allocate_number("d").await?, 2);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_reservation_is_not_ownership() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path(), 4);

        let number = registry.allocate_number("a").await?;
        assert!(registry.is_known_number(number).await);
        assert!(!registry.owns_number(number).await);

        registry.register(instance(&registry, "a", number)).await;
        assert!(registry.owns_number(number).await);
        assert_eq!(registry.get_by_number(number).await.as_deref(), Some("a"));

        let removed = registry.deregister("a").await;
        assert_eq!(removed.map(|i| *i.get_instance_num()), Some(number));
        assert!(!registry.is_known_number(number).await);
        assert!(registry.deregister("a").await.is_none());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_persist_and_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let first = registry(dir.path(), 10);
        assert_eq!(first.load().await?, 0);

        let mut recorded = instance(&first, "b", 5);
        recorded.enrich_from(
            &Instance::builder()
                .sandbox_id("b")
                .instance_num(5)
                .cpus(8)
                .memory_mb(16384)
                .disk_gb(64)
                .adb_port(6524)
                .adb_serial("0.0.0.0:6524")
                .webrtc_port(8447)
                .runtime_dir("/tmp/cvd-5")
                .metadata(HashMap::from([("snapshot".to_string(), "base".to_string())]))
                .build(),
        );
        tokio::fs::create_dir_all(dir.path().join("b")).await?;
        recorded
            .save(&LocalGateway, &first.record_path("b"))
            .await?;

        first.register(instance(&first, "a", 2)).await;
        first.register(recorded).await;
        let _ = first.allocate_number("in-flight").await?;
        first.persist().await?;

        let second = registry(dir.path(), 10);
        assert_eq!(second.load().await?, 2);

        let a = second.get("a").await.unwrap();
        assert_eq!(*a.get_state(), InstanceState::Unknown);
        assert_eq!(*a.get_adb_port(), 6521);
        assert_eq!(a.get_adb_serial(), "0.0.0.0:6521");

        let b = second.get("b").await.unwrap();
        assert_eq!(*b.get_cpus(), 8);
        assert_eq!(b.snapshot(), Some("base"));

        assert_eq!(
            second.list().await.iter().map(|i| *i.get_instance_num()).collect::<Vec<_>>(),
            vec![2, 5]
        );
        assert!(!second.is_known_number(1).await);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_adopt_rules() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path(), 4);
        registry.register(instance(&registry, "a", 1)).await;

        assert_eq!(
            registry.adopt(instance(&registry, "a", 3)).await,
            Adoption::AlreadyKnown
        );
        assert_eq!(
            registry.adopt(instance(&registry, "b", 1)).await,
            Adoption::NumberTaken("a".to_string())
        );
        assert_eq!(
            registry.adopt(instance(&registry, "c", 9)).await,
            Adoption::OutOfRange
        );
        assert_eq!(
            registry.adopt(instance(&registry, "d", 2)).await,
            Adoption::Adopted
        );
        assert!(registry.owns_number(2).await);

        assert!(!registry.transition("d", InstanceState::Running, InstanceState::Stopped).await);
        assert!(registry.set_state("d", InstanceState::Running).await);
        assert!(registry.transition("d", InstanceState::Running, InstanceState::Stopped).await);
        assert_eq!(*registry.get("d").await.unwrap().get_state(), InstanceState::Stopped);
        assert!(!registry.set_state("missing", InstanceState::Running).await);

        Ok(())
    }
}
