use std::{
    collections::HashMap,
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use droidutils::CommandGateway;
use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::DroidcoreResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One virtual device and its bookkeeping.
#[derive(Debug, Clone, PartialEq, TypedBuilder, Getters, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[getset(get = "pub with_prefix")]
pub struct Instance {
    /// The caller-assigned sandbox id.
    #[builder(setter(into))]
    pub(crate) sandbox_id: String,

    /// The slot number, unique among registered instances.
    pub(crate) instance_num: u32,

    /// The last known lifecycle state.
    #[builder(default = InstanceState::Starting)]
    pub(crate) state: InstanceState,

    /// vCPUs.
    pub(crate) cpus: u32,

    /// RAM in MiB.
    pub(crate) memory_mb: u32,

    /// Disk in GiB.
    pub(crate) disk_gb: u32,

    /// ADB port on the device host.
    pub(crate) adb_port: u16,

    /// ADB network serial.
    #[builder(setter(into))]
    pub(crate) adb_serial: String,

    /// WebRTC streaming port.
    pub(crate) webrtc_port: u16,

    /// When the sandbox was created.
    #[builder(default = Utc::now())]
    pub(crate) created_at: DateTime<Utc>,

    /// The toolchain's runtime directory for the instance number.
    #[builder(setter(into))]
    pub(crate) runtime_dir: PathBuf,

    /// Free-form metadata. The `snapshot` key remembers the image the sandbox was created from.
    #[serde(default)]
    #[builder(default)]
    pub(crate) metadata: HashMap<String, String>,
}

/// The lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Being created or started.
    Starting,

    /// Booted.
    Running,

    /// Being stopped.
    Stopping,

    /// Not running.
    Stopped,

    /// Not yet observed, e.g. right after a restart.
    Unknown,
}

/// The durable subset of an [`Instance`], stored in the mapping file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMapping {
    /// The sandbox id
    pub sandbox_id: String,

    /// The instance number it holds
    #[serde(alias = "instanceNum")]
    pub instance_number: u32,

    /// When the sandbox was created
    pub created_at: DateTime<Utc>,
}

/// The caller-facing view of a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    /// The sandbox id
    pub id: String,

    /// The observed state
    pub state: InstanceState,

    /// vCPUs
    pub vcpus: u32,

    /// RAM in MiB
    pub memory_mb: u32,

    /// ADB network serial
    pub adb_serial: String,

    /// ADB port
    pub adb_port: u16,

    /// When the sandbox was created
    pub created_at: DateTime<Utc>,

    /// Free-form metadata
    pub metadata: HashMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Instance {
    /// The snapshot reference the sandbox was created from, if any.
    pub fn snapshot(&self) -> Option<&str> {
        self.metadata
            .get("snapshot")
            .map(String::as_str)
            .filter(|snapshot| !snapshot.is_empty())
    }

    /// The durable subset of this instance.
    pub fn mapping(&self) -> InstanceMapping {
        InstanceMapping {
            sandbox_id: self.sandbox_id.clone(),
            instance_number: self.instance_num,
            created_at: self.created_at,
        }
    }

    /// The caller-facing view with the given observed state.
    pub fn info(&self, state: InstanceState) -> SandboxInfo {
        SandboxInfo {
            id: self.sandbox_id.clone(),
            state,
            vcpus: self.cpus,
            memory_mb: self.memory_mb,
            adb_serial: self.adb_serial.clone(),
            adb_port: self.adb_port,
            created_at: self.created_at,
            metadata: self.metadata.clone(),
        }
    }

    /// Copies sizing and metadata from a full record saved at creation time.
    pub(crate) fn enrich_from(&mut self, record: &Instance) {
        self.cpus = record.cpus;
        self.memory_mb = record.memory_mb;
        self.disk_gb = record.disk_gb;
        self.metadata = record.metadata.clone();
    }

    /// Saves the full record to a file on the device host.
    pub async fn save(&self, gateway: &dyn CommandGateway, path: &Path) -> DroidcoreResult<()> {
        let serialized = serde_json::to_vec_pretty(self)?;
        gateway.write_file(path, &serialized).await?;
        Ok(())
    }

    /// Loads a full record from a file on the device host.
    pub async fn load(gateway: &dyn CommandGateway, path: &Path) -> DroidcoreResult<Self> {
        let data = gateway.read_file(path).await?;
        let instance = serde_json::from_slice(&data)?;
        Ok(instance)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Unknown => "unknown",
        };
        write!(f, "{state}")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use droidutils::LocalGateway;

    use super::*;

    fn instance() -> Instance {
        Instance::builder()
            .sandbox_id("sb-1")
            .instance_num(2)
            .cpus(4)
            .memory_mb(8192)
            .disk_gb(32)
            .adb_port(6521)
            .adb_serial("0.0.0.0:6521")
            .webrtc_port(8444)
            .runtime_dir("/home/vsoc-01/cuttlefish/instances/cvd-2")
            .metadata(HashMap::from([(
                "snapshot".to_string(),
                "aosp_cf_x86_64_phone".to_string(),
            )]))
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn test_save_and_load_instance() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("instance.json");
        let instance = instance();

        instance.save(&LocalGateway, &path).await?;
        let loaded = Instance::load(&LocalGateway, &path).await?;
        assert_eq!(loaded, instance);
        assert_eq!(loaded.snapshot(), Some("aosp_cf_x86_64_phone"));

        let raw: serde_json::Value = serde_json::from_slice(&tokio::fs::read(&path).await?)?;
        assert_eq!(raw["sandboxId"], "sb-1");
        assert_eq!(raw["state"], "starting");

        Ok(())
    }

    #[test]
    fn test_mapping_accepts_legacy_field_name() -> anyhow::Result<()> {
        let mappings: Vec<InstanceMapping> = serde_json::from_str(
            r#"[{"sandboxId":"a","instanceNum":3,"createdAt":"2025-01-01T00:00:00Z"}]"#,
        )?;
        assert_eq!(mappings[0].instance_number, 3);

        let written = serde_json::to_value(&instance().mapping())?;
        assert_eq!(written["instanceNumber"], 2);

        Ok(())
    }
}
