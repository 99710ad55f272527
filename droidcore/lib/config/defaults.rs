use std::{path::PathBuf, sync::LazyLock, time::Duration};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of vCPUs for a new device.
pub const DEFAULT_CPUS: u32 = 2;

/// The default amount of RAM in MiB for a new device.
pub const DEFAULT_MEMORY_MB: u32 = 4096;

/// The default disk size in GiB for a new device.
pub const DEFAULT_DISK_GB: u32 = 20;

/// The first instance number handed out.
pub const DEFAULT_BASE_INSTANCE: u32 = 1;

/// The size of the instance number pool.
pub const DEFAULT_MAX_INSTANCES: u32 = 100;

/// The ADB port of instance number 1.
pub const DEFAULT_ADB_BASE_PORT: u16 = 6520;

/// The WebRTC streaming port of instance number 1.
pub const DEFAULT_WEBRTC_BASE_PORT: u16 = 8443;

/// The adb binary, resolved through `PATH`.
pub const DEFAULT_ADB_PATH: &str = "adb";

/// How often the health monitor reconciles the fleet.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive failed checks before a crash is reported.
pub const DEFAULT_HEALTH_MAX_RETRIES: u32 = 2;

/// How long to wait for a booted device to answer over ADB.
pub const DEFAULT_ADB_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Delay between two ADB readiness probes.
pub const DEFAULT_ADB_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The default S3 region.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// The default number of files transferred in parallel.
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 3;

/// The name of the file holding the sandbox to instance number mapping.
pub const MAPPINGS_FILENAME: &str = "mappings.json";

/// The name of the per-sandbox instance record.
pub const INSTANCE_FILENAME: &str = "instance.json";

/// The name of a custom snapshot's metadata file.
pub const MANIFEST_FILENAME: &str = "manifest.json";

//--------------------------------------------------------------------------------------------------
// Statics
//--------------------------------------------------------------------------------------------------

/// Where sandbox working directories and the mapping file live.
pub static DEFAULT_INSTANCES_PATH: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/var/lib/cuttlefish/instances"));

/// Where custom snapshots are stored.
pub static DEFAULT_ARTIFACTS_PATH: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/var/lib/cuttlefish/artifacts"));

/// The toolchain's home directory. Base images live directly under it.
pub static DEFAULT_CVD_HOME: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/home/vsoc-01"));

/// The system-installed Cuttlefish host tools.
pub static DEFAULT_HOST_TOOLS_PATH: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/usr/lib/cuttlefish-common"));
