//! The orchestrator configuration.

use std::{
    env,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use getset::Getters;
use typed_builder::TypedBuilder;

use super::{
    DEFAULT_ADB_BASE_PORT, DEFAULT_ADB_PATH, DEFAULT_ADB_POLL_INTERVAL, DEFAULT_ADB_READY_TIMEOUT,
    DEFAULT_ARTIFACTS_PATH, DEFAULT_BASE_INSTANCE, DEFAULT_CPUS, DEFAULT_CVD_HOME,
    DEFAULT_DISK_GB, DEFAULT_HEALTH_INTERVAL, DEFAULT_HEALTH_MAX_RETRIES, DEFAULT_HOST_TOOLS_PATH,
    DEFAULT_INSTANCES_PATH, DEFAULT_MAX_INSTANCES, DEFAULT_MEMORY_MB, DEFAULT_S3_REGION,
    DEFAULT_TRANSFER_CONCURRENCY, DEFAULT_WEBRTC_BASE_PORT, MAPPINGS_FILENAME,
};

use crate::{DroidcoreError, DroidcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Configuration of a single orchestrator process.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DroidConfig {
    /// Root of the per-sandbox working directories and the mapping file.
    #[builder(default = DEFAULT_INSTANCES_PATH.clone(), setter(into))]
    instances_path: PathBuf,

    /// Root of the custom snapshot store.
    #[builder(default = DEFAULT_ARTIFACTS_PATH.clone(), setter(into))]
    artifacts_path: PathBuf,

    /// The toolchain's home directory.
    #[builder(default = DEFAULT_CVD_HOME.clone(), setter(into))]
    cvd_home: PathBuf,

    /// Path to the `cvd` binary.
    #[builder(default = DEFAULT_CVD_HOME.join("bin/cvd"), setter(into))]
    cvd_path: PathBuf,

    /// Path to the `adb` binary.
    #[builder(default = DEFAULT_ADB_PATH.to_string(), setter(into))]
    adb_path: String,

    /// System-installed host tools, used when a snapshot does not bundle its own.
    #[builder(default = DEFAULT_HOST_TOOLS_PATH.clone(), setter(into))]
    host_tools_path: PathBuf,

    /// vCPUs given to a device when the caller does not say.
    #[builder(default = DEFAULT_CPUS)]
    default_cpus: u32,

    /// RAM in MiB given to a device when the caller does not say.
    #[builder(default = DEFAULT_MEMORY_MB)]
    default_memory_mb: u32,

    /// Disk in GiB given to a device when the caller does not say.
    #[builder(default = DEFAULT_DISK_GB)]
    default_disk_gb: u32,

    /// First instance number of the pool.
    #[builder(default = DEFAULT_BASE_INSTANCE)]
    base_instance: u32,

    /// Size of the instance number pool.
    #[builder(default = DEFAULT_MAX_INSTANCES)]
    max_instances: u32,

    /// ADB port of instance number 1.
    #[builder(default = DEFAULT_ADB_BASE_PORT)]
    adb_base_port: u16,

    /// WebRTC port of instance number 1.
    #[builder(default = DEFAULT_WEBRTC_BASE_PORT)]
    webrtc_base_port: u16,

    /// Remote host; `None` runs everything locally.
    #[builder(default, setter(strip_option, into))]
    ssh_host: Option<String>,

    /// Private key for the remote host.
    #[builder(default, setter(strip_option, into))]
    ssh_key_path: Option<PathBuf>,

    /// Interval between two health checks.
    #[builder(default = DEFAULT_HEALTH_INTERVAL)]
    health_interval: Duration,

    /// Consecutive failed checks before a crash is reported.
    #[builder(default = DEFAULT_HEALTH_MAX_RETRIES)]
    health_max_retries: u32,

    /// Upper bound on waiting for a device to answer over ADB.
    #[builder(default = DEFAULT_ADB_READY_TIMEOUT)]
    adb_ready_timeout: Duration,

    /// Delay between two ADB readiness probes.
    #[builder(default = DEFAULT_ADB_POLL_INTERVAL)]
    adb_poll_interval: Duration,

    /// Control-plane API base URL used for crash reports.
    #[builder(default, setter(strip_option, into))]
    api_url: Option<String>,

    /// Bearer token for the control-plane API.
    #[builder(default, setter(strip_option, into))]
    api_key: Option<String>,

    /// Object store settings.
    #[builder(default)]
    s3: S3Config,
}

/// Settings of the S3-compatible object store holding snapshot artifacts.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct S3Config {
    /// Custom endpoint, e.g. a MinIO server. Enables path-style addressing.
    #[builder(default, setter(strip_option, into))]
    endpoint: Option<String>,

    /// Bucket region.
    #[builder(default = DEFAULT_S3_REGION.to_string(), setter(into))]
    region: String,

    /// Access key id.
    #[builder(default, setter(strip_option, into))]
    access_key: Option<String>,

    /// Secret access key.
    #[builder(default, setter(strip_option, into))]
    secret_key: Option<String>,

    /// Bucket holding the `snapshots/` prefix.
    #[builder(default, setter(strip_option, into))]
    bucket: Option<String>,

    /// Number of files transferred in parallel.
    #[builder(default = DEFAULT_TRANSFER_CONCURRENCY)]
    concurrency: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DroidConfig {
    /// Loads the configuration from the environment, reading a `.env` file first if present.
    pub fn from_env() -> DroidcoreResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to load .env file");
            }
        }

        let cvd_home = env_var("CVD_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| DEFAULT_CVD_HOME.clone());
        let cvd_path = env_var("CVD_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| cvd_home.join("bin/cvd"));

        let config = Self {
            instances_path: env_path("CVD_INSTANCES_PATH", &DEFAULT_INSTANCES_PATH),
            artifacts_path: env_path("CVD_ARTIFACTS_PATH", &DEFAULT_ARTIFACTS_PATH),
            cvd_home,
            cvd_path,
            adb_path: env_var("ADB_PATH").unwrap_or_else(|| DEFAULT_ADB_PATH.to_string()),
            host_tools_path: env_path("CVD_HOST_TOOLS_PATH", &DEFAULT_HOST_TOOLS_PATH),
            default_cpus: env_parse("CVD_DEFAULT_CPUS", DEFAULT_CPUS)?,
            default_memory_mb: env_parse("CVD_DEFAULT_MEMORY_MB", DEFAULT_MEMORY_MB)?,
            default_disk_gb: env_parse("CVD_DEFAULT_DISK_GB", DEFAULT_DISK_GB)?,
            base_instance: env_parse("CVD_BASE_INSTANCE", DEFAULT_BASE_INSTANCE)?,
            max_instances: env_parse("CVD_MAX_INSTANCES", DEFAULT_MAX_INSTANCES)?,
            adb_base_port: env_parse("CVD_ADB_BASE_PORT", DEFAULT_ADB_BASE_PORT)?,
            webrtc_base_port: env_parse("CVD_WEBRTC_BASE_PORT", DEFAULT_WEBRTC_BASE_PORT)?,
            ssh_host: env_var("CVD_SSH_HOST"),
            ssh_key_path: env_var("CVD_SSH_KEY_PATH").map(PathBuf::from),
            health_interval: Duration::from_secs(env_parse(
                "CVD_HEALTH_INTERVAL_SECS",
                DEFAULT_HEALTH_INTERVAL.as_secs(),
            )?),
            health_max_retries: env_parse("CVD_HEALTH_MAX_RETRIES", DEFAULT_HEALTH_MAX_RETRIES)?,
            adb_ready_timeout: Duration::from_secs(env_parse(
                "CVD_ADB_TIMEOUT_SECS",
                DEFAULT_ADB_READY_TIMEOUT.as_secs(),
            )?),
            adb_poll_interval: DEFAULT_ADB_POLL_INTERVAL,
            api_url: env_var("DAYTONA_API_URL"),
            api_key: env_var("DAYTONA_API_KEY"),
            s3: S3Config {
                endpoint: env_var("S3_ENDPOINT"),
                region: env_var("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                access_key: env_var("S3_ACCESS_KEY"),
                secret_key: env_var("S3_SECRET_KEY"),
                bucket: env_var("S3_BUCKET"),
                concurrency: env_parse("S3_TRANSFER_CONCURRENCY", DEFAULT_TRANSFER_CONCURRENCY)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks that the instance pool and its derived ports are usable.
    pub fn validate(&self) -> DroidcoreResult<()> {
        if self.base_instance == 0 {
            return Err(DroidcoreError::InvalidConfig(
                "CVD_BASE_INSTANCE".to_string(),
                "instance numbers start at 1".to_string(),
            ));
        }

        if self.max_instances == 0 {
            return Err(DroidcoreError::InvalidConfig(
                "CVD_MAX_INSTANCES".to_string(),
                "the pool must hold at least one instance".to_string(),
            ));
        }

        let last = self.base_instance + self.max_instances - 1;
        for (name, base) in [
            ("CVD_ADB_BASE_PORT", self.adb_base_port),
            ("CVD_WEBRTC_BASE_PORT", self.webrtc_base_port),
        ] {
            if u32::from(base) + last - 1 > u32::from(u16::MAX) {
                return Err(DroidcoreError::InvalidConfig(
                    name.to_string(),
                    format!("port range overflows for instance {last}"),
                ));
            }
        }

        if self.s3.concurrency == 0 {
            return Err(DroidcoreError::InvalidConfig(
                "S3_TRANSFER_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether the device host is reached over ssh.
    pub fn is_remote(&self) -> bool {
        self.ssh_host.as_deref().is_some_and(|host| !host.is_empty())
    }

    /// The ADB port of an instance: `base + (number - 1)`.
    pub fn adb_port(&self, instance_num: u32) -> u16 {
        offset_port(self.adb_base_port, instance_num)
    }

    /// The WebRTC streaming port of an instance: `base + (number - 1)`.
    pub fn webrtc_port(&self, instance_num: u32) -> u16 {
        offset_port(self.webrtc_base_port, instance_num)
    }

    /// The ADB network serial of an instance.
    pub fn adb_serial(&self, instance_num: u32) -> String {
        format!("0.0.0.0:{}", self.adb_port(instance_num))
    }

    /// The working directory of a sandbox.
    pub fn instance_dir(&self, sandbox_id: &str) -> PathBuf {
        self.instances_path.join(sandbox_id)
    }

    /// The persisted sandbox to instance number mapping.
    pub fn mappings_file(&self) -> PathBuf {
        self.instances_path.join(MAPPINGS_FILENAME)
    }

    /// The toolchain's runtime directory for an instance number.
    pub fn runtime_dir(&self, instance_num: u32) -> PathBuf {
        self.cvd_home
            .join("cuttlefish")
            .join("instances")
            .join(format!("cvd-{instance_num}"))
    }

    /// Root of the custom snapshot store.
    pub fn snapshots_root(&self) -> PathBuf {
        self.artifacts_path.join("snapshots")
    }

    /// The last instance number of the pool (exclusive).
    pub fn instance_range_end(&self) -> u32 {
        self.base_instance + self.max_instances
    }
}

impl S3Config {
    /// Whether a bucket and credentials are all present.
    pub fn is_configured(&self) -> bool {
        self.bucket.is_some() && self.access_key.is_some() && self.secret_key.is_some()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_path(name: &str, default: &Path) -> PathBuf {
    env_var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|| default.to_path_buf())
}

fn env_parse<T>(name: &str, default: T) -> DroidcoreResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env_var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| DroidcoreError::InvalidConfig(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn offset_port(base: u16, instance_num: u32) -> u16 {
    let offset = u16::try_from(instance_num.saturating_sub(1)).unwrap_or(u16::MAX);
    base.saturating_add(offset)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for S3Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
