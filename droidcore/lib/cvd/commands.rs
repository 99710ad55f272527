use std::path::{Path, PathBuf};

use droidutils::quote_arg;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Renders `cvd` invocations for one toolchain installation.
#[derive(Debug, Clone)]
pub struct CvdCommands {
    /// Path to the `cvd` binary
    cvd_path: PathBuf,

    /// The toolchain home, exported as `HOME` for every invocation
    cvd_home: PathBuf,
}

/// Everything `cvd create` needs to boot one instance.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// The instance number to boot
    pub instance_num: u32,

    /// vCPUs
    pub cpus: u32,

    /// RAM in MiB
    pub memory_mb: u32,

    /// Host tools directory; `cvd` appends `bin/` to it
    pub host_path: PathBuf,

    /// Where the images come from
    pub image: LaunchImage,
}

/// The image source of a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchImage {
    /// The toolchain's default image path. Fails unless images were fetched beforehand.
    Default,

    /// A base system image directory.
    Base {
        /// Directory holding `super.img` or `system.img`
        product_path: PathBuf,
    },

    /// A captured device state to restore.
    Restore {
        /// The custom snapshot directory
        snapshot_dir: PathBuf,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CvdCommands {
    /// Creates a renderer for the given binary and home.
    pub fn new(cvd_path: impl Into<PathBuf>, cvd_home: impl Into<PathBuf>) -> Self {
        Self {
            cvd_path: cvd_path.into(),
            cvd_home: cvd_home.into(),
        }
    }

    /// `HOME=<home> <cvd>`
    fn cvd(&self) -> String {
        format!("HOME={} {}", quote_path(&self.cvd_home), quote_path(&self.cvd_path))
    }

    /// The `cvd create` line for a launch.
    pub fn create(&self, spec: &LaunchSpec) -> String {
        let (working_dir, image_flags) = match &spec.image {
            LaunchImage::Default => (
                self.cvd_home.clone(),
                "--data_policy=create_if_missing".to_string(),
            ),
            LaunchImage::Base { product_path } => (
                product_path.clone(),
                format!(
                    "--product_path={} --data_policy=create_if_missing",
                    quote_path(product_path)
                ),
            ),
            LaunchImage::Restore { snapshot_dir } => (
                snapshot_dir.clone(),
                format!(
                    "--snapshot_path={}",
                    quote_path(&snapshot_dir.join("snapshot"))
                ),
            ),
        };

        format!(
            "cd {} && {} create --host_path={} --instance_nums={} --cpus={} --memory_mb={} \
             --report_anonymous_usage_stats=n --start_webrtc=true {} 2>&1",
            quote_path(&working_dir),
            self.cvd(),
            quote_path(&spec.host_path),
            spec.instance_num,
            spec.cpus,
            spec.memory_mb,
            image_flags
        )
    }

    /// Starts an existing, stopped group.
    pub fn start_group(&self, instance_num: u32) -> String {
        format!(
            "{} -group_name {} start 2>&1",
            self.cvd(),
            group_name(instance_num)
        )
    }

    /// Stops a group.
    pub fn stop_group(&self, instance_num: u32) -> String {
        format!(
            "{} -group_name {} stop 2>&1",
            self.cvd(),
            group_name(instance_num)
        )
    }

    /// Lists the fleet, JSON first and plain text as a fallback.
    pub fn fleet(&self) -> String {
        format!("{0} fleet --json 2>&1 || {0} fleet 2>&1", self.cvd())
    }

    /// Captures the state of a running instance into `snapshot_path`.
    pub fn snapshot_take(&self, instance_num: u32, snapshot_path: &Path) -> String {
        format!(
            "cd {} && {} snapshot_take --instance_nums={} --snapshot_path={} --force 2>&1",
            quote_path(&self.cvd_home),
            self.cvd(),
            instance_num,
            quote_path(snapshot_path)
        )
    }

    /// Best-effort steps that wipe every trace of an instance number after a failed launch.
    ///
    /// Every step tolerates failure on its own.
    pub fn force_cleanup(&self, instance_num: u32) -> Vec<String> {
        let group = group_name(instance_num);
        vec![
            kill_instance_processes(instance_num),
            format!(
                "rm -rf /tmp/cf_avd_*/{n} /tmp/cf_env_*/{n} 2>/dev/null || true; \
                 find /var/tmp/cvd -type d -name '*cvd-{n}*' -exec rm -rf {{}} + 2>/dev/null || true",
                n = instance_num
            ),
            format!(
                "{cvd} -group_name {group} stop 2>/dev/null || true; \
                 {cvd} rm -group_name {group} 2>/dev/null || true",
                cvd = self.cvd()
            ),
            "rm -f /var/tmp/cvd/*/instance_database.binpb 2>/dev/null || true".to_string(),
            r#"for dir in /var/tmp/cvd/*/*/; do if [ -d "$dir" ] && ! pgrep -f "$dir" > /dev/null 2>&1; then rm -rf "$dir"; fi; done 2>/dev/null || true"#.to_string(),
        ]
    }

    /// Best-effort steps that remove an instance the toolchain knows but the registry does not.
    pub fn force_remove(&self, instance_num: u32) -> Vec<String> {
        vec![
            format!(
                "{} stop --instance_nums={} 2>&1 || true",
                self.cvd(),
                instance_num
            ),
            format!(
                "{} rm --group_name={} 2>&1 || true",
                self.cvd(),
                group_name(instance_num)
            ),
            kill_instance_processes(instance_num),
            format!(
                "rm -rf /tmp/cf_avd_*/{n} /tmp/cf_env_*/{n} 2>/dev/null || true",
                n = instance_num
            ),
        ]
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The toolchain group label of an instance number.
pub fn group_name(instance_num: u32) -> String {
    format!("cvd_{instance_num}")
}

/// Kills every process whose command line mentions the instance number.
///
/// Matching is by pattern and therefore best-effort. The bracketed characters keep the pattern
/// from matching the shell that runs it.
pub fn kill_instance_processes(instance_num: u32) -> String {
    format!(
        "pkill -9 -f '{}' 2>/dev/null || true",
        instance_process_pattern(instance_num)
    )
}

/// Prints `running` if a VM process for the instance exists, `stopped` otherwise.
pub fn vm_process_probe(instance_num: u32) -> String {
    format!(
        "pgrep -f 'cuttlefish.*instance_nums[= ]{instance_num}([^0-9]|$)' > /dev/null 2>&1 \
         && echo running || echo stopped"
    )
}

/// Removes sockets and environment directories that crash `run_cvd` when left behind.
pub fn clean_stale_sockets(instance_num: u32) -> String {
    format!("rm -rf /tmp/cf_avd_*/cvd-{instance_num} /tmp/cf_env_*/env-{instance_num} 2>/dev/null || true")
}

fn instance_process_pattern(n: u32) -> String {
    format!(
        "instance_nums[= ]{n}([^0-9]|$)|CUTTLEFISH_INSTANCE[=]{n}([^0-9]|$)|cvd[-]{n}([^0-9]|$)"
    )
}

fn quote_path(path: &Path) -> String {
    quote_arg(&path.to_string_lossy())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> CvdCommands {
        CvdCommands::new("/home/vsoc-01/bin/cvd", "/home/vsoc-01")
    }

    fn spec(image: LaunchImage) -> LaunchSpec {
        LaunchSpec {
            instance_num: 3,
            cpus: 4,
            memory_mb: 8192,
            host_path: PathBuf::from("/usr/lib/cuttlefish-common"),
            image,
        }
    }

    #[test]
    fn test_create_default_image() {
        let line = commands().create(&spec(LaunchImage::Default));
        assert_eq!(
            line,
            "cd /home/vsoc-01 && HOME=/home/vsoc-01 /home/vsoc-01/bin/cvd create \
             --host_path=/usr/lib/cuttlefish-common --instance_nums=3 --cpus=4 --memory_mb=8192 \
             --report_anonymous_usage_stats=n --start_webrtc=true \
             --data_policy=create_if_missing 2>&1"
        );
    }

    #[test]
    fn test_create_base_and_restore() {
        let base = commands().create(&spec(LaunchImage::Base {
            product_path: PathBuf::from("/home/vsoc-01/aosp_cf_x86_64_phone"),
        }));
        assert!(base.starts_with("cd /home/vsoc-01/aosp_cf_x86_64_phone && "));
        assert!(base.contains("--product_path=/home/vsoc-01/aosp_cf_x86_64_phone"));
        assert!(base.contains("--data_policy=create_if_missing"));

        let restore = commands().create(&spec(LaunchImage::Restore {
            snapshot_dir: PathBuf::from("/artifacts/snapshots/org/snap"),
        }));
        assert!(restore.contains("--snapshot_path=/artifacts/snapshots/org/snap/snapshot"));
        assert!(!restore.contains("--product_path"));
        assert!(!restore.contains("--data_policy"));
    }

    #[test]
    fn test_group_commands() {
        assert_eq!(group_name(7), "cvd_7");
        assert_eq!(
            commands().stop_group(7),
            "HOME=/home/vsoc-01 /home/vsoc-01/bin/cvd -group_name cvd_7 stop 2>&1"
        );
        assert_eq!(
            commands().fleet(),
            "HOME=/home/vsoc-01 /home/vsoc-01/bin/cvd fleet --json 2>&1 || \
             HOME=/home/vsoc-01 /home/vsoc-01/bin/cvd fleet 2>&1"
        );
        assert!(commands()
            .snapshot_take(2, Path::new("/a/b/snapshot"))
            .contains("snapshot_take --instance_nums=2 --snapshot_path=/a/b/snapshot --force"));
    }

    #[test]
    fn test_process_pattern_is_anchored() {
        let pattern = regex::Regex::new(&instance_process_pattern(1)).unwrap();
        assert!(pattern.is_match("run_cvd --instance_nums=1 --cpus=2"));
        assert!(pattern.is_match("/home/vsoc-01/cuttlefish/instances/cvd-1/kernel"));
        assert!(!pattern.is_match("run_cvd --instance_nums=12"));
        assert!(!pattern.is_match(&kill_instance_processes(1)));
    }
}
