//! Resource usage of the device host.

use std::path::Path;

use droidutils::CommandGateway;
use serde::Serialize;
use sysinfo::{Disks, System};

use crate::DroidcoreResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Aggregate resource usage of the device host.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetrics {
    /// Number of logical CPUs
    pub cpu_count: u32,

    /// Used memory as a percentage of the total
    pub memory_usage_percent: f64,

    /// Total memory in GiB
    pub memory_total_gib: f64,

    /// Used space of the root filesystem as a percentage of its size
    pub disk_usage_percent: f64,

    /// Size of the root filesystem in GiB
    pub disk_total_gib: f64,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Collects the metrics of the host behind `gateway`.
///
/// A probe that fails is logged and leaves its fields at zero.
pub async fn collect_host_metrics(gateway: &dyn CommandGateway) -> DroidcoreResult<HostMetrics> {
    if !gateway.is_remote() {
        return Ok(tokio::task::spawn_blocking(local_metrics).await?);
    }

    let (cpus, memory, disk) = tokio::join!(
        gateway.run_script("nproc"),
        gateway.run_script("free -b | grep Mem"),
        gateway.run_script("df -B1 / | tail -1"),
    );

    let mut metrics = HostMetrics::default();
    match cpus {
        Ok(output) => metrics.cpu_count = output.trim().parse().unwrap_or_default(),
        Err(e) => tracing::warn!(error = %e, "failed to read cpu count"),
    }

    match memory.map(|output| parse_usage_line(&output)) {
        Ok(Some((total, used))) => {
            metrics.memory_total_gib = total as f64 / GIB;
            metrics.memory_usage_percent = percent(used, total);
        }
        Ok(None) => tracing::warn!("unexpected output from free"),
        Err(e) => tracing::warn!(error = %e, "failed to read memory usage"),
    }

    match disk.map(|output| parse_usage_line(&output)) {
        Ok(Some((total, used))) => {
            metrics.disk_total_gib = total as f64 / GIB;
            metrics.disk_usage_percent = percent(used, total);
        }
        Ok(None) => tracing::warn!("unexpected output from df"),
        Err(e) => tracing::warn!(error = %e, "failed to read disk usage"),
    }

    Ok(metrics)
}

fn local_metrics() -> HostMetrics {
    let system = System::new_all();
    let disks = Disks::new_with_refreshed_list();

    let mut metrics = HostMetrics {
        cpu_count: u32::try_from(system.cpus().len()).unwrap_or(u32::MAX),
        memory_total_gib: system.total_memory() as f64 / GIB,
        memory_usage_percent: percent(system.used_memory(), system.total_memory()),
        ..Default::default()
    };

    match disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
    {
        Some(root) => {
            let total = root.total_space();
            metrics.disk_total_gib = total as f64 / GIB;
            metrics.disk_usage_percent =
                percent(total.saturating_sub(root.available_space()), total);
        }
        None => tracing::warn!("root filesystem not found"),
    }

    metrics
}

/// Reads `total` and `used` from the second and third column of a `free -b` or `df -B1` line.
fn parse_usage_line(line: &str) -> Option<(u64, u64)> {
    let mut fields = line.split_whitespace().skip(1);
    let total = fields.next()?.parse().ok()?;
    let used = fields.next()?.parse().ok()?;
    Some((total, used))
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }

    used as f64 / total as f64 * 100.0
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::testing::ScriptedGateway;

    use super::*;

    #[test]
    fn test_parse_usage_line() {
        assert_eq!(
            parse_usage_line("Mem:   16777216000  4194304000  8000000000  1000  4000  12000"),
            Some((16_777_216_000, 4_194_304_000))
        );
        assert_eq!(
            parse_usage_line("/dev/sda1 1000000000000 250000000000 750000000000 25% /"),
            Some((1_000_000_000_000, 250_000_000_000))
        );
        assert_eq!(parse_usage_line("Mem:"), None);
        assert_eq!(percent(5, 0), 0.0);
    }

    #[test_log::test(tokio::test)]
    async fn test_remote_probe_failures_leave_zeroes() -> anyhow::Result<()> {
        let gateway = ScriptedGateway::new_remote(|command| match command {
            "nproc" => (0, "16\n".to_string()),
            "free -b | grep Mem" => (0, "Mem: 4294967296 1073741824 0 0 0 0\n".to_string()),
            _ => (1, "df: /: No such file or directory\n".to_string()),
        });

        let metrics = collect_host_metrics(gateway.as_ref()).await?;
        assert_eq!(metrics.cpu_count, 16);
        assert_eq!(metrics.memory_total_gib, 4.0);
        assert_eq!(metrics.memory_usage_percent, 25.0);
        assert_eq!(metrics.disk_total_gib, 0.0);
        assert_eq!(metrics.disk_usage_percent, 0.0);
        assert_eq!(gateway.history().len(), 3);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_local_metrics() -> anyhow::Result<()> {
        let metrics = collect_host_metrics(&droidutils::LocalGateway).await?;
        assert!(metrics.cpu_count >= 1);
        assert!(metrics.memory_total_gib > 0.0);
        assert!((0.0..=100.0).contains(&metrics.memory_usage_percent));
        Ok(())
    }
}
