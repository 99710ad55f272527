use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    cvd::FleetStatus,
    registry::{Instance, InstanceState, Registry},
};

use super::{
    classify, CrashReporter, FleetProbe, HealthHistory, SandboxHealth, ToolchainSignal, Verdict,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs one health check over every tracked sandbox.
pub struct HealthChecker {
    /// The sandboxes to check
    registry: Arc<Registry>,

    /// Liveness signals
    probe: Arc<dyn FleetProbe>,

    /// Receives confirmed crashes
    reporter: Arc<dyn CrashReporter>,

    /// Last state and failure count per sandbox
    history: HealthHistory,

    /// Consecutive failed checks before a crash is reported
    max_retries: u32,
}

/// Runs the [`HealthChecker`] on a fixed interval in a background task.
pub struct HealthMonitor {
    /// The checker run on every tick
    checker: Arc<HealthChecker>,

    /// Time between two checks
    interval: Duration,

    /// Stop signal and handle of the running loop
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HealthChecker {
    /// Creates a checker.
    pub fn new(
        registry: Arc<Registry>,
        probe: Arc<dyn FleetProbe>,
        reporter: Arc<dyn CrashReporter>,
        history: HealthHistory,
        max_retries: u32,
    ) -> Self {
        Self {
            registry,
            probe,
            reporter,
            history,
            max_retries: max_retries.max(1),
        }
    }

    /// The shared liveness history.
    pub fn history(&self) -> &HealthHistory {
        &self.history
    }

    /// Drops the tracked history of a sandbox, e.g. after it was destroyed.
    pub fn clear_sandbox(&self, sandbox_id: &str) {
        self.history.clear(sandbox_id);
    }

    /// Forgets past failures of a sandbox that was explicitly started.
    pub fn reset_sandbox_state(&self, sandbox_id: &str) {
        tracing::debug!(sandbox_id, "resetting health state");
        self.history.clear(sandbox_id);
    }

    /// Checks every tracked sandbox once. Never fails; problems are logged.
    pub async fn check_health(&self) {
        let instances = self.registry.list().await;
        if instances.is_empty() {
            return;
        }

        let statuses = match self.probe.fleet_status().await {
            Ok(statuses) => statuses,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read fleet status, probing devices directly");
                Default::default()
            }
        };

        join_all(instances.iter().map(|instance| {
            self.check_sandbox(instance, statuses.get(instance.get_instance_num()))
        }))
        .await;
    }

    async fn check_sandbox(&self, instance: &Instance, status: Option<&FleetStatus>) {
        let sandbox_id = instance.get_sandbox_id().as_str();
        let recorded = *instance.get_state();
        if matches!(recorded, InstanceState::Starting | InstanceState::Stopping) {
            self.history.clear(sandbox_id);
            return;
        }

        // A stopped sandbox is only revived by the toolchain itself listing it as running.
        if recorded == InstanceState::Stopped {
            let revived = matches!(status, Some(FleetStatus::Running))
                && self
                    .registry
                    .transition(sandbox_id, InstanceState::Stopped, InstanceState::Running)
                    .await;
            if revived {
                tracing::info!(sandbox_id, "toolchain reports stopped sandbox running again");
                self.history.set(
                    sandbox_id,
                    SandboxHealth {
                        last_state: InstanceState::Running,
                        failures: 0,
                    },
                );
            } else {
                self.history.clear(sandbox_id);
            }
            return;
        }

        let verdict = self.evaluate(instance, status).await;
        let previous = self.history.get(sandbox_id).unwrap_or(SandboxHealth {
            last_state: recorded,
            failures: 0,
        });

        match verdict {
            Verdict::Running { reset_failures } => {
                let failures = if reset_failures { 0 } else { previous.failures };
                self.history.set(
                    sandbox_id,
                    SandboxHealth {
                        last_state: InstanceState::Running,
                        failures,
                    },
                );
                if recorded == InstanceState::Unknown {
                    self.registry
                        .transition(sandbox_id, InstanceState::Unknown, InstanceState::Running)
                        .await;
                }
            }
            Verdict::Stopped if previous.last_state == InstanceState::Running => {
                let failures = previous.failures + 1;
                if failures < self.max_retries {
                    tracing::warn!(sandbox_id, failures, max = self.max_retries, "sandbox looks stopped");
                    self.history.set(
                        sandbox_id,
                        SandboxHealth {
                            last_state: InstanceState::Running,
                            failures,
                        },
                    );
                    return;
                }

                self.confirm_crash(instance, recorded, status, failures).await;
            }
            Verdict::Stopped => {
                self.history.set(
                    sandbox_id,
                    SandboxHealth {
                        last_state: InstanceState::Stopped,
                        failures: 0,
                    },
                );
                if recorded == InstanceState::Unknown {
                    self.registry
                        .transition(sandbox_id, InstanceState::Unknown, InstanceState::Stopped)
                        .await;
                }
            }
        }
    }

    async fn evaluate(&self, instance: &Instance, status: Option<&FleetStatus>) -> Verdict {
        let signal = ToolchainSignal::from(status);
        if !signal.is_ambiguous() {
            return classify(signal, None, None);
        }

        if self.probe.device_responds(instance).await {
            tracing::debug!(sandbox_id = %instance.get_sandbox_id(), ?status, "toolchain status ambiguous but device responds");
            return classify(signal, Some(true), None);
        }

        let process = self.probe.vm_process_alive(*instance.get_instance_num()).await;
        classify(signal, Some(false), Some(process))
    }

    async fn confirm_crash(
        &self,
        instance: &Instance,
        recorded: InstanceState,
        status: Option<&FleetStatus>,
        failures: u32,
    ) {
        let sandbox_id = instance.get_sandbox_id().as_str();
        let status = match status {
            Some(FleetStatus::Running) => "Running".to_string(),
            Some(FleetStatus::Stopped) => "Stopped".to_string(),
            Some(FleetStatus::Other(other)) if !other.is_empty() => other.clone(),
            _ => "not listed".to_string(),
        };
        let reason = format!(
            "Android instance {} stopped unexpectedly (toolchain status: {status}, device not responding, no VM process)",
            instance.get_instance_num()
        );

        tracing::error!(sandbox_id, failures, %reason, "sandbox crashed");
        match self.reporter.report_crash(sandbox_id, &reason).await {
            Ok(()) => {
                self.history.set(
                    sandbox_id,
                    SandboxHealth {
                        last_state: InstanceState::Stopped,
                        failures: 0,
                    },
                );
                self.registry
                    .transition(sandbox_id, recorded, InstanceState::Stopped)
                    .await;
            }
            Err(e) => {
                tracing::warn!(sandbox_id, error = %e, "failed to report crash, retrying on next check");
                self.history.set(
                    sandbox_id,
                    SandboxHealth {
                        last_state: InstanceState::Running,
                        failures,
                    },
                );
            }
        }
    }
}

impl HealthMonitor {
    /// Creates a monitor checking every `interval`.
    pub fn new(checker: HealthChecker, interval: Duration) -> Self {
        Self {
            checker: Arc::new(checker),
            interval,
            task: Mutex::new(None),
        }
    }

    /// The checker run on every tick.
    pub fn checker(&self) -> &HealthChecker {
        &self.checker
    }

    /// Starts the background loop, which checks immediately and then on every tick.
    ///
    /// Does nothing if the loop is already running.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let checker = self.checker.clone();
        let interval = self.interval;
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = checker.check_health() => {}
                        }
                    }
                }
            }

            tracing::info!("health monitor stopped");
        });

        tracing::info!(interval = ?self.interval, "health monitor started");
        *task = Some((token, handle));
    }

    /// Stops the loop, waits for it to exit and drops all history.
    pub async fn stop(&self) {
        let running = self.task.lock().await.take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "health monitor task failed");
            }
        }

        self.checker.history.clear_all();
    }

    /// Whether the loop is running.
    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, HashMap},
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex as StdMutex,
        },
    };

    use async_trait::async_trait;
    use droidutils::LocalGateway;

    use crate::{config::DroidConfig, DroidcoreError, DroidcoreResult};

    use super::*;

    #[derive(Default)]
    struct FakeProbe {
        statuses: StdMutex<BTreeMap<u32, FleetStatus>>,
        device: AtomicBool,
        process: AtomicBool,
        device_calls: AtomicUsize,
        process_calls: AtomicUsize,
    }

    #[async_trait]
    impl FleetProbe for FakeProbe {
        async fn fleet_status(&self) -> DroidcoreResult<BTreeMap<u32, FleetStatus>> {
            Ok(self.statuses.lock().unwrap().clone())
        }

        async fn device_responds(&self, _instance: &Instance) -> bool {
            self.device_calls.fetch_add(1, Ordering::SeqCst);
            self.device.load(Ordering::SeqCst)
        }

        async fn vm_process_alive(&self, _instance_num: u32) -> bool {
            self.process_calls.fetch_add(1, Ordering::SeqCst);
            self.process.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        reports: StdMutex<Vec<String>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl CrashReporter for RecordingReporter {
        async fn report_crash(&self, sandbox_id: &str, _reason: &str) -> DroidcoreResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DroidcoreError::custom(anyhow::anyhow!("control plane down")));
            }
            self.reports.lock().unwrap().push(sandbox_id.to_string());
            Ok(())
        }
    }

    struct Fixture {
        probe: Arc<FakeProbe>,
        reporter: Arc<RecordingReporter>,
        registry: Arc<Registry>,
        checker: HealthChecker,
    }

    async fn fixture(state: InstanceState) -> Fixture {
        let registry = Arc::new(Registry::new(
            Arc::new(LocalGateway),
            DroidConfig::builder().build(),
        ));
        registry
            .register(
                Instance::builder()
                    .sandbox_id("sb-1")
                    .instance_num(1)
                    .state(state)
                    .cpus(2)
                    .memory_mb(4096)
                    .disk_gb(20)
                    .adb_port(6520)
                    .adb_serial("0.0.0.0:6520")
                    .webrtc_port(8443)
                    .runtime_dir("/tmp/cvd-1")
                    .metadata(HashMap::new())
                    .build(),
            )
            .await;

        let probe = Arc::new(FakeProbe::default());
        let reporter = Arc::new(RecordingReporter::default());
        let checker = HealthChecker::new(
            registry.clone(),
            probe.clone(),
            reporter.clone(),
            HealthHistory::new(),
            2,
        );

        Fixture {
            probe,
            reporter,
            registry,
            checker,
        }
    }

    fn set_status(probe: &FakeProbe, status: FleetStatus) {
        probe.statuses.lock().unwrap().insert(1, status);
    }

    #[test_log::test(tokio::test)]
    async fn test_cancelled_status_with_responsive_device_is_running() {
        let f = fixture(InstanceState::Running).await;
        set_status(&f.probe, FleetStatus::Other("Cancelled".to_string()));
        f.probe.device.store(true, Ordering::SeqCst);

        f.checker.check_health().await;
        f.checker.check_health().await;

        let health = f.checker.history().get("sb-1").unwrap();
        assert_eq!(health.last_state, InstanceState::Running);
        assert_eq!(health.failures, 0);
        assert_eq!(f.probe.process_calls.load(Ordering::SeqCst), 0);
        assert!(f.reporter.reports.lock().unwrap().is_empty());

        f.checker.clear_sandbox("sb-1");
        assert!(f.checker.history().get("sb-1").is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_trusted_running_status_skips_probes() {
        let f = fixture(InstanceState::Running).await;
        set_status(&f.probe, FleetStatus::Running);

        f.checker.check_health().await;
        assert_eq!(f.probe.device_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.probe.process_calls.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_crash_reported_once_after_max_retries() {
        let f = fixture(InstanceState::Running).await;

        f.checker.check_health().await;
        assert!(f.reporter.reports.lock().unwrap().is_empty());
        assert_eq!(f.checker.history().get("sb-1").unwrap().failures, 1);

        f.checker.check_health().await;
        assert_eq!(*f.reporter.reports.lock().unwrap(), vec!["sb-1".to_string()]);
        let health = f.checker.history().get("sb-1").unwrap();
        assert_eq!(health.failures, 0);
        assert_eq!(health.last_state, InstanceState::Stopped);
        assert_eq!(
            *f.registry.get("sb-1").await.unwrap().get_state(),
            InstanceState::Stopped
        );

        f.checker.check_health().await;
        f.checker.check_health().await;
        assert_eq!(f.reporter.reports.lock().unwrap().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_process_alone_keeps_failure_count() {
        let f = fixture(InstanceState::Running).await;

        f.checker.check_health().await;
        assert_eq!(f.checker.history().get("sb-1").unwrap().failures, 1);

        f.probe.process.store(true, Ordering::SeqCst);
        f.checker.check_health().await;
        let health = f.checker.history().get("sb-1").unwrap();
        assert_eq!(health.last_state, InstanceState::Running);
        assert_eq!(health.failures, 1);

        set_status(&f.probe, FleetStatus::Running);
        f.checker.check_health().await;
        assert_eq!(f.checker.history().get("sb-1").unwrap().failures, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_report_is_retried() {
        let f = fixture(InstanceState::Running).await;
        f.reporter.fail.store(true, Ordering::SeqCst);

        f.checker.check_health().await;
        f.checker.check_health().await;
        assert_eq!(
            *f.registry.get("sb-1").await.unwrap().get_state(),
            InstanceState::Running
        );

        f.reporter.fail.store(false, Ordering::SeqCst);
        f.checker.check_health().await;
        assert_eq!(f.reporter.reports.lock().unwrap().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_state_is_resolved_without_report() {
        let f = fixture(InstanceState::Unknown).await;
        f.checker.check_health().await;
        assert_eq!(
            *f.registry.get("sb-1").await.unwrap().get_state(),
            InstanceState::Stopped
        );
        assert!(f.reporter.reports.lock().unwrap().is_empty());

        let f = fixture(InstanceState::Unknown).await;
        set_status(&f.probe, FleetStatus::Running);
        f.checker.check_health().await;
        assert_eq!(
            *f.registry.get("sb-1").await.unwrap().get_state(),
            InstanceState::Running
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_stopped_sandbox_revived_only_by_toolchain() {
        let f = fixture(InstanceState::Stopped).await;
        f.probe.device.store(true, Ordering::SeqCst);
        f.probe.process.store(true, Ordering::SeqCst);

        f.checker.check_health().await;
        assert_eq!(
            *f.registry.get("sb-1").await.unwrap().get_state(),
            InstanceState::Stopped
        );
        assert!(f.checker.history().get("sb-1").is_none());
        assert_eq!(f.probe.device_calls.load(Ordering::SeqCst), 0);

        set_status(&f.probe, FleetStatus::Running);
        f.checker.check_health().await;
        assert_eq!(
            *f.registry.get("sb-1").await.unwrap().get_state(),
            InstanceState::Running
        );
        let health = f.checker.history().get("sb-1").unwrap();
        assert_eq!(health.last_state, InstanceState::Running);
        assert_eq!(health.failures, 0);
        assert!(f.reporter.reports.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_monitor_start_and_stop() {
        let f = fixture(InstanceState::Running).await;
        set_status(&f.probe, FleetStatus::Running);
        let monitor = HealthMonitor::new(f.checker, Duration::from_secs(3600));

        monitor.start().await;
        assert!(monitor.is_running().await);

        for _ in 0..50 {
            if monitor.checker().history().get("sb-1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(monitor.checker().history().get("sb-1").is_some());

        monitor.stop().await;
        assert!(!monitor.is_running().await);
        assert!(monitor.checker().history().is_empty());
    }
}
