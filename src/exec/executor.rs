//! One run from validated config to verdict

use crate::config::types::{
    CgroupEvidence, EvidenceBundle, ExecutionConfig, LimitSnapshot, Result, RunnerError,
};
use crate::core::supervisor;
use crate::core::types::{SupervisedRun, WatchdogEvent};
use crate::kernel::cgroup::{create_cgroup_backend, CgroupBackend, CgroupLease};
use crate::kernel::mount::MountPlan;
use crate::kernel::namespace::{check_isolation_capability, IsolationCapabilities};
use crate::kernel::signal::SignalHandler;
use crate::verdict::{classify, ExecutionReport, Verdict};

/// Result of a completed run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub verdict: Verdict,
    pub evidence: EvidenceBundle,
    pub report: ExecutionReport,
}

/// Process executor: owns the per-run resources of exactly one run
pub struct ProcessExecutor {
    run_id: String,
    config: ExecutionConfig,
    plan: MountPlan,
    cgroup: Option<CgroupLease>,
    signals: Option<SignalHandler>,
}

impl ProcessExecutor {
    /// Gate on host capabilities, then create the run's cgroup.
    /// Nothing is created when the gate refuses.
    pub fn new(config: ExecutionConfig, caps: &IsolationCapabilities) -> Result<Self> {
        check_isolation_capability(&config, caps)?;

        let plan = MountPlan::build(&config.rootfs, &config.mounts)?;
        let run_id = format!("runbox-{}", uuid::Uuid::new_v4().simple());

        let cgroup = match caps.cgroup_backend {
            Some(_) => Self::create_cgroup(&config, &run_id)?,
            None => {
                if config.limits.user_time_ms.is_some() {
                    log::warn!(
                        "No cgroup hierarchy; user time is only checked after the run ends"
                    );
                }
                None
            }
        };

        Ok(Self {
            run_id,
            config,
            plan,
            cgroup,
            signals: None,
        })
    }

    fn create_cgroup(config: &ExecutionConfig, run_id: &str) -> Result<Option<CgroupLease>> {
        let backend = match create_cgroup_backend(config.cgroup_parent.as_deref(), run_id) {
            Ok(backend) => backend,
            Err(e) if config.limits.cgroup.is_empty() => {
                log::warn!("Running without a cgroup: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let lease = CgroupLease::new(backend);
        lease.backend().apply_limits(&config.limits.cgroup)?;
        log::debug!(
            "Run cgroup {} ({})",
            lease.backend().path().display(),
            lease.backend().backend_name()
        );
        Ok(Some(lease))
    }

    /// Let SIGINT/SIGTERM on the runner abort the run
    pub fn with_signal_handler(mut self, signals: SignalHandler) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Launch, supervise, collect evidence and classify
    pub fn execute(self) -> Result<RunOutcome> {
        log::info!("[{}] starting {:?}", self.run_id, self.config.command);

        let backend = self.cgroup.as_ref().map(CgroupLease::backend);
        let run = supervisor::launch(&self.run_id, &self.config, &self.plan, backend, self.signals)?;

        if let Some(WatchdogEvent::Cancelled(sig)) = run.event {
            log::warn!("[{}] cancelled by signal {}", self.run_id, sig);
            return Err(RunnerError::Cancelled(sig));
        }
        if let Some(error) = run.proxy_status.as_ref().and_then(|s| s.internal_error.clone()) {
            return Err(RunnerError::Process(error));
        }

        let cgroup_evidence = backend.and_then(|backend| match backend.collect_evidence() {
            Ok(evidence) => Some(evidence),
            Err(e) => {
                log::warn!("[{}] cgroup evidence unavailable: {}", self.run_id, e);
                None
            }
        });

        if let Some(lease) = &self.cgroup {
            if let Err(e) = lease.release() {
                log::warn!("[{}] cgroup cleanup failed: {}", self.run_id, e);
            }
        }
        require_status_or_oom(&run, cgroup_evidence.as_ref())?;

        let evidence = build_evidence(&run, cgroup_evidence);
        let verdict = classify(&evidence, &LimitSnapshot::from_limits(&self.config.limits));
        log::info!(
            "[{}] verdict {} ({:?}) in {}ms",
            self.run_id,
            verdict.status,
            verdict.cause,
            evidence.wall_time_ms
        );

        let report = ExecutionReport::new(&verdict, &evidence);
        Ok(RunOutcome {
            verdict,
            evidence,
            report,
        })
    }
}

/// A run without a status from init is only judged when the watchdog or
/// the OOM killer explains the missing status.
fn require_status_or_oom(run: &SupervisedRun, cgroup: Option<&CgroupEvidence>) -> Result<()> {
    let explained = run.proxy_status.is_some()
        || run.event.is_some()
        || cgroup.is_some_and(|c| c.oom_kill_events > 0);
    if explained {
        return Ok(());
    }
    Err(RunnerError::Process(format!(
        "init process ended ({:?}) without a status or OOM evidence",
        run.init_outcome
    )))
}

/// Merge supervisor observations with cgroup counters.
/// cgroup counters cover every process of the run and win over rusage.
pub fn build_evidence(run: &SupervisedRun, cgroup: Option<CgroupEvidence>) -> EvidenceBundle {
    let status = run.proxy_status.as_ref();

    let cpu_user_ms = cgroup
        .and_then(|c| c.cpu_user_usec)
        .map(|usec| usec / 1000)
        .or_else(|| status.map(|s| s.cpu_user_ms))
        .unwrap_or(0);
    let cpu_kernel_ms = cgroup
        .and_then(|c| c.cpu_system_usec)
        .map(|usec| usec / 1000)
        .or_else(|| status.map(|s| s.cpu_kernel_ms))
        .unwrap_or(0);
    let memory_peak_bytes = cgroup
        .and_then(|c| c.memory_peak)
        .or_else(|| status.map(|s| s.max_rss_kib.saturating_mul(1024)))
        .unwrap_or(0);
    let wall_time_ms = status
        .filter(|_| run.event.is_none())
        .map(|s| s.wall_time_ms)
        .unwrap_or(run.wall_time_ms);

    EvidenceBundle {
        wait_outcome: run.payload_outcome(),
        breach: run.breach(),
        cgroup,
        output_overflow: run.output_overflow,
        wall_time_ms,
        cpu_user_ms,
        cpu_kernel_ms,
        memory_peak_bytes,
    }
}
