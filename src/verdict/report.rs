//! The JSON report written to stdout once per run.

use crate::config::types::{EvidenceBundle, ExecutionStatus, Result};
use crate::verdict::verdict::Verdict;
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub wall_time_ms: u64,
    pub cpu_user_time_ms: u64,
    pub cpu_kernel_time_ms: u64,
    pub memory_usage_kib: u64,
    pub is_oom: bool,
    pub is_wall_tle: bool,
    pub is_user_tle: bool,
    #[serde(default)]
    pub is_system_tle: bool,
}

impl ExecutionReport {
    pub fn new(verdict: &Verdict, evidence: &EvidenceBundle) -> Self {
        Self {
            status: verdict.status,
            exit_code: verdict.exit_code,
            signal: verdict.signal.clone(),
            wall_time_ms: evidence.wall_time_ms,
            cpu_user_time_ms: evidence.cpu_user_ms,
            cpu_kernel_time_ms: evidence.cpu_kernel_ms,
            memory_usage_kib: evidence.memory_peak_bytes / 1024,
            is_oom: verdict.is_oom,
            is_wall_tle: verdict.is_wall_tle,
            is_user_tle: verdict.is_user_tle,
            is_system_tle: verdict.is_system_tle,
        }
    }
}

/// Writes exactly one report document, newline terminated
pub struct ReportEmitter<W: Write> {
    out: W,
}

impl ReportEmitter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> ReportEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Consumes the emitter so a second report cannot be written
    pub fn emit(mut self, report: &ExecutionReport) -> Result<W> {
        serde_json::to_writer(&mut self.out, report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{LimitSnapshot, WaitOutcome};
    use crate::verdict::verdict::classify;

    fn bundle(outcome: WaitOutcome) -> EvidenceBundle {
        EvidenceBundle {
            wait_outcome: outcome,
            breach: None,
            cgroup: None,
            output_overflow: false,
            wall_time_ms: 42,
            cpu_user_ms: 30,
            cpu_kernel_ms: 2,
            memory_peak_bytes: 3 * 1024 * 1024 + 512,
        }
    }

    fn emit(report: &ExecutionReport) -> serde_json::Value {
        let bytes = ReportEmitter::new(Vec::new()).emit(report).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn normal_report_omits_signal() {
        let evidence = bundle(WaitOutcome::Exited(0));
        let verdict = classify(&evidence, &LimitSnapshot::default());
        let json = emit(&ExecutionReport::new(&verdict, &evidence));

        assert_eq!(json["status"], "NORMAL");
        assert_eq!(json["exit_code"], 0);
        assert!(json.get("signal").is_none());
        assert_eq!(json["wall_time_ms"], 42);
        assert_eq!(json["cpu_user_time_ms"], 30);
        assert_eq!(json["cpu_kernel_time_ms"], 2);
        assert_eq!(json["memory_usage_kib"], 3072);
        assert_eq!(json["is_oom"], false);
        assert_eq!(json["is_system_tle"], false);
    }

    #[test]
    fn signaled_report_names_the_signal() {
        let evidence = bundle(WaitOutcome::Signaled(libc::SIGFPE));
        let verdict = classify(&evidence, &LimitSnapshot::default());
        let json = emit(&ExecutionReport::new(&verdict, &evidence));

        assert_eq!(json["status"], "SIGNAL_TERMINATE");
        assert_eq!(json["signal"], "SIGFPE");
        assert_eq!(json["exit_code"], 128 + libc::SIGFPE);
    }

    #[test]
    fn report_parses_back() {
        let evidence = bundle(WaitOutcome::Exited(2));
        let verdict = classify(&evidence, &LimitSnapshot::default());
        let report = ExecutionReport::new(&verdict, &evidence);
        let bytes = ReportEmitter::new(Vec::new()).emit(&report).unwrap();
        let parsed: ExecutionReport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, report);
    }
}
