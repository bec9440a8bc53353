//! Run report models

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

use crate::errors::HostError;

/// Result of a single deployment step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Step name
    pub name: String,

    /// Exit status; `None` when the step aborted before producing one
    pub exit_status: Option<i32>,

    /// Captured standard output
    pub stdout: String,

    /// Captured standard error
    pub stderr: String,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,

    /// Whether the step modified the host
    pub changed: bool,

    /// One-line description of what happened
    pub summary: String,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Final status of one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Recorded outcome of provisioning one host
#[derive(Debug, Clone, Serialize)]
pub struct HostOutcome {
    /// Host identifier as given in the input
    pub host: String,

    pub status: HostStatus,

    /// Step results in execution order
    pub steps: Vec<StepResult>,

    /// Name of the step that failed, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,

    /// Terminal error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HostError>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl HostOutcome {
    /// Outcome for a host that never got a connection attempt
    pub fn skipped(host: impl Into<String>, error: HostError) -> Self {
        let now = Utc::now();
        Self {
            host: host.into(),
            status: HostStatus::Skipped,
            steps: Vec::new(),
            failed_step: None,
            error: Some(error),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == HostStatus::Succeeded
    }

    /// Whether the host was skipped because the run was cancelled
    pub fn was_cancelled(&self) -> bool {
        matches!(self.error, Some(HostError::Cancelled))
    }

    /// Look up a step result by name
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Aggregate status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Aggregate result of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub repository: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// One outcome per input target, in input order
    pub hosts: Vec<HostOutcome>,

    pub status: RunStatus,

    /// Hosts whose outcome is not `succeeded`
    pub failed_hosts: Vec<String>,

    /// Whether cancellation cut the run short
    pub cancelled: bool,
}

impl RunReport {
    /// Assemble the final report from ordered host outcomes
    pub fn new(
        run_id: String,
        repository: String,
        started_at: DateTime<Utc>,
        hosts: Vec<HostOutcome>,
        cancelled: bool,
    ) -> Self {
        let failed_hosts: Vec<String> = hosts
            .iter()
            .filter(|h| !h.succeeded())
            .map(|h| h.host.clone())
            .collect();
        let status = if failed_hosts.is_empty() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        Self {
            run_id,
            repository,
            started_at,
            finished_at: Utc::now(),
            hosts,
            status,
            failed_hosts,
            cancelled,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Process exit code for the calling shell
    pub fn exit_code(&self) -> i32 {
        match (self.status, self.cancelled) {
            (RunStatus::Succeeded, _) => 0,
            (RunStatus::Failed, true) => 130,
            (RunStatus::Failed, false) => 1,
        }
    }

    /// Human readable summary, one line per host plus the failing step
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Run {} ({})\n",
            self.run_id.bold(),
            self.repository
        ));

        for host in &self.hosts {
            let status = match host.status {
                HostStatus::Succeeded => "succeeded".green(),
                HostStatus::Failed => "failed".red(),
                HostStatus::Skipped => "skipped".yellow(),
            };
            out.push_str(&format!("  {:<30} {}\n", host.host, status));

            for step in &host.steps {
                let marker = if step.succeeded() { "ok".green() } else { "FAIL".red() };
                out.push_str(&format!(
                    "    [{}] {:<14} {} ({} ms)\n",
                    marker, step.name, step.summary, step.duration_ms
                ));
            }
            if let Some(err) = &host.error {
                out.push_str(&format!("    error: {}\n", err.to_string().red()));
            }
        }

        let verdict = match self.status {
            RunStatus::Succeeded => "SUCCEEDED".green().bold(),
            RunStatus::Failed => "FAILED".red().bold(),
        };
        out.push_str(&format!("Result: {}", verdict));
        if !self.failed_hosts.is_empty() {
            out.push_str(&format!(" (retry: {})", self.failed_hosts.join(", ")));
        }
        out.push('\n');
        out
    }
}
