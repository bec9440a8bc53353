//! Ordered deployment procedure run over one connection

use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::{info, warn};

use crate::deploy::service::ServiceSettings;
use crate::deploy::steps::{
    default_baseline, BaselineStep, BaselineTool, ConfigureStep, DependenciesStep, ServiceStep,
    SyncStep,
};
use crate::errors::{HostError, StepError};
use crate::models::report::StepResult;
use crate::models::repository::RepositoryRef;
use crate::ssh::connection::Connection;
use crate::ssh::session::CommandOutput;
use crate::utils::{shell_quote, shell_quote_path};

/// Container registry login used before pulling images
#[derive(Debug)]
pub struct RegistryLogin {
    /// Registry host; Docker Hub when unset
    pub server: Option<String>,
    pub username: String,
    pub password: SecretString,
}

/// Settings shared by every host's procedure run
#[derive(Debug)]
pub struct ProcedureSettings {
    /// Tools that must be present before anything else runs
    pub baseline: Vec<BaselineTool>,

    pub service: ServiceSettings,

    pub registry: Option<RegistryLogin>,

    /// Remote directory for provisioning stamps, relative to the login directory
    pub state_dir: String,
}

impl Default for ProcedureSettings {
    fn default() -> Self {
        let service = ServiceSettings::default();
        Self {
            baseline: default_baseline(&service.runtime),
            service,
            registry: None,
            state_dir: ".vmprov".to_string(),
        }
    }
}

/// Facts gathered by earlier steps for later ones
#[derive(Debug, Default)]
pub struct DeployState {
    /// Absolute checkout path, known once the sync step ran
    pub checkout: Option<String>,

    /// Checked-out commit
    pub commit: Option<String>,

    /// Names of steps that modified the host
    pub changed_steps: Vec<&'static str>,
}

impl DeployState {
    /// Whether anything the running service depends on changed
    pub fn needs_restart(&self) -> bool {
        !self.changed_steps.is_empty()
    }
}

/// Context handed to each step
pub struct StepContext<'a> {
    pub repo: &'a RepositoryRef,
    pub settings: &'a ProcedureSettings,

    /// Login user on the remote host
    pub user: &'a str,

    /// Per-command timeout
    pub timeout: Duration,

    pub state: DeployState,
}

impl StepContext<'_> {
    /// Shell-quoted checkout directory
    pub fn checkout_dir(&self) -> String {
        match &self.state.checkout {
            Some(path) => shell_quote(path),
            None => shell_quote_path(self.repo.install_path()),
        }
    }

    /// Unit name of the deployed service
    pub fn unit_name(&self) -> String {
        self.settings.service.unit_name(self.repo.name())
    }

    /// Shell-quoted remote directory for this service's stamps
    pub fn stamp_dir(&self) -> String {
        let dir = format!(
            "{}/{}",
            self.settings.state_dir.trim_end_matches('/'),
            self.unit_name()
        );
        if dir.starts_with('/') || dir.starts_with("~/") {
            shell_quote_path(&dir)
        } else {
            format!("\"$HOME\"/{}", shell_quote(&dir))
        }
    }
}

/// What a step did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    pub changed: bool,
    pub summary: String,
}

impl StepReport {
    /// Desired state already present, nothing done
    pub fn unchanged(summary: impl Into<String>) -> Self {
        Self {
            exit_status: 0,
            stdout: String::new(),
            stderr: String::new(),
            changed: false,
            summary: summary.into(),
        }
    }

    /// Host modified successfully
    pub fn changed(summary: impl Into<String>) -> Self {
        Self {
            changed: true,
            ..Self::unchanged(summary)
        }
    }

    /// Report carrying a command's exit status and output
    pub fn from_output(output: CommandOutput, changed: bool, summary: impl Into<String>) -> Self {
        Self {
            exit_status: output.exit_status,
            stdout: output.stdout,
            stderr: output.stderr,
            changed,
            summary: summary.into(),
        }
    }

    /// Append a command's output to this report
    pub fn absorb(&mut self, output: &CommandOutput) {
        self.stdout.push_str(&output.stdout);
        self.stderr.push_str(&output.stderr);
    }
}

/// One idempotent unit of the deployment procedure
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bring the host to this step's desired state, detecting first whether
    /// it is already there. A non-zero `exit_status` halts the procedure.
    async fn apply(
        &self,
        conn: &mut Connection,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepReport, StepError>;
}

/// The ordered list of steps run against each host
pub struct DeploymentProcedure {
    steps: Vec<Box<dyn Step>>,
    settings: ProcedureSettings,
}

impl DeploymentProcedure {
    /// Baseline, sync, dependencies, configure, service
    pub fn standard(settings: ProcedureSettings) -> Self {
        Self::with_steps(
            settings,
            vec![
                Box::new(BaselineStep),
                Box::new(SyncStep),
                Box::new(DependenciesStep),
                Box::new(ConfigureStep),
                Box::new(ServiceStep),
            ],
        )
    }

    pub fn with_steps(settings: ProcedureSettings, steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps, settings }
    }

    pub fn settings(&self) -> &ProcedureSettings {
        &self.settings
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, halting at the first failure.
    ///
    /// Results are pushed to `results` as each step finishes, so a caller that
    /// drops this future still holds the completed steps.
    pub async fn run(
        &self,
        conn: &mut Connection,
        repo: &RepositoryRef,
        user: &str,
        results: &mut Vec<StepResult>,
    ) -> Result<(), HostError> {
        let mut ctx = StepContext {
            repo,
            settings: &self.settings,
            user,
            timeout: conn.command_timeout(),
            state: DeployState::default(),
        };

        for step in &self.steps {
            let name = step.name();
            info!(host = %conn.host(), step = name, "Running step");
            let start = Instant::now();
            let outcome = step.apply(conn, &mut ctx).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match outcome {
                Ok(report) => {
                    let exit_status = report.exit_status;
                    if report.changed && exit_status == 0 {
                        ctx.state.changed_steps.push(name);
                    }
                    results.push(StepResult {
                        name: name.to_string(),
                        exit_status: Some(exit_status),
                        stdout: report.stdout,
                        stderr: report.stderr,
                        duration_ms,
                        changed: report.changed,
                        summary: report.summary.clone(),
                    });

                    if exit_status != 0 {
                        warn!(
                            host = %conn.host(),
                            step = name,
                            exit_status,
                            "Step failed: {}",
                            report.summary
                        );
                        return Err(HostError::StepFailed {
                            step: name.to_string(),
                            exit_status,
                        });
                    }
                    info!(host = %conn.host(), step = name, changed = report.changed, "{}", report.summary);
                }
                Err(err) => {
                    warn!(host = %conn.host(), step = name, "Step aborted: {}", err);
                    results.push(StepResult {
                        name: name.to_string(),
                        exit_status: None,
                        stdout: String::new(),
                        stderr: err.to_string(),
                        duration_ms,
                        changed: false,
                        summary: err.to_string(),
                    });
                    return Err(err.into_host_error(name));
                }
            }
        }

        Ok(())
    }
}
