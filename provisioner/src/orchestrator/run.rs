//! Runs the deployment procedure against every target host

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::authn::credential::{Credential, CredentialFields};
use crate::deploy::fsm::{HostEvent, HostFsm};
use crate::deploy::procedure::DeploymentProcedure;
use crate::errors::{HostError, ProvisionError};
use crate::models::report::{HostOutcome, HostStatus, RunReport, StepResult};
use crate::models::repository::RepositoryRef;
use crate::ssh::connection::{ConnectOptions, Connection};
use crate::ssh::session::Connector;
use crate::utils::{calc_exp_backoff, generate_uuid, CooldownOptions};

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Hosts provisioned at the same time
    pub max_parallel: usize,

    pub connect: ConnectOptions,

    /// Connection attempts per host; only unreachable and timed out hosts are retried
    pub connect_attempts: u32,

    /// Backoff between connection attempts
    pub cooldown: CooldownOptions,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            connect: ConnectOptions::default(),
            connect_attempts: 1,
            cooldown: CooldownOptions::default(),
        }
    }
}

/// Provisions a list of targets with one deployment procedure
#[derive(Clone)]
pub struct Orchestrator {
    connector: Arc<dyn Connector>,
    procedure: Arc<DeploymentProcedure>,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        procedure: Arc<DeploymentProcedure>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            connector,
            procedure,
            options,
        }
    }

    /// Provision every target and aggregate the outcomes in input order.
    ///
    /// Per-host failures never abort the run; the only hard error is an
    /// empty target list.
    pub async fn run_all(
        &self,
        repo: Arc<RepositoryRef>,
        targets: Vec<CredentialFields>,
        cancel: CancellationToken,
    ) -> Result<RunReport, ProvisionError> {
        if targets.is_empty() {
            return Err(ProvisionError::NoTargets);
        }

        let run_id = generate_uuid();
        let started_at = Utc::now();
        let max_parallel = self.options.max_parallel.max(1);
        info!(
            run_id = %run_id,
            hosts = targets.len(),
            max_parallel,
            "Provisioning {}",
            repo.url()
        );

        let hosts: Vec<HostOutcome> = stream::iter(targets.into_iter().enumerate())
            .map(|(index, fields)| {
                let label = fields
                    .label()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("target-{}", index + 1));
                let this = self.clone();
                let repo = repo.clone();
                let cancel = cancel.clone();
                async move { this.spawn_host(label, fields, repo, cancel).await }
            })
            .buffered(max_parallel)
            .collect()
            .await;

        let report = RunReport::new(
            run_id,
            repo.url().to_string(),
            started_at,
            hosts,
            cancel.is_cancelled(),
        );
        if report.succeeded() {
            info!(run_id = %report.run_id, "All {} hosts provisioned", report.hosts.len());
        } else {
            warn!(
                run_id = %report.run_id,
                cancelled = report.cancelled,
                "{} of {} hosts not provisioned: {}",
                report.failed_hosts.len(),
                report.hosts.len(),
                report.failed_hosts.join(", ")
            );
        }
        Ok(report)
    }

    /// Run one host in its own task so a panic stays inside that host
    async fn spawn_host(
        self,
        label: String,
        fields: CredentialFields,
        repo: Arc<RepositoryRef>,
        cancel: CancellationToken,
    ) -> HostOutcome {
        if cancel.is_cancelled() {
            info!(host = %label, "Run cancelled, skipping host");
            return HostOutcome::skipped(label, HostError::Cancelled);
        }

        let started_at = Utc::now();
        let span = info_span!("host", host = %label);
        let task_label = label.clone();
        let handle = tokio::spawn(
            async move { self.provision_host(task_label, fields, &repo, &cancel).await }
                .instrument(span),
        );

        match handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(host = %label, "Host task aborted: {}", err);
                HostOutcome {
                    host: label,
                    status: HostStatus::Failed,
                    steps: Vec::new(),
                    failed_step: None,
                    error: Some(HostError::Internal {
                        message: format!("host task aborted: {}", err),
                    }),
                    started_at,
                    finished_at: Utc::now(),
                }
            }
        }
    }

    async fn provision_host(
        &self,
        label: String,
        fields: CredentialFields,
        repo: &RepositoryRef,
        cancel: &CancellationToken,
    ) -> HostOutcome {
        let started_at = Utc::now();
        let mut fsm = HostFsm::new();
        let mut steps: Vec<StepResult> = Vec::new();

        let credential = match Credential::validate(fields) {
            Ok(credential) => credential,
            Err(err) => {
                warn!("Skipping host: {}", err);
                transition(&mut fsm, HostEvent::Skip(err.into()));
                return outcome(label, &fsm, steps, started_at);
            }
        };

        transition(&mut fsm, HostEvent::Connect);
        let mut conn = match self.connect(&credential, cancel).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!("Connection failed: {}", err);
                transition(&mut fsm, HostEvent::ConnectFailed(err));
                return outcome(label, &fsm, steps, started_at);
            }
        };
        transition(&mut fsm, HostEvent::Connected);

        let procedure = AssertUnwindSafe(self.procedure.run(
            &mut conn,
            repo,
            &credential.target().username,
            &mut steps,
        ))
        .catch_unwind();
        let result = tokio::select! {
            result = procedure => result.unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!("Deployment procedure panicked: {}", message);
                Err(HostError::Internal {
                    message: format!("deployment procedure panicked: {}", message),
                })
            }),
            _ = cancel.cancelled() => {
                warn!("Run cancelled, stopping host");
                Err(HostError::Cancelled)
            }
        };
        conn.close().await;

        match result {
            Ok(()) => {
                info!("Host provisioned");
                transition(&mut fsm, HostEvent::Completed);
            }
            Err(err) => {
                warn!("Host failed: {}", err);
                transition(&mut fsm, HostEvent::DeployFailed(err));
            }
        }
        outcome(label, &fsm, steps, started_at)
    }

    /// Open a connection, retrying transient failures up to `connect_attempts`
    async fn connect(
        &self,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Connection, HostError> {
        let attempts = self.options.connect_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                result = Connection::connect(
                    self.connector.as_ref(),
                    credential,
                    &self.options.connect,
                ) => result,
                _ = cancel.cancelled() => return Err(HostError::Cancelled),
            };

            let err = match result {
                Ok(conn) => return Ok(conn),
                Err(err) => err,
            };
            if !err.reason.is_transient() || attempt >= attempts {
                return Err(err.into());
            }

            let delay = calc_exp_backoff(&self.options.cooldown, attempt - 1);
            warn!(
                attempt,
                attempts,
                "Connection attempt failed ({}), retrying in {:?}",
                err.reason,
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(HostError::Cancelled),
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn transition(fsm: &mut HostFsm, event: HostEvent) {
    if let Err(e) = fsm.process(event) {
        error!("{}", e);
    }
}

fn outcome(
    host: String,
    fsm: &HostFsm,
    steps: Vec<StepResult>,
    started_at: chrono::DateTime<Utc>,
) -> HostOutcome {
    let failed_step = steps
        .iter()
        .find(|s| !s.succeeded())
        .map(|s| s.name.clone());
    HostOutcome {
        host,
        status: fsm.status().unwrap_or(HostStatus::Failed),
        steps,
        failed_step,
        error: fsm.error().cloned(),
        started_at,
        finished_at: Utc::now(),
    }
}
