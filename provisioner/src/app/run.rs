//! Main application run

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::deploy::procedure::DeploymentProcedure;
use crate::errors::ProvisionError;
use crate::models::report::RunReport;
use crate::orchestrator::run::Orchestrator;
use crate::ssh::openssh::OpenSshConnector;

/// Provision every configured host over OpenSSH.
///
/// `shutdown_signal` cancels the run: hosts not yet started are skipped and
/// in-flight hosts stop at their current command.
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<RunReport, ProvisionError> {
    let AppOptions {
        repository,
        targets,
        orchestrator: orchestrator_options,
        procedure,
        ssh,
        ..
    } = options;

    let procedure = DeploymentProcedure::standard(procedure);
    info!(
        steps = ?procedure.step_names(),
        hosts = targets.len(),
        "Deploying {} to {}",
        repository.url(),
        repository.install_path()
    );

    let orchestrator = Orchestrator::new(
        Arc::new(OpenSshConnector::new(ssh)),
        Arc::new(procedure),
        orchestrator_options,
    );

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal.await;
            warn!("Cancelling run...");
            cancel.cancel();
        })
    };

    let result = orchestrator
        .run_all(Arc::new(repository), targets, cancel.clone())
        .await;

    // Stop the signal watcher without marking the run cancelled
    watcher.abort();
    result
}
