//! Deployment procedure tests against a simulated host

#[path = "common/mod.rs"]
mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use tokio_test::{assert_err, assert_ok};

use vmprov::authn::credential::Credential;
use vmprov::deploy::procedure::{DeploymentProcedure, ProcedureSettings, RegistryLogin};
use vmprov::deploy::service::{ServiceRuntime, ServiceSettings};
use vmprov::deploy::steps::default_baseline;
use vmprov::errors::{HostError, TransferError};
use vmprov::models::report::StepResult;
use vmprov::models::repository::RepositoryRef;
use vmprov::ssh::connection::{ConnectOptions, Connection};
use vmprov::ssh::sync::SyncOutcome;

use common::{password_fields, PathContent, SimConnector, SimHost, CHECKOUT, REPO_URL};

struct Harness {
    connector: SimConnector,
    host: Arc<Mutex<SimHost>>,
    procedure: DeploymentProcedure,
    repo: RepositoryRef,
}

impl Harness {
    fn new(host: SimHost) -> Self {
        Self::with_settings(host, ProcedureSettings::default())
    }

    fn with_settings(host: SimHost, settings: ProcedureSettings) -> Self {
        let mut connector = SimConnector::new();
        let host = connector.add("vm1", host);
        Self {
            connector,
            host,
            procedure: DeploymentProcedure::standard(settings),
            repo: RepositoryRef::new(REPO_URL, Some("main".to_string()), None).unwrap(),
        }
    }

    async fn run(&self) -> (Result<(), HostError>, Vec<StepResult>) {
        let credential = Credential::validate(password_fields("vm1")).unwrap();
        let mut conn = Connection::connect(&self.connector, &credential, &ConnectOptions::default())
            .await
            .unwrap();
        let mut steps = Vec::new();
        let result = self
            .procedure
            .run(&mut conn, &self.repo, "deploy", &mut steps)
            .await;
        conn.close().await;
        (result, steps)
    }
}

fn names(steps: &[StepResult]) -> Vec<&str> {
    steps.iter().map(|s| s.name.as_str()).collect()
}

#[tokio::test]
async fn test_fresh_host_runs_all_steps() {
    let harness = Harness::new(SimHost::fresh());
    let (result, steps) = harness.run().await;

    assert_ok!(result);
    assert_eq!(
        names(&steps),
        vec!["baseline", "sync", "dependencies", "configure", "service"]
    );
    assert!(steps.iter().all(|s| s.succeeded() && s.changed));
    assert!(steps[1].summary.starts_with("cloned at"));

    let host = harness.host.lock().unwrap();
    assert!(host.tools.contains("git") && host.tools.contains("docker"));
    assert!(host.enabled && host.active);
    assert!(host.deps_stamp.is_some());
    let unit = host.unit_content.as_deref().unwrap();
    assert!(unit.contains(&format!("WorkingDirectory={}", CHECKOUT)));
    assert_eq!(host.closes, 1);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let harness = Harness::new(SimHost::fresh());
    harness.run().await.0.unwrap();
    let ops_after_first = harness.host.lock().unwrap().ops.len();

    let (result, steps) = harness.run().await;
    result.unwrap();

    assert_eq!(steps.len(), 5);
    assert!(steps.iter().all(|s| s.succeeded() && !s.changed));
    assert!(steps[1].summary.starts_with("already up to date"));

    let host = harness.host.lock().unwrap();
    let second: Vec<&str> = host.ops[ops_after_first..].iter().map(String::as_str).collect();
    for op in ["install git", "git-clone", "deps-install", "service-restart", "service-start"] {
        assert!(!second.contains(&op), "second run ran {}", op);
    }
    assert!(!second.iter().any(|op| op.starts_with("write-file")));
    assert_eq!(host.restarts, 0);
}

#[tokio::test]
async fn test_new_commit_restarts_service() {
    let harness = Harness::new(SimHost::fresh());
    harness.run().await.0.unwrap();
    harness.host.lock().unwrap().upstream_head = "2".repeat(40);

    let (result, steps) = harness.run().await;
    result.unwrap();

    assert!(steps[1].summary.starts_with("updated"));
    assert!(steps[1].changed);
    // the compose fingerprint includes the commit
    assert!(steps[2].changed);
    assert!(steps[4].summary.starts_with("restarted"));
    assert_eq!(harness.host.lock().unwrap().restarts, 1);
}

#[tokio::test]
async fn test_dependency_failure_halts_procedure() {
    let harness = Harness::new(SimHost::fresh().failing("deps-install", 2));
    let (result, steps) = harness.run().await;

    assert_eq!(
        result,
        Err(HostError::StepFailed {
            step: "dependencies".to_string(),
            exit_status: 2,
        })
    );
    assert_eq!(names(&steps), vec!["baseline", "sync", "dependencies"]);
    assert_eq!(steps[2].exit_status, Some(2));

    let host = harness.host.lock().unwrap();
    assert!(!host.ran("unit-state"));
    assert!(!host.ran("service-state"));
    assert!(host.deps_stamp.is_none());
    assert_eq!(host.closes, 1);
}

#[tokio::test]
async fn test_rerun_after_partial_failure() {
    let harness = Harness::new(SimHost::fresh().failing("deps-install", 1));
    assert_err!(harness.run().await.0);

    harness.host.lock().unwrap().failing.clear();
    let (result, steps) = harness.run().await;
    result.unwrap();

    assert!(!steps[0].changed);
    assert!(steps[1].summary.starts_with("already up to date"));
    assert!(steps[2].changed);
}

#[tokio::test]
async fn test_unrelated_content_is_not_overwritten() {
    let mut host = SimHost::fresh();
    host.path = PathContent::Unrelated;
    let harness = Harness::new(host);

    let (result, steps) = harness.run().await;
    match result {
        Err(HostError::Transfer { step, source }) => {
            assert_eq!(step, "sync");
            assert!(matches!(source, TransferError::UnrelatedContent { .. }));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(names(&steps), vec!["baseline", "sync"]);
    assert_eq!(steps[1].exit_status, None);
    assert!(!harness.host.lock().unwrap().ran("git-clone"));
}

#[tokio::test]
async fn test_checkout_of_other_repository_rejected() {
    let mut host = SimHost::fresh();
    host.path = PathContent::Checkout {
        origin: "https://git.example.com/acme/other.git".to_string(),
        head: "3".repeat(40),
    };
    let harness = Harness::new(host);

    let (result, _) = harness.run().await;
    assert!(matches!(
        result,
        Err(HostError::Transfer {
            source: TransferError::UnrelatedContent { .. },
            ..
        })
    ));
    assert!(!harness.host.lock().unwrap().ran("git-reset"));
}

#[tokio::test]
async fn test_unhealthy_service_fails_after_timeout() {
    let mut host = SimHost::fresh();
    host.healthy = false;
    let mut settings = ProcedureSettings::default();
    settings.service.health_timeout = std::time::Duration::from_millis(50);
    settings.service.health_interval = std::time::Duration::from_millis(10);
    let harness = Harness::with_settings(host, settings);

    let (result, steps) = harness.run().await;
    assert!(matches!(result, Err(HostError::StepFailed { ref step, .. }) if step == "service"));
    assert_eq!(steps.len(), 5);
    assert!(steps[4].summary.contains("not healthy"));
}

#[tokio::test]
async fn test_command_runtime_with_node_manifest() {
    let service = ServiceSettings {
        runtime: ServiceRuntime::Command {
            exec_start: "npm start".to_string(),
        },
        ..Default::default()
    };
    let settings = ProcedureSettings {
        baseline: default_baseline(&service.runtime),
        service,
        ..Default::default()
    };
    let mut host = SimHost::fresh();
    host.files = vec!["package.json".to_string(), "package-lock.json".to_string()];
    let harness = Harness::with_settings(host, settings);

    let (result, steps) = harness.run().await;
    result.unwrap();
    assert_eq!(steps[2].summary, "installed dependencies (npm ci)");

    let host = harness.host.lock().unwrap();
    assert!(!host.tools.contains("docker"));
    assert!(host.unit_content.as_deref().unwrap().contains("User=deploy"));
}

#[tokio::test]
async fn test_registry_login_is_redacted() {
    let settings = ProcedureSettings {
        registry: Some(RegistryLogin {
            server: Some("registry.example.com".to_string()),
            username: "bot".to_string(),
            password: SecretString::from("registry-secret".to_string()),
        }),
        ..Default::default()
    };
    let harness = Harness::with_settings(SimHost::fresh(), settings);
    harness.run().await.0.unwrap();

    let host = harness.host.lock().unwrap();
    assert_eq!(host.sensitive_ops, vec!["registry-login".to_string()]);
}

#[tokio::test]
async fn test_first_sync_pinned_to_commit() {
    let pinned = "4".repeat(40);
    let mut host = SimHost::fresh();
    host.known_commits.push(pinned.clone());
    let mut connector = SimConnector::new();
    let state = connector.add("vm1", host);

    let repo = RepositoryRef::new(REPO_URL, Some(pinned.clone()), None).unwrap();
    let credential = Credential::validate(password_fields("vm1")).unwrap();
    let mut conn = Connection::connect(&connector, &credential, &ConnectOptions::default())
        .await
        .unwrap();

    let first = assert_ok!(conn.transfer_or_sync(&repo, Duration::from_secs(5)).await);
    assert_eq!(
        first.outcome,
        SyncOutcome::Cloned {
            commit: pinned.clone()
        }
    );
    match &state.lock().unwrap().path {
        PathContent::Checkout { head, .. } => assert_eq!(head, &pinned),
        other => panic!("unexpected path content: {:?}", other),
    }

    // the same ref against the existing checkout changes nothing
    let second = assert_ok!(conn.transfer_or_sync(&repo, Duration::from_secs(5)).await);
    assert_eq!(second.outcome, SyncOutcome::UpToDate { commit: pinned });
    conn.close().await;
}
