//! Orchestrator tests against simulated hosts

#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use vmprov::authn::credential::CredentialFields;
use vmprov::deploy::procedure::{DeploymentProcedure, ProcedureSettings};
use vmprov::errors::{ConnectFailure, HostError, ProvisionError};
use vmprov::models::report::{HostStatus, RunReport, RunStatus};
use vmprov::models::repository::RepositoryRef;
use vmprov::orchestrator::run::{Orchestrator, OrchestratorOptions};
use vmprov::ssh::connection::ConnectOptions;
use vmprov::utils::CooldownOptions;

use common::{password_fields, ConnectMode, SimConnector, SimHost, REPO_URL};

fn options(max_parallel: usize) -> OrchestratorOptions {
    OrchestratorOptions {
        max_parallel,
        connect: ConnectOptions {
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        cooldown: CooldownOptions {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

async fn run(
    connector: Arc<SimConnector>,
    options: OrchestratorOptions,
    targets: Vec<CredentialFields>,
    cancel: CancellationToken,
) -> Result<RunReport, ProvisionError> {
    let orchestrator = Orchestrator::new(
        connector,
        Arc::new(DeploymentProcedure::standard(ProcedureSettings::default())),
        options,
    );
    let repo = Arc::new(RepositoryRef::new(REPO_URL, None, None).unwrap());
    orchestrator.run_all(repo, targets, cancel).await
}

fn targets(hosts: &[&str]) -> Vec<CredentialFields> {
    hosts.iter().map(|h| password_fields(h)).collect()
}

#[tokio::test]
async fn test_empty_target_list_is_an_error() {
    let connector = Arc::new(SimConnector::new());
    let result = run(connector, options(1), Vec::new(), CancellationToken::new()).await;
    let err = tokio_test::assert_err!(result);
    assert!(matches!(err, ProvisionError::NoTargets));
}

#[tokio::test]
async fn test_timeout_on_one_host_leaves_others_untouched() {
    let mut connector = SimConnector::new();
    let h1 = connector.add("h1", SimHost::fresh());
    let h2 = connector.add("h2", SimHost::fresh().with_connect(ConnectMode::Hang));
    let h3 = connector.add("h3", SimHost::fresh());
    let connector = Arc::new(connector);

    let report = run(
        connector,
        options(3),
        targets(&["h1", "h2", "h3"]),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let hosts: Vec<&str> = report.hosts.iter().map(|h| h.host.as_str()).collect();
    assert_eq!(hosts, vec!["h1", "h2", "h3"]);
    assert_eq!(report.hosts[0].status, HostStatus::Succeeded);
    assert_eq!(report.hosts[2].status, HostStatus::Succeeded);

    let failed = &report.hosts[1];
    assert_eq!(failed.status, HostStatus::Failed);
    assert!(failed.steps.is_empty());
    match &failed.error {
        Some(HostError::Connection(err)) => assert_eq!(err.reason, ConnectFailure::Timeout),
        other => panic!("unexpected error: {:?}", other),
    }

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_hosts, vec!["h2".to_string()]);
    assert_eq!(report.exit_code(), 1);

    assert_eq!(h1.lock().unwrap().closes, 1);
    assert_eq!(h2.lock().unwrap().closes, 0);
    assert_eq!(h3.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn test_all_hosts_succeed() {
    let mut connector = SimConnector::new();
    connector.add("h1", SimHost::fresh());
    connector.add("h2", SimHost::fresh());
    let connector = Arc::new(connector);

    let report = run(
        connector,
        options(2),
        targets(&["h1", "h2"]),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(report.succeeded());
    assert!(report.failed_hosts.is_empty());
    assert_eq!(report.exit_code(), 0);
    assert!(report.hosts.iter().all(|h| h.steps.len() == 5));
}

#[tokio::test]
async fn test_cancel_after_first_host() {
    let cancel = CancellationToken::new();
    let mut first = SimHost::fresh();
    first.cancel_on_close = Some(cancel.clone());

    let mut connector = SimConnector::new();
    connector.add("h1", first);
    let h2 = connector.add("h2", SimHost::fresh());
    connector.add("h3", SimHost::fresh());
    let connector = Arc::new(connector);

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        run(connector.clone(), options(1), targets(&["h1", "h2", "h3"]), cancel),
    )
    .await
    .expect("run hung after cancellation")
    .unwrap();

    assert_eq!(report.hosts[0].status, HostStatus::Succeeded);
    for host in &report.hosts[1..] {
        assert_eq!(host.status, HostStatus::Skipped);
        assert!(host.was_cancelled());
    }
    assert!(report.cancelled);
    assert_eq!(report.exit_code(), 130);
    assert_eq!(connector.opens(), 1);
    assert_eq!(h2.lock().unwrap().open_attempts, 0);
}

#[tokio::test]
async fn test_cancel_stops_in_flight_host_and_closes_once() {
    let mut stuck = SimHost::fresh();
    stuck.hang_on = Some("deps-install".to_string());

    let mut connector = SimConnector::new();
    let host = connector.add("h1", stuck);
    let connector = Arc::new(connector);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        run(connector, options(1), targets(&["h1"]), cancel),
    )
    .await
    .expect("run hung after cancellation")
    .unwrap();

    let outcome = &report.hosts[0];
    assert_eq!(outcome.status, HostStatus::Failed);
    assert_eq!(outcome.error, Some(HostError::Cancelled));
    // steps completed before cancellation are kept
    assert_eq!(outcome.steps.len(), 2);
    assert!(report.cancelled);
    assert_eq!(host.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let mut connector = SimConnector::new();
    let host = connector.add(
        "h1",
        SimHost::fresh().with_connect(ConnectMode::RefuseTimes(2, ConnectFailure::Unreachable)),
    );
    let connector = Arc::new(connector);

    let mut opts = options(1);
    opts.connect_attempts = 3;
    let report = run(connector, opts, targets(&["h1"]), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.succeeded());
    let host = host.lock().unwrap();
    assert_eq!(host.open_attempts, 3);
    assert_eq!(host.closes, 1);
}

#[tokio::test]
async fn test_no_retry_by_default() {
    let mut connector = SimConnector::new();
    let host = connector.add(
        "h1",
        SimHost::fresh().with_connect(ConnectMode::RefuseTimes(1, ConnectFailure::Unreachable)),
    );
    let connector = Arc::new(connector);

    let report = run(connector, options(1), targets(&["h1"]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.hosts[0].status, HostStatus::Failed);
    assert_eq!(host.lock().unwrap().open_attempts, 1);
}

#[tokio::test]
async fn test_auth_failure_is_never_retried() {
    let mut connector = SimConnector::new();
    let host = connector.add(
        "h1",
        SimHost::fresh().with_connect(ConnectMode::Refuse(ConnectFailure::AuthFailure)),
    );
    let connector = Arc::new(connector);

    let mut opts = options(1);
    opts.connect_attempts = 5;
    let report = run(connector, opts, targets(&["h1"]), CancellationToken::new())
        .await
        .unwrap();

    match &report.hosts[0].error {
        Some(HostError::Connection(err)) => assert_eq!(err.reason, ConnectFailure::AuthFailure),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(host.lock().unwrap().open_attempts, 1);
}

#[tokio::test]
async fn test_step_failure_recorded_in_outcome() {
    let mut connector = SimConnector::new();
    connector.add("h1", SimHost::fresh().failing("deps-install", 1));
    connector.add("h2", SimHost::fresh());
    let connector = Arc::new(connector);

    let report = run(
        connector,
        options(2),
        targets(&["h1", "h2"]),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let failed = &report.hosts[0];
    assert_eq!(failed.status, HostStatus::Failed);
    assert_eq!(failed.steps.len(), 3);
    assert_eq!(failed.failed_step.as_deref(), Some("dependencies"));
    assert_eq!(failed.step("dependencies").unwrap().exit_status, Some(1));
    assert!(failed.step("configure").is_none());
    assert!(report.hosts[1].succeeded());
    assert_eq!(report.failed_hosts, vec!["h1".to_string()]);
}

#[tokio::test]
async fn test_panicking_host_is_contained() {
    let mut crashing = SimHost::fresh();
    crashing.panic_on = Some("probe-checkout".to_string());

    let mut connector = SimConnector::new();
    let crashed = connector.add("h1", crashing);
    connector.add("h2", SimHost::fresh());
    let connector = Arc::new(connector);

    let report = run(
        connector,
        options(1),
        targets(&["h1", "h2"]),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.hosts[0].status, HostStatus::Failed);
    assert!(matches!(
        report.hosts[0].error,
        Some(HostError::Internal { .. })
    ));
    // baseline finished before the crash in sync
    assert_eq!(report.hosts[0].steps.len(), 1);
    assert_eq!(crashed.lock().unwrap().closes, 1);
    assert!(report.hosts[1].succeeded());
}

#[tokio::test]
async fn test_missing_hostname_gets_positional_label() {
    let connector = Arc::new(SimConnector::new());
    let fields = CredentialFields {
        username: Some("deploy".to_string()),
        ..Default::default()
    };

    let report = run(connector.clone(), options(1), vec![fields], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.hosts[0].host, "target-1");
    assert_eq!(report.hosts[0].status, HostStatus::Skipped);
    assert_eq!(connector.opens(), 0);
}

#[tokio::test]
async fn test_report_serializes_without_secrets() {
    let mut connector = SimConnector::new();
    connector.add("h1", SimHost::fresh());
    let connector = Arc::new(connector);

    let report = run(connector, options(1), targets(&["h1"]), CancellationToken::new())
        .await
        .unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "succeeded");
    assert_eq!(json["hosts"][0]["steps"][1]["name"], "sync");
    assert!(!json.to_string().contains("\"pw\""));
}
