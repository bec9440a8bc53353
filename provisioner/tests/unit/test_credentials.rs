//! Credential validation and authentication tests

#[path = "common/mod.rs"]
mod common;

use std::path::PathBuf;
use std::sync::Arc;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use vmprov::authn::credential::{Credential, CredentialFields};
use vmprov::deploy::procedure::{DeploymentProcedure, ProcedureSettings};
use vmprov::errors::{ConnectFailure, HostError};
use vmprov::models::report::HostStatus;
use vmprov::models::repository::RepositoryRef;
use vmprov::orchestrator::run::{Orchestrator, OrchestratorOptions};
use vmprov::ssh::connection::{ConnectOptions, Connection};

use common::{password_fields, SimConnector, SimHost, REPO_URL};

fn agent_fields(host: &str) -> CredentialFields {
    CredentialFields {
        hostname: Some(host.to_string()),
        username: Some("deploy".to_string()),
        ..Default::default()
    }
}

#[test]
fn test_no_password_or_identity_is_agent() {
    let credential = Credential::validate(agent_fields("vm1")).unwrap();
    assert!(matches!(credential, Credential::Agent { .. }));
    assert_eq!(credential.method(), "agent");
    assert_eq!(credential.target().port, 22);
}

#[tokio::test]
async fn test_agent_without_ambient_credentials_fails_auth() {
    let mut connector = SimConnector::new();
    connector.add("vm1", SimHost::fresh());

    let credential = Credential::validate(agent_fields("vm1")).unwrap();
    let err = Connection::connect(&connector, &credential, &ConnectOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.reason, ConnectFailure::AuthFailure);
    assert_eq!(err.host, "vm1");
}

#[tokio::test]
async fn test_wrong_password_fails_auth() {
    let mut connector = SimConnector::new();
    connector.add("vm1", SimHost::fresh());

    let mut fields = password_fields("vm1");
    fields.password = Some(SecretString::from("wrong".to_string()));
    let credential = Credential::validate(fields).unwrap();
    let err = Connection::connect(&connector, &credential, &ConnectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.reason, ConnectFailure::AuthFailure);
    assert!(!err.reason.is_transient());
}

#[test]
fn test_password_and_identity_rejected() {
    let mut fields = password_fields("vm1");
    fields.identity_file = Some(PathBuf::from("/home/me/.ssh/id_ed25519"));

    let err = Credential::validate(fields).unwrap_err();
    assert!(err.fields.contains(&"password".to_string()));
    assert!(err.fields.contains(&"identity_file".to_string()));
}

#[tokio::test]
async fn test_invalid_credential_never_reaches_connector() {
    let mut connector = SimConnector::new();
    connector.add("vm1", SimHost::fresh());
    let connector = Arc::new(connector);

    let mut fields = password_fields("vm1");
    fields.identity_file = Some(PathBuf::from("/home/me/.ssh/id_ed25519"));

    let orchestrator = Orchestrator::new(
        connector.clone(),
        Arc::new(DeploymentProcedure::standard(ProcedureSettings::default())),
        OrchestratorOptions::default(),
    );
    let repo = Arc::new(RepositoryRef::new(REPO_URL, None, None).unwrap());
    let report = orchestrator
        .run_all(repo, vec![fields], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(connector.opens(), 0);
    let host = &report.hosts[0];
    assert_eq!(host.status, HostStatus::Skipped);
    assert!(host.steps.is_empty());
    assert!(matches!(host.error, Some(HostError::InvalidCredential(_))));
    assert!(!report.succeeded());
}

#[test]
fn test_password_not_in_debug_output() {
    let credential = Credential::validate(password_fields("vm1")).unwrap();
    let debug = format!("{:?}", credential);
    assert!(!debug.contains("\"pw\""));
    assert!(debug.contains("vm1"));
}
