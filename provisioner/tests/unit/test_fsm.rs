//! FSM unit tests

use vmprov::deploy::fsm::{HostEvent, HostFsm, HostState};
use vmprov::errors::{ConnectFailure, ConnectionError, HostError, InvalidCredential};
use vmprov::models::report::HostStatus;

fn timeout_error() -> HostError {
    ConnectionError::new("h2", ConnectFailure::Timeout, "no answer").into()
}

#[test]
fn test_fsm_initial_state() {
    let fsm = HostFsm::new();
    assert_eq!(fsm.state(), &HostState::Pending);
    assert!(fsm.error().is_none());
    assert!(fsm.status().is_none());
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = HostFsm::new();

    // Pending -> Connecting
    fsm.process(HostEvent::Connect).unwrap();
    assert_eq!(fsm.state(), &HostState::Connecting);

    // Connecting -> Deploying
    fsm.process(HostEvent::Connected).unwrap();
    assert_eq!(fsm.state(), &HostState::Deploying);

    // Deploying -> Succeeded
    fsm.process(HostEvent::Completed).unwrap();
    assert_eq!(fsm.state(), &HostState::Succeeded);
    assert_eq!(fsm.status(), Some(HostStatus::Succeeded));
}

#[test]
fn test_fsm_connect_failure_flow() {
    let mut fsm = HostFsm::new();

    fsm.process(HostEvent::Connect).unwrap();
    fsm.process(HostEvent::ConnectFailed(timeout_error())).unwrap();

    assert_eq!(fsm.state(), &HostState::Failed);
    assert_eq!(fsm.error(), Some(&timeout_error()));
    assert_eq!(fsm.status(), Some(HostStatus::Failed));
}

#[test]
fn test_fsm_deploy_failure_flow() {
    let mut fsm = HostFsm::new();

    fsm.process(HostEvent::Connect).unwrap();
    fsm.process(HostEvent::Connected).unwrap();
    fsm.process(HostEvent::DeployFailed(HostError::StepFailed {
        step: "dependencies".to_string(),
        exit_status: 1,
    }))
    .unwrap();

    assert_eq!(fsm.state(), &HostState::Failed);
    assert!(matches!(
        fsm.error(),
        Some(HostError::StepFailed { exit_status: 1, .. })
    ));
}

#[test]
fn test_fsm_skip_invalid_credential() {
    let mut fsm = HostFsm::new();
    let err = InvalidCredential {
        fields: vec!["hostname".to_string()],
        reason: "required field missing".to_string(),
    };

    fsm.process(HostEvent::Skip(err.into())).unwrap();
    assert_eq!(fsm.state(), &HostState::Skipped);
    assert_eq!(fsm.status(), Some(HostStatus::Skipped));
}

#[test]
fn test_fsm_invalid_transitions() {
    let mut fsm = HostFsm::new();

    // Cannot deploy before connecting
    assert!(fsm.process(HostEvent::Connected).is_err());
    assert!(fsm.process(HostEvent::Completed).is_err());
    assert_eq!(fsm.state(), &HostState::Pending);

    // Cannot skip once connecting
    fsm.process(HostEvent::Connect).unwrap();
    assert!(fsm.process(HostEvent::Skip(HostError::Cancelled)).is_err());
    assert_eq!(fsm.state(), &HostState::Connecting);

    // Terminal states accept nothing
    fsm.process(HostEvent::ConnectFailed(timeout_error())).unwrap();
    assert!(fsm.process(HostEvent::Connect).is_err());
    assert!(fsm.state().is_terminal());
}
