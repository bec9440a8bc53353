//! Finite State Machine for a host's provisioning lifecycle

use serde::Serialize;

use crate::errors::HostError;
use crate::models::report::HostStatus;

/// Host state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    /// Not started yet
    Pending,

    /// Opening the connection
    Connecting,

    /// Running the deployment procedure
    Deploying,

    /// Every step succeeded
    Succeeded,

    /// Connection or a step failed
    Failed,

    /// Never connected: invalid credential or cancelled before start
    Skipped,
}

impl HostState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HostState::Succeeded | HostState::Failed | HostState::Skipped
        )
    }
}

/// Host event
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Start connecting
    Connect,

    /// Connection established
    Connected,

    /// Connection could not be established
    ConnectFailed(HostError),

    /// Procedure finished successfully
    Completed,

    /// Procedure halted
    DeployFailed(HostError),

    /// Host will not be attempted
    Skip(HostError),
}

/// Host FSM
#[derive(Debug, Clone)]
pub struct HostFsm {
    state: HostState,
    error: Option<HostError>,
}

impl HostFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: HostState::Pending,
            error: None,
        }
    }

    pub fn state(&self) -> &HostState {
        &self.state
    }

    /// Error that moved the host to a failed or skipped state
    pub fn error(&self) -> Option<&HostError> {
        self.error.as_ref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: HostEvent) -> Result<(), String> {
        let new_state = match (&self.state, event) {
            // From Pending
            (HostState::Pending, HostEvent::Connect) => HostState::Connecting,
            (HostState::Pending, HostEvent::Skip(err)) => {
                self.error = Some(err);
                HostState::Skipped
            }

            // From Connecting
            (HostState::Connecting, HostEvent::Connected) => HostState::Deploying,
            (HostState::Connecting, HostEvent::ConnectFailed(err)) => {
                self.error = Some(err);
                HostState::Failed
            }

            // From Deploying
            (HostState::Deploying, HostEvent::Completed) => HostState::Succeeded,
            (HostState::Deploying, HostEvent::DeployFailed(err)) => {
                self.error = Some(err);
                HostState::Failed
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }

    /// Reported status of a terminal state
    pub fn status(&self) -> Option<HostStatus> {
        match self.state {
            HostState::Succeeded => Some(HostStatus::Succeeded),
            HostState::Failed => Some(HostStatus::Failed),
            HostState::Skipped => Some(HostStatus::Skipped),
            _ => None,
        }
    }
}

impl Default for HostFsm {
    fn default() -> Self {
        Self::new()
    }
}
