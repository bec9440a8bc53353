//! Error types for the provisioner

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Top-level error for a whole provisioning run.
///
/// Per-host failures never surface here; they are recorded in the run report.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No target hosts configured")]
    NoTargets,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ProvisionError {
    fn from(err: anyhow::Error) -> Self {
        ProvisionError::Internal(err.to_string())
    }
}

/// A credential descriptor that failed validation
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("Invalid credential ({}): {reason}", .fields.join(", "))]
pub struct InvalidCredential {
    /// The missing or conflicting fields
    pub fields: Vec<String>,

    /// Human readable reason
    pub reason: String,
}

/// Why a connection could not be established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectFailure {
    AuthFailure,
    Unreachable,
    Timeout,
}

impl ConnectFailure {
    /// Whether an orchestrator-level retry may help
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectFailure::Unreachable | ConnectFailure::Timeout)
    }
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectFailure::AuthFailure => "auth-failure",
            ConnectFailure::Unreachable => "unreachable",
            ConnectFailure::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Failure to open an authenticated session
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("Connection to {host} failed ({reason}): {detail}")]
pub struct ConnectionError {
    pub host: String,
    pub reason: ConnectFailure,
    pub detail: String,
}

impl ConnectionError {
    pub fn new(host: impl Into<String>, reason: ConnectFailure, detail: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            reason,
            detail: detail.into(),
        }
    }
}

/// Failure to run a command on an open session.
///
/// A non-zero exit status is not an error.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CommandError {
    #[error("Command timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    #[error("Session disconnected: {detail}")]
    Disconnected { detail: String },

    #[error("Failed to spawn command: {detail}")]
    Spawn { detail: String },
}

/// Failure to place the repository on the remote host
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransferError {
    #[error("{path} holds unrelated content: {found}")]
    UnrelatedContent { path: String, found: String },

    #[error("git {operation} failed with status {exit_status}: {stderr}")]
    GitFailed {
        operation: String,
        exit_status: i32,
        stderr: String,
    },

    #[error(transparent)]
    Command {
        #[from]
        source: CommandError,
    },
}

/// Terminal error recorded in a host outcome
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HostError {
    #[error(transparent)]
    InvalidCredential(InvalidCredential),

    #[error(transparent)]
    Connection(ConnectionError),

    #[error("Step '{step}' failed: {source}")]
    Command { step: String, source: CommandError },

    #[error("Step '{step}' failed: {source}")]
    Transfer { step: String, source: TransferError },

    #[error("Step '{step}' exited with status {exit_status}")]
    StepFailed { step: String, exit_status: i32 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<InvalidCredential> for HostError {
    fn from(err: InvalidCredential) -> Self {
        HostError::InvalidCredential(err)
    }
}

impl From<ConnectionError> for HostError {
    fn from(err: ConnectionError) -> Self {
        HostError::Connection(err)
    }
}

/// Error raised by a single deployment step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl StepError {
    /// Attach the failing step's name
    pub fn into_host_error(self, step: &str) -> HostError {
        match self {
            StepError::Command(source) => HostError::Command {
                step: step.to_string(),
                source,
            },
            StepError::Transfer(source) => HostError::Transfer {
                step: step.to_string(),
                source,
            },
        }
    }
}
