//! Remote session traits

use std::time::Duration;

use async_trait::async_trait;

use crate::authn::credential::Credential;
use crate::errors::{CommandError, ConnectionError};

/// Whether a command and its output may appear in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Logged,
    Redacted,
}

/// Output of one remote command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// First non-empty stdout line, trimmed
    pub fn first_line(&self) -> &str {
        self.stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
    }
}

/// Opens authenticated sessions to hosts
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate a session. Must not retry.
    async fn open(
        &self,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, ConnectionError>;
}

/// An authenticated session to one host
#[async_trait]
pub trait RemoteSession: Send {
    /// Run `command` through the remote shell.
    ///
    /// A non-zero exit status is returned as a normal output.
    async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
        visibility: Visibility,
    ) -> Result<CommandOutput, CommandError>;

    /// Tear the session down and release local resources
    async fn shutdown(&mut self);
}
