//! Authenticated connection to one host

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::{debug, info};

use crate::authn::credential::Credential;
use crate::errors::{CommandError, ConnectFailure, ConnectionError};
use crate::ssh::session::{CommandOutput, Connector, RemoteSession, Visibility};
use crate::ssh::privileged_script;
use crate::utils::shell_quote_path;

/// Connection settings
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Upper bound on establishing an authenticated session
    pub connect_timeout: Duration,

    /// Default upper bound on a single remote command
    pub command_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(900),
        }
    }
}

/// A live session to exactly one host.
///
/// `close` is idempotent. Dropping an unclosed connection drops the session,
/// which kills any local transport processes.
pub struct Connection {
    host: String,
    session: Option<Box<dyn RemoteSession>>,
    command_timeout: Duration,
}

impl Connection {
    /// Open an authenticated session. Failures surface immediately, without retry.
    pub async fn connect(
        connector: &dyn Connector,
        credential: &Credential,
        options: &ConnectOptions,
    ) -> Result<Self, ConnectionError> {
        let host = credential.host().to_string();
        debug!(
            host = %host,
            method = credential.method(),
            timeout_secs = options.connect_timeout.as_secs(),
            "Opening session"
        );

        let opened = tokio::time::timeout(
            options.connect_timeout,
            connector.open(credential, options.connect_timeout),
        )
        .await;

        let session = match opened {
            Ok(result) => result?,
            Err(_) => {
                return Err(ConnectionError::new(
                    host,
                    ConnectFailure::Timeout,
                    format!(
                        "no authenticated session after {}s",
                        options.connect_timeout.as_secs()
                    ),
                ))
            }
        };

        info!(host = %host, "Connected to {}", credential.target());
        Ok(Self {
            host,
            session: Some(session),
            command_timeout: options.command_timeout,
        })
    }

    /// Wrap an already-open session
    pub fn from_session(
        host: impl Into<String>,
        session: Box<dyn RemoteSession>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            session: Some(session),
            command_timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Default timeout for commands on this connection
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Run a command. Output is streamed to the debug log.
    pub async fn run(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.exec(command, timeout, Visibility::Logged).await
    }

    /// Run a command carrying secret material. Neither the command nor its
    /// output is logged.
    pub async fn run_sensitive(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.exec(command, timeout, Visibility::Redacted).await
    }

    async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
        visibility: Visibility,
    ) -> Result<CommandOutput, CommandError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CommandError::Disconnected {
                detail: "connection already closed".to_string(),
            })?;

        match visibility {
            Visibility::Logged => debug!(host = %self.host, "$ {}", command),
            Visibility::Redacted => debug!(host = %self.host, "$ <redacted>"),
        }

        let output = session.exec(command, timeout, visibility).await?;
        debug!(
            host = %self.host,
            exit_status = output.exit_status,
            duration_ms = output.duration.as_millis() as u64,
            "Command finished"
        );
        Ok(output)
    }

    /// Upload a small file by piping base64 through the remote shell.
    ///
    /// The file is written to a temporary sibling first and renamed into place.
    pub async fn write_file(
        &mut self,
        path: &str,
        contents: &[u8],
        mode: u32,
        privileged: bool,
    ) -> Result<CommandOutput, CommandError> {
        let sudo = if privileged { "$SUDO " } else { "" };
        let target = shell_quote_path(path);
        let body = format!(
            "F={target}\n\
             {sudo}mkdir -p \"$(dirname \"$F\")\" && \
             printf %s '{payload}' | base64 -d | {sudo}tee \"$F.vmprov-tmp\" >/dev/null && \
             {sudo}chmod {mode:o} \"$F.vmprov-tmp\" && \
             {sudo}mv -f \"$F.vmprov-tmp\" \"$F\"",
            payload = BASE64.encode(contents),
        );
        let command = privileged_script(&format!("write-file {}", path), body);
        let timeout = self.command_timeout;
        self.run(&command, timeout).await
    }

    /// Close the session. Only the first call has any effect.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown().await;
            debug!(host = %self.host, "Connection closed");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("open", &self.is_open())
            .finish()
    }
}
