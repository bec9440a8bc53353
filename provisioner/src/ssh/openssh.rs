//! OpenSSH-backed sessions
//!
//! Each session runs a foreground ControlMaster (`ssh -M -N`) whose control
//! socket lives in a private temporary directory. Commands multiplex over that
//! socket, so authentication happens exactly once per host. Password logins go
//! through `sshpass -e`; the password only ever reaches the child's
//! environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::authn::credential::{Credential, SshTarget};
use crate::errors::{CommandError, ConnectFailure, ConnectionError};
use crate::ssh::session::{CommandOutput, Connector, RemoteSession, Visibility};

/// Exit status ssh uses for its own failures
const SSH_ERROR_STATUS: i32 = 255;

/// sshpass exit status for a rejected password
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// How often to check whether the master is ready
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// OpenSSH client settings
#[derive(Debug, Clone)]
pub struct OpenSshOptions {
    /// ssh client binary
    pub ssh_program: PathBuf,

    /// sshpass binary, used for password logins
    pub sshpass_program: PathBuf,

    /// Value for `StrictHostKeyChecking`
    pub strict_host_key_checking: String,

    /// Optional known hosts file
    pub known_hosts_file: Option<PathBuf>,

    /// Keepalive interval for the master connection
    pub server_alive_interval: Duration,

    /// Extra `-o` options, e.g. `ProxyJump=bastion`
    pub extra_options: Vec<String>,
}

impl Default for OpenSshOptions {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            sshpass_program: PathBuf::from("sshpass"),
            strict_host_key_checking: "accept-new".to_string(),
            known_hosts_file: None,
            server_alive_interval: Duration::from_secs(15),
            extra_options: Vec::new(),
        }
    }
}

/// Connector spawning the system `ssh` client
#[derive(Debug, Clone, Default)]
pub struct OpenSshConnector {
    options: OpenSshOptions,
}

impl OpenSshConnector {
    pub fn new(options: OpenSshOptions) -> Self {
        Self { options }
    }

    fn common_args(&self, target: &SshTarget, control_path: &Path, timeout: Duration) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            control_path.display().to_string(),
            "-p".to_string(),
            target.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", self.options.strict_host_key_checking),
            "-o".to_string(),
            format!(
                "ServerAliveInterval={}",
                self.options.server_alive_interval.as_secs().max(1)
            ),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if let Some(known_hosts) = &self.options.known_hosts_file {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        for option in &self.options.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }

    fn master_command(&self, credential: &Credential, control_path: &Path, timeout: Duration) -> Command {
        let target = credential.target();
        let mut cmd = match credential {
            Credential::Password { password, .. } => {
                let mut cmd = Command::new(&self.options.sshpass_program);
                cmd.arg("-e").arg(&self.options.ssh_program);
                cmd.env("SSHPASS", password.expose_secret());
                cmd
            }
            _ => Command::new(&self.options.ssh_program),
        };

        cmd.args(["-M", "-N", "-o", "ControlPersist=no"]);
        cmd.args(self.common_args(target, control_path, timeout));

        match credential {
            Credential::Password { .. } => {
                cmd.args([
                    "-o",
                    "PreferredAuthentications=password,keyboard-interactive",
                    "-o",
                    "PubkeyAuthentication=no",
                    "-o",
                    "NumberOfPasswordPrompts=1",
                ]);
            }
            Credential::IdentityFile { identity_file, .. } => {
                cmd.arg("-i").arg(identity_file);
                cmd.args(["-o", "IdentitiesOnly=yes", "-o", "BatchMode=yes"]);
            }
            Credential::Agent { .. } => {
                cmd.args(["-o", "BatchMode=yes"]);
            }
        }

        cmd.arg("--").arg(target.destination());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn master_ready(&self, target: &SshTarget, control_path: &Path) -> bool {
        if !control_path.exists() {
            return false;
        }
        let status = Command::new(&self.options.ssh_program)
            .args(["-S"])
            .arg(control_path)
            .args(["-O", "check", "-p", &target.port.to_string(), "--"])
            .arg(target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        matches!(status, Ok(s) if s.success())
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn open(
        &self,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, ConnectionError> {
        let target = credential.target().clone();
        let host = target.host.clone();

        let control_dir = tempfile::Builder::new()
            .prefix("vmprov-ssh-")
            .tempdir()
            .map_err(|e| {
                ConnectionError::new(&host, ConnectFailure::Unreachable, format!("control directory: {}", e))
            })?;
        let control_path = control_dir.path().join("ctl");

        let mut master = self
            .master_command(credential, &control_path, timeout)
            .spawn()
            .map_err(|e| {
                // a missing local binary is not a rejected credential
                let program = match credential {
                    Credential::Password { .. } => &self.options.sshpass_program,
                    _ => &self.options.ssh_program,
                };
                ConnectionError::new(
                    &host,
                    ConnectFailure::Unreachable,
                    format!("failed to spawn {}: {}", program.display(), e),
                )
            })?;

        let stderr_task = master
            .stderr
            .take()
            .map(|stderr| spawn_line_collector(stderr, host.clone(), "master"));

        let deadline = Instant::now() + timeout;
        loop {
            match master.try_wait() {
                Ok(Some(status)) => {
                    let stderr = match stderr_task {
                        Some(task) => task.await.unwrap_or_default(),
                        None => String::new(),
                    };
                    let reason = classify_failure(
                        &stderr,
                        status.code(),
                        matches!(credential, Credential::Password { .. }),
                    );
                    return Err(ConnectionError::new(&host, reason, first_line_or(&stderr, "ssh exited")));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(ConnectionError::new(&host, ConnectFailure::Unreachable, e.to_string()));
                }
            }

            if self.master_ready(&target, &control_path).await {
                break;
            }

            if Instant::now() >= deadline {
                master.kill().await.ok();
                return Err(ConnectionError::new(
                    &host,
                    ConnectFailure::Timeout,
                    format!("no session after {}s", timeout.as_secs()),
                ));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        debug!(host = %host, "ControlMaster ready");
        Ok(Box::new(OpenSshSession {
            ssh_program: self.options.ssh_program.clone(),
            target,
            control_path,
            master: Some(master),
            master_stderr: stderr_task,
            _control_dir: control_dir,
        }))
    }
}

/// Session multiplexed over a ControlMaster
pub struct OpenSshSession {
    ssh_program: PathBuf,
    target: SshTarget,
    control_path: PathBuf,
    master: Option<Child>,
    master_stderr: Option<JoinHandle<String>>,
    // Removed (with the control socket) on drop
    _control_dir: TempDir,
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
        visibility: Visibility,
    ) -> Result<CommandOutput, CommandError> {
        let mut cmd = Command::new(&self.ssh_program);
        cmd.arg("-S")
            .arg(&self.control_path)
            .args([
                "-o",
                "ControlMaster=no",
                "-o",
                "BatchMode=yes",
                "-T",
                "-p",
                &self.target.port.to_string(),
                "--",
            ])
            .arg(self.target.destination())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| CommandError::Spawn {
            detail: e.to_string(),
        })?;

        let host = self.target.host.clone();
        let (stdout_task, stderr_task) = match visibility {
            Visibility::Logged => (
                child.stdout.take().map(|s| spawn_line_collector(s, host.clone(), "stdout")),
                child.stderr.take().map(|s| spawn_line_collector(s, host.clone(), "stderr")),
            ),
            Visibility::Redacted => (
                child.stdout.take().map(spawn_quiet_collector),
                child.stderr.take().map(spawn_quiet_collector),
            ),
        };

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(CommandError::Disconnected {
                    detail: e.to_string(),
                })
            }
            Err(_) => {
                child.kill().await.ok();
                warn!(host = %host, "Command timed out after {}s", timeout.as_secs());
                return Err(CommandError::Timeout { after: timeout });
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let exit_status = status.code().unwrap_or(-1);
        if exit_status == SSH_ERROR_STATUS && is_transport_failure(&stderr) {
            return Err(CommandError::Disconnected {
                detail: first_line_or(&stderr, "ssh transport failure"),
            });
        }

        Ok(CommandOutput {
            exit_status,
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    async fn shutdown(&mut self) {
        let Some(mut master) = self.master.take() else {
            return;
        };

        let exit = Command::new(&self.ssh_program)
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit", "-p", &self.target.port.to_string(), "--"])
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        if tokio::time::timeout(Duration::from_secs(5), exit).await.is_err() {
            debug!(host = %self.target.host, "ControlMaster did not acknowledge exit");
        }

        master.kill().await.ok();
        if let Some(task) = self.master_stderr.take() {
            task.abort();
        }
    }
}

fn spawn_line_collector<R>(reader: R, host: String, stream: &'static str) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader_lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader_lines.next_line().await {
            debug!(host = %host, stream, "| {}", line);
            lines.push(line);
        }
        join_lines(lines)
    })
}

fn spawn_quiet_collector<R>(reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader_lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader_lines.next_line().await {
            lines.push(line);
        }
        join_lines(lines)
    })
}

fn join_lines(lines: Vec<String>) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

fn first_line_or(text: &str, fallback: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Classify why the ssh master exited before becoming ready
pub fn classify_failure(stderr: &str, exit_code: Option<i32>, via_sshpass: bool) -> ConnectFailure {
    if via_sshpass && exit_code == Some(SSHPASS_BAD_PASSWORD) {
        return ConnectFailure::AuthFailure;
    }

    let lower = stderr.to_lowercase();
    const AUTH_MARKERS: [&str; 6] = [
        "permission denied",
        "authentication failed",
        "too many authentication failures",
        "no more authentication methods",
        "host key verification failed",
        "incorrect password",
    ];
    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        return ConnectFailure::AuthFailure;
    }
    if lower.contains("timed out") {
        return ConnectFailure::Timeout;
    }
    ConnectFailure::Unreachable
}

/// Whether a 255 exit came from the transport rather than the remote command
fn is_transport_failure(stderr: &str) -> bool {
    const MARKERS: [&str; 6] = [
        "mux_client",
        "control socket connect",
        "connection closed by",
        "connection reset",
        "broken pipe",
        "connection to ",
    ];
    let lower = stderr.to_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}
