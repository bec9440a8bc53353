//! Settings file management

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::authn::credential::CredentialFields;
use crate::deploy::service::{ServiceRuntime, ServiceSettings, DEFAULT_COMPOSE_FILE};
use crate::deploy::steps::BaselineTool;
use crate::errors::ProvisionError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::ssh::openssh::OpenSshOptions;

/// Provisioner settings, read from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Repository to deploy
    #[serde(default)]
    pub repository: RepositorySettings,

    /// Hosts to provision, in addition to those found in the environment
    #[serde(default)]
    pub targets: Vec<TargetSettings>,

    /// Hosts provisioned at the same time
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Connection attempts per host
    #[serde(default)]
    pub connect_attempts: Option<u32>,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub service: ServiceFileSettings,

    /// Extra tools installed after the defaults
    #[serde(default)]
    pub baseline: Vec<BaselineToolSettings>,

    #[serde(default)]
    pub ssh: SshSettings,
}

impl Settings {
    /// Read the settings file
    pub async fn load(path: &Path) -> Result<Self, ProvisionError> {
        File::new(path).read_json::<Settings>().await.map_err(|e| {
            ProvisionError::ConfigError(format!(
                "Unable to read settings file {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Repository settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositorySettings {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default)]
    pub install_path: Option<String>,
}

/// A port given either as a number or a string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSetting {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for PortSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortSetting::Number(n) => write!(f, "{}", n),
            PortSetting::Text(s) => f.write_str(s),
        }
    }
}

/// One target host.
///
/// The password is only held long enough to build the credential; it is
/// never written back.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TargetSettings {
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(default)]
    pub port: Option<PortSetting>,
}

impl std::fmt::Debug for TargetSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetSettings")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("identity_file", &self.identity_file)
            .field("port", &self.port)
            .finish()
    }
}

impl TargetSettings {
    pub fn into_fields(self) -> CredentialFields {
        CredentialFields {
            hostname: self.hostname,
            username: self.username,
            password: self.password.map(SecretString::from),
            identity_file: self.identity_file,
            port: self.port.map(|p| p.to_string()),
        }
    }
}

/// Timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_secs: u64,
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_command_timeout() -> u64 {
    900
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            command_secs: default_command_timeout(),
        }
    }
}

/// Runtime kind in the settings file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Compose,
    Command,
}

/// Service settings as written in the settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceFileSettings {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeKind,

    #[serde(default = "default_compose_file")]
    pub compose_file: String,

    /// Required for the command runtime
    #[serde(default)]
    pub exec_start: Option<String>,

    #[serde(default)]
    pub health_command: Option<String>,

    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_compose_file() -> String {
    DEFAULT_COMPOSE_FILE.to_string()
}

fn default_health_timeout() -> u64 {
    120
}

fn default_health_interval() -> u64 {
    3
}

impl Default for ServiceFileSettings {
    fn default() -> Self {
        Self {
            name: None,
            runtime: RuntimeKind::default(),
            compose_file: default_compose_file(),
            exec_start: None,
            health_command: None,
            health_timeout_secs: default_health_timeout(),
            health_interval_secs: default_health_interval(),
            environment: BTreeMap::new(),
        }
    }
}

impl ServiceFileSettings {
    pub fn to_service_settings(&self) -> Result<ServiceSettings, ProvisionError> {
        let runtime = match self.runtime {
            RuntimeKind::Compose => ServiceRuntime::Compose {
                file: self.compose_file.clone(),
            },
            RuntimeKind::Command => match self.exec_start.as_deref().map(str::trim) {
                Some(cmd) if !cmd.is_empty() => ServiceRuntime::Command {
                    exec_start: cmd.to_string(),
                },
                _ => {
                    return Err(ProvisionError::ConfigError(
                        "service.exec_start is required for the command runtime".to_string(),
                    ))
                }
            },
        };

        Ok(ServiceSettings {
            name: self.name.clone(),
            runtime,
            health_command: self.health_command.clone(),
            health_timeout: Duration::from_secs(self.health_timeout_secs),
            health_interval: Duration::from_secs(self.health_interval_secs.max(1)),
            environment: self.environment.clone(),
        })
    }
}

/// An extra baseline tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineToolSettings {
    pub name: String,
    pub check: String,
    pub install: String,
}

impl From<BaselineToolSettings> for BaselineTool {
    fn from(tool: BaselineToolSettings) -> Self {
        BaselineTool {
            name: tool.name,
            check: tool.check,
            install: tool.install,
        }
    }
}

/// ssh client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_ssh_program")]
    pub program: PathBuf,

    #[serde(default = "default_sshpass_program")]
    pub sshpass_program: PathBuf,

    #[serde(default = "default_host_key_checking")]
    pub strict_host_key_checking: String,

    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,

    /// Extra `-o` options
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_ssh_program() -> PathBuf {
    PathBuf::from("ssh")
}

fn default_sshpass_program() -> PathBuf {
    PathBuf::from("sshpass")
}

fn default_host_key_checking() -> String {
    "accept-new".to_string()
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            program: default_ssh_program(),
            sshpass_program: default_sshpass_program(),
            strict_host_key_checking: default_host_key_checking(),
            known_hosts_file: None,
            options: Vec::new(),
        }
    }
}

impl SshSettings {
    pub fn to_options(&self) -> OpenSshOptions {
        OpenSshOptions {
            ssh_program: self.program.clone(),
            sshpass_program: self.sshpass_program.clone(),
            strict_host_key_checking: self.strict_host_key_checking.clone(),
            known_hosts_file: self.known_hosts_file.clone(),
            extra_options: self.options.clone(),
            ..Default::default()
        }
    }
}
