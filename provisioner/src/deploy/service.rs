//! Service definition and systemd unit rendering

use std::collections::BTreeMap;
use std::time::Duration;

use crate::utils::shell_quote;

/// Default compose file, relative to the checkout
pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";

/// Directory holding installed unit files
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// How the deployed application runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRuntime {
    /// `docker compose up -d` from the checkout
    Compose { file: String },

    /// A long-running command started from the checkout
    Command { exec_start: String },
}

impl ServiceRuntime {
    pub fn uses_docker(&self) -> bool {
        matches!(self, ServiceRuntime::Compose { .. })
    }

    pub fn compose_file(&self) -> Option<&str> {
        match self {
            ServiceRuntime::Compose { file } => Some(file),
            ServiceRuntime::Command { .. } => None,
        }
    }
}

impl Default for ServiceRuntime {
    fn default() -> Self {
        ServiceRuntime::Compose {
            file: DEFAULT_COMPOSE_FILE.to_string(),
        }
    }
}

/// Service settings
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// systemd unit name without `.service`; derived from the repository when unset
    pub name: Option<String>,

    pub runtime: ServiceRuntime,

    /// Extra readiness probe, run from the checkout after the unit is active
    pub health_command: Option<String>,

    /// Upper bound on waiting for the service to become healthy
    pub health_timeout: Duration,

    /// Delay between health probes
    pub health_interval: Duration,

    /// Environment for the service process
    pub environment: BTreeMap<String, String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: None,
            runtime: ServiceRuntime::default(),
            health_command: None,
            health_timeout: Duration::from_secs(120),
            health_interval: Duration::from_secs(3),
            environment: BTreeMap::new(),
        }
    }
}

impl ServiceSettings {
    /// Unit name for a repository
    pub fn unit_name(&self, repo_name: &str) -> String {
        let raw = self.name.as_deref().unwrap_or(repo_name);
        sanitize_unit_name(raw)
    }

    /// Probe run after `systemctl is-active` succeeds, if any
    pub fn effective_health_command(&self) -> Option<String> {
        if let Some(cmd) = &self.health_command {
            return Some(cmd.clone());
        }
        self.runtime.compose_file().map(|file| {
            format!(
                "$SUDO docker compose -f {} ps --status running --quiet | grep -q .",
                shell_quote(file)
            )
        })
    }
}

/// Full path of an installed unit
pub fn unit_path(unit_name: &str) -> String {
    format!("{}/{}.service", SYSTEMD_UNIT_DIR, unit_name)
}

fn sanitize_unit_name(raw: &str) -> String {
    let name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let name = name.trim_matches('-');
    if name.is_empty() {
        "app".to_string()
    } else {
        name.to_string()
    }
}

/// Render the systemd unit for the service.
///
/// `user` is the login user; units for non-root users run as that user
/// unless the runtime is compose (the docker daemon does the work).
pub fn render_unit(
    settings: &ServiceSettings,
    unit_name: &str,
    working_dir: &str,
    user: &str,
) -> String {
    let mut unit = String::new();
    unit.push_str("[Unit]\n");
    unit.push_str(&format!("Description={} (managed by vmprov)\n", unit_name));

    match &settings.runtime {
        ServiceRuntime::Compose { file } => {
            unit.push_str("Requires=docker.service\n");
            unit.push_str("After=docker.service network-online.target\n");
            unit.push_str("Wants=network-online.target\n\n");
            unit.push_str("[Service]\n");
            unit.push_str("Type=oneshot\n");
            unit.push_str("RemainAfterExit=yes\n");
            unit.push_str(&format!("WorkingDirectory={}\n", working_dir));
            push_environment(&mut unit, &settings.environment);
            unit.push_str(&format!(
                "ExecStart=/usr/bin/env docker compose -f {} up -d --remove-orphans\n",
                file
            ));
            unit.push_str(&format!(
                "ExecStop=/usr/bin/env docker compose -f {} down\n",
                file
            ));
            unit.push_str("TimeoutStartSec=0\n");
        }
        ServiceRuntime::Command { exec_start } => {
            unit.push_str("After=network-online.target\n");
            unit.push_str("Wants=network-online.target\n\n");
            unit.push_str("[Service]\n");
            unit.push_str("Type=simple\n");
            if user != "root" {
                unit.push_str(&format!("User={}\n", user));
            }
            unit.push_str(&format!("WorkingDirectory={}\n", working_dir));
            push_environment(&mut unit, &settings.environment);
            unit.push_str(&format!(
                "ExecStart=/bin/sh -c {}\n",
                shell_quote(exec_start)
            ));
            unit.push_str("Restart=on-failure\n");
            unit.push_str("RestartSec=3\n");
        }
    }

    unit.push_str("\n[Install]\n");
    unit.push_str("WantedBy=multi-user.target\n");
    unit
}

fn push_environment(unit: &mut String, environment: &BTreeMap<String, String>) {
    for (key, value) in environment {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        unit.push_str(&format!("Environment=\"{}={}\"\n", key, escaped));
    }
}
