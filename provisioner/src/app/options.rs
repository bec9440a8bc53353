//! Application configuration options
//!
//! Command line arguments override the settings file, which overrides
//! defaults. Credentials come from the environment and the settings file.

use std::path::PathBuf;
use std::time::Duration;

use crate::app::cli::CliArgs;
use crate::authn::credential::CredentialFields;
use crate::authn::env::{
    credentials_from_vars, registry_login_from_vars, repository_access_from_vars,
};
use crate::deploy::procedure::ProcedureSettings;
use crate::deploy::steps::default_baseline;
use crate::errors::ProvisionError;
use crate::logs::{LogLevel, LogOptions};
use crate::models::repository::RepositoryRef;
use crate::orchestrator::run::OrchestratorOptions;
use crate::ssh::connection::ConnectOptions;
use crate::ssh::openssh::OpenSshOptions;
use crate::storage::settings::{Settings, TargetSettings};

/// Default credential environment prefix
pub const DEFAULT_ENV_PREFIX: &str = "SSH";

/// Everything one run needs
#[derive(Debug)]
pub struct AppOptions {
    pub repository: RepositoryRef,

    /// Hosts in input order: environment sets first, then settings file targets
    pub targets: Vec<CredentialFields>,

    pub orchestrator: OrchestratorOptions,

    pub procedure: ProcedureSettings,

    pub ssh: OpenSshOptions,

    /// Where to write the JSON run report
    pub report_file: Option<PathBuf>,
}

impl AppOptions {
    /// Merge command line arguments, settings and environment variables
    pub fn resolve<F>(cli: &CliArgs, settings: Settings, lookup: F) -> Result<Self, ProvisionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = cli
            .get("repo")
            .map(str::to_string)
            .or(settings.repository.url.clone())
            .ok_or_else(|| {
                ProvisionError::ConfigError("No repository given (use --repo=<url>)".to_string())
            })?;
        let branch = cli
            .get("branch")
            .map(str::to_string)
            .or(settings.repository.branch.clone());
        let install_path = cli
            .get("install-path")
            .map(str::to_string)
            .or(settings.repository.install_path.clone());

        let mut repository = RepositoryRef::new(&url, branch, install_path)?;
        if let Some(access) = repository_access_from_vars(&lookup) {
            repository = repository.with_access(access);
        }

        let prefixes = cli
            .list("env-prefix")
            .unwrap_or_else(|| vec![DEFAULT_ENV_PREFIX.to_string()]);
        let mut targets: Vec<CredentialFields> = prefixes
            .iter()
            .flat_map(|prefix| credentials_from_vars(prefix, &lookup))
            .collect();
        targets.extend(settings.targets.into_iter().map(TargetSettings::into_fields));

        let orchestrator = OrchestratorOptions {
            max_parallel: cli
                .parse_value("parallel")?
                .or(settings.max_parallel)
                .unwrap_or(1)
                .max(1),
            connect: ConnectOptions {
                connect_timeout: Duration::from_secs(settings.timeouts.connect_secs),
                command_timeout: Duration::from_secs(settings.timeouts.command_secs),
            },
            connect_attempts: cli
                .parse_value("connect-attempts")?
                .or(settings.connect_attempts)
                .unwrap_or(1)
                .max(1),
            ..Default::default()
        };

        let service = settings.service.to_service_settings()?;
        let mut baseline = default_baseline(&service.runtime);
        baseline.extend(settings.baseline.into_iter().map(Into::into));
        let procedure = ProcedureSettings {
            baseline,
            service,
            registry: registry_login_from_vars(&lookup),
            ..Default::default()
        };

        Ok(Self {
            repository,
            targets,
            orchestrator,
            procedure,
            ssh: settings.ssh.to_options(),
            report_file: cli.get("report").map(PathBuf::from),
        })
    }
}

/// Logging options from the command line and settings
pub fn log_options(cli: &CliArgs, settings: &Settings) -> Result<LogOptions, ProvisionError> {
    Ok(LogOptions {
        log_level: cli
            .parse_value::<LogLevel>("log-level")?
            .unwrap_or_else(|| settings.log_level.clone()),
        log_file: cli
            .get("log-file")
            .map(PathBuf::from)
            .or(settings.log_file.clone()),
        json_format: cli.flag("json-logs"),
        ..Default::default()
    })
}
