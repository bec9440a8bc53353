//! The standard deployment steps

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use secrecy::ExposeSecret;
use tracing::debug;

use crate::deploy::procedure::{StepContext, StepReport, Step};
use crate::deploy::service::{render_unit, unit_path, ServiceRuntime};
use crate::errors::StepError;
use crate::ssh::connection::Connection;
use crate::ssh::{privileged_script, script};
use crate::utils::{sha256_hash, shell_quote};

pub const STEP_BASELINE: &str = "baseline";
pub const STEP_SYNC: &str = "sync";
pub const STEP_DEPENDENCIES: &str = "dependencies";
pub const STEP_CONFIGURE: &str = "configure";
pub const STEP_SERVICE: &str = "service";

// =============================== BASELINE ================================== //

/// A tool required on the host, with how to detect and install it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineTool {
    pub name: String,

    /// Exits zero when the tool is present
    pub check: String,

    /// Installs the tool; `$SUDO` is available
    pub install: String,
}

/// Package-manager agnostic install of distribution packages
fn package_install(packages: &str) -> String {
    format!(
        "if command -v apt-get >/dev/null 2>&1; then \
         $SUDO apt-get update -qq && $SUDO env DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {p}; \
         elif command -v dnf >/dev/null 2>&1; then $SUDO dnf install -y -q {p}; \
         elif command -v yum >/dev/null 2>&1; then $SUDO yum install -y -q {p}; \
         elif command -v apk >/dev/null 2>&1; then $SUDO apk add --no-cache {p}; \
         else echo 'no supported package manager' >&2; exit 100; fi",
        p = packages
    )
}

/// Baseline tools for a runtime
pub fn default_baseline(runtime: &ServiceRuntime) -> Vec<BaselineTool> {
    let mut tools = vec![BaselineTool {
        name: "git".to_string(),
        check: "command -v git >/dev/null 2>&1".to_string(),
        install: package_install("git"),
    }];
    if runtime.uses_docker() {
        tools.push(BaselineTool {
            name: "docker".to_string(),
            check: "command -v docker >/dev/null 2>&1 && docker compose version >/dev/null 2>&1"
                .to_string(),
            install: format!(
                "{} && curl -fsSL https://get.docker.com | $SUDO sh && $SUDO systemctl enable --now docker",
                package_install("curl")
            ),
        });
    }
    tools
}

/// Ensures baseline tools are present, installing only the missing ones
pub struct BaselineStep;

impl BaselineStep {
    async fn missing<'t>(
        conn: &mut Connection,
        tools: &'t [BaselineTool],
        timeout: Duration,
    ) -> Result<Vec<&'t BaselineTool>, StepError> {
        let mut missing = Vec::new();
        for tool in tools {
            let out = conn
                .run(&script(&format!("check {}", tool.name), &tool.check), timeout)
                .await?;
            if !out.success() {
                missing.push(tool);
            }
        }
        Ok(missing)
    }
}

#[async_trait]
impl Step for BaselineStep {
    fn name(&self) -> &'static str {
        STEP_BASELINE
    }

    async fn apply(
        &self,
        conn: &mut Connection,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepReport, StepError> {
        let tools = &ctx.settings.baseline;
        let missing = Self::missing(conn, tools, ctx.timeout).await?;
        if missing.is_empty() {
            return Ok(StepReport::unchanged("baseline already satisfied"));
        }

        let names: Vec<&str> = missing.iter().map(|t| t.name.as_str()).collect();
        debug!(host = %conn.host(), missing = ?names, "Installing baseline tools");

        let mut report = StepReport::changed(format!("installed {}", names.join(", ")));
        for tool in &missing {
            let out = conn
                .run(
                    &privileged_script(&format!("install {}", tool.name), &tool.install),
                    ctx.timeout,
                )
                .await?;
            report.absorb(&out);
            if !out.success() {
                report.exit_status = out.exit_status;
                report.summary = format!("installing {} failed", tool.name);
                return Ok(report);
            }
        }

        let still_missing = Self::missing(conn, tools, ctx.timeout).await?;
        if let Some(tool) = still_missing.first() {
            report.exit_status = 1;
            report.summary = format!("{} still missing after install", tool.name);
        }
        Ok(report)
    }
}

// ================================= SYNC ==================================== //

/// Clones or refreshes the repository checkout
pub struct SyncStep;

#[async_trait]
impl Step for SyncStep {
    fn name(&self) -> &'static str {
        STEP_SYNC
    }

    async fn apply(
        &self,
        conn: &mut Connection,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepReport, StepError> {
        let synced = conn.transfer_or_sync(ctx.repo, ctx.timeout).await?;
        let changed = synced.outcome.changed();
        let summary = synced.outcome.summary();

        ctx.state.commit = Some(synced.outcome.commit().to_string());
        ctx.state.checkout = Some(synced.path);

        Ok(if changed {
            StepReport::changed(summary)
        } else {
            StepReport::unchanged(summary)
        })
    }
}

// ============================== DEPENDENCIES =============================== //

/// Dependency manifest kinds, in detection priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Compose,
    NpmLock,
    Npm,
    Pip,
}

impl ManifestKind {
    fn label(&self) -> &'static str {
        match self {
            ManifestKind::Compose => "docker compose",
            ManifestKind::NpmLock => "npm ci",
            ManifestKind::Npm => "npm install",
            ManifestKind::Pip => "pip",
        }
    }
}

/// Pick the manifest kind from the files present in the checkout
pub fn detect_manifest(
    runtime: &ServiceRuntime,
    present: &[String],
) -> Option<(ManifestKind, Vec<String>)> {
    let has = |f: &str| present.iter().any(|p| p == f);

    if let Some(file) = runtime.compose_file() {
        if has(file) {
            return Some((ManifestKind::Compose, vec![file.to_string()]));
        }
    }
    if has("package-lock.json") {
        return Some((
            ManifestKind::NpmLock,
            vec!["package.json".to_string(), "package-lock.json".to_string()],
        ));
    }
    if has("package.json") {
        return Some((ManifestKind::Npm, vec!["package.json".to_string()]));
    }
    if has("requirements.txt") {
        return Some((ManifestKind::Pip, vec!["requirements.txt".to_string()]));
    }
    None
}

fn install_command(kind: ManifestKind, runtime: &ServiceRuntime) -> String {
    match kind {
        ManifestKind::Compose => {
            let file = shell_quote(runtime.compose_file().unwrap_or_default());
            format!(
                "$SUDO docker compose -f {f} pull --quiet --ignore-buildable && $SUDO docker compose -f {f} build",
                f = file
            )
        }
        ManifestKind::NpmLock => "npm ci".to_string(),
        ManifestKind::Npm => "npm install".to_string(),
        ManifestKind::Pip => {
            "python3 -m venv .venv && .venv/bin/pip install --quiet -r requirements.txt".to_string()
        }
    }
}

/// Installs project dependencies when the manifests changed since the last install
pub struct DependenciesStep;

#[async_trait]
impl Step for DependenciesStep {
    fn name(&self) -> &'static str {
        STEP_DEPENDENCIES
    }

    async fn apply(
        &self,
        conn: &mut Connection,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepReport, StepError> {
        let dir = ctx.checkout_dir();
        let runtime = &ctx.settings.service.runtime;

        let mut candidates = vec![
            "package-lock.json".to_string(),
            "package.json".to_string(),
            "requirements.txt".to_string(),
        ];
        if let Some(file) = runtime.compose_file() {
            candidates.insert(0, file.to_string());
        }
        let quoted: Vec<String> = candidates.iter().map(|c| shell_quote(c)).collect();
        let detect = format!(
            "cd {dir} && for f in {}; do [ -f \"$f\" ] && echo \"$f\"; done; true",
            quoted.join(" ")
        );
        let out = conn.run(&script("deps-detect", detect), ctx.timeout).await?;
        if !out.success() {
            return Ok(StepReport::from_output(out, false, "checkout not readable"));
        }
        let present: Vec<String> = out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let Some((kind, manifests)) = detect_manifest(runtime, &present) else {
            if let Some(file) = runtime.compose_file() {
                let mut report = StepReport::unchanged(format!("compose file {} not found", file));
                report.exit_status = 1;
                return Ok(report);
            }
            return Ok(StepReport::unchanged("no dependency manifest found"));
        };

        // Compose builds depend on the whole tree, so the commit is part of the fingerprint
        let files: Vec<String> = manifests.iter().map(|m| shell_quote(m)).collect();
        let include_head = if kind == ManifestKind::Compose {
            "; git rev-parse HEAD 2>/dev/null"
        } else {
            ""
        };
        let stamp_dir = ctx.stamp_dir();
        let fingerprint = format!(
            "cd {dir} && {{ cat -- {}{include_head}; }} | sha256sum | cut -d' ' -f1\n\
             cat {stamp_dir}/deps.sha256 2>/dev/null || true",
            files.join(" "),
        );
        let out = conn
            .run(&script("deps-fingerprint", fingerprint), ctx.timeout)
            .await?;
        if !out.success() {
            return Ok(StepReport::from_output(out, false, "cannot fingerprint manifests"));
        }
        let mut lines = out.stdout.lines().map(str::trim);
        let current = lines.next().unwrap_or_default().to_string();
        let recorded = lines.next().unwrap_or_default();
        if !current.is_empty() && current == recorded {
            return Ok(StepReport::unchanged(format!(
                "dependencies already match ({})",
                kind.label()
            )));
        }

        let mut report = StepReport::changed(format!("installed dependencies ({})", kind.label()));

        if kind == ManifestKind::Compose {
            if let Some(login) = &ctx.settings.registry {
                let server = login
                    .server
                    .as_deref()
                    .map(|s| format!(" {}", shell_quote(s)))
                    .unwrap_or_default();
                let body = format!(
                    "printf %s '{}' | base64 -d | $SUDO docker login{} -u {} --password-stdin",
                    BASE64.encode(login.password.expose_secret()),
                    server,
                    shell_quote(&login.username)
                );
                let out = conn
                    .run_sensitive(&privileged_script("registry-login", body), ctx.timeout)
                    .await?;
                if !out.success() {
                    report.exit_status = out.exit_status;
                    report.summary = "registry login failed".to_string();
                    return Ok(report);
                }
            }
        }

        let install = format!("cd {dir} && {}", install_command(kind, runtime));
        let out = conn
            .run(&privileged_script("deps-install", install), ctx.timeout)
            .await?;
        report.absorb(&out);
        if !out.success() {
            report.exit_status = out.exit_status;
            report.summary = format!("dependency install failed ({})", kind.label());
            return Ok(report);
        }

        let stamp = format!(
            "mkdir -p {stamp_dir} && printf '%s\\n' {} > {stamp_dir}/deps.sha256",
            shell_quote(&current)
        );
        let out = conn.run(&script("deps-stamp", stamp), ctx.timeout).await?;
        if !out.success() {
            report.absorb(&out);
            report.exit_status = out.exit_status;
            report.summary = "cannot record dependency fingerprint".to_string();
        }
        Ok(report)
    }
}

// =============================== CONFIGURE ================================= //

/// Installs the systemd unit when its content differs from the rendered one
pub struct ConfigureStep;

#[async_trait]
impl Step for ConfigureStep {
    fn name(&self) -> &'static str {
        STEP_CONFIGURE
    }

    async fn apply(
        &self,
        conn: &mut Connection,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepReport, StepError> {
        let unit_name = ctx.unit_name();
        let path = unit_path(&unit_name);
        let working_dir = ctx
            .state
            .checkout
            .clone()
            .unwrap_or_else(|| ctx.repo.install_path().to_string());
        let unit = render_unit(&ctx.settings.service, &unit_name, &working_dir, ctx.user);
        let desired = sha256_hash(unit.as_bytes());

        let probe = format!(
            "sha256sum {p} 2>/dev/null | cut -d' ' -f1\n\
             systemctl is-enabled {n}.service 2>/dev/null || true",
            p = shell_quote(&path),
            n = shell_quote(&unit_name),
        );
        let out = conn.run(&script("unit-state", probe), ctx.timeout).await?;
        let mut lines = out.stdout.lines().map(str::trim).filter(|l| !l.is_empty());
        let installed = lines.next().unwrap_or_default();
        let enabled = lines.next() == Some("enabled");

        let content_changed = installed != desired;
        if !content_changed && enabled {
            return Ok(StepReport::unchanged(format!("{} already configured", path)));
        }

        let mut report = StepReport::changed(if content_changed {
            format!("configuration changed: {}", path)
        } else {
            format!("enabled {}", unit_name)
        });

        if content_changed {
            let out = conn.write_file(&path, unit.as_bytes(), 0o644, true).await?;
            report.absorb(&out);
            if !out.success() {
                report.exit_status = out.exit_status;
                report.summary = format!("cannot write {}", path);
                return Ok(report);
            }
        }

        let reload = format!(
            "$SUDO systemctl daemon-reload && $SUDO systemctl enable --quiet {}.service",
            shell_quote(&unit_name)
        );
        let out = conn
            .run(&privileged_script("unit-reload", reload), ctx.timeout)
            .await?;
        report.absorb(&out);
        if !out.success() {
            report.exit_status = out.exit_status;
            report.summary = format!("cannot enable {}", unit_name);
        }
        Ok(report)
    }
}

// ================================ SERVICE ================================== //

/// Starts or restarts the service as needed, then waits for it to be healthy
pub struct ServiceStep;

#[async_trait]
impl Step for ServiceStep {
    fn name(&self) -> &'static str {
        STEP_SERVICE
    }

    async fn apply(
        &self,
        conn: &mut Connection,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepReport, StepError> {
        let unit_name = ctx.unit_name();
        let unit = format!("{}.service", shell_quote(&unit_name));
        let service = &ctx.settings.service;

        let out = conn
            .run(
                &script("service-state", format!("systemctl is-active {} || true", unit)),
                ctx.timeout,
            )
            .await?;
        let active = out.first_line() == "active";

        let action = if !active {
            Some(("service-start", "start", "started"))
        } else if ctx.state.needs_restart() {
            Some(("service-restart", "restart", "restarted"))
        } else {
            None
        };

        let mut report = StepReport::unchanged("already running");
        if let Some((op, verb, done)) = action {
            let out = conn
                .run(
                    &privileged_script(op, format!("$SUDO systemctl {} {}", verb, unit)),
                    ctx.timeout,
                )
                .await?;
            report.absorb(&out);
            report.changed = true;
            report.summary = if verb == "restart" {
                format!("{} ({} changed)", done, ctx.state.changed_steps.join(", "))
            } else {
                done.to_string()
            };
            if !out.success() {
                report.exit_status = out.exit_status;
                report.summary = format!("systemctl {} {} failed", verb, unit_name);
                return Ok(report);
            }
        }

        let mut probe = format!("systemctl is-active --quiet {}", unit);
        if let Some(health) = service.effective_health_command() {
            probe.push_str(&format!(" && cd {} && {}", ctx.checkout_dir(), health));
        }
        let probe = privileged_script("health-check", probe);

        let deadline = Instant::now() + service.health_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let out = conn
                .run(&probe, remaining.max(Duration::from_secs(1)).min(ctx.timeout))
                .await?;
            if out.success() {
                report.summary.push_str("; healthy");
                return Ok(report);
            }
            if Instant::now() + service.health_interval >= deadline {
                report.absorb(&out);
                report.exit_status = if out.exit_status == 0 { 1 } else { out.exit_status };
                report.summary = format!(
                    "{} not healthy after {}s",
                    unit_name,
                    service.health_timeout.as_secs()
                );
                return Ok(report);
            }
            tokio::time::sleep(service.health_interval).await;
        }
    }
}
