//! Repository transfer and in-place refresh

use std::time::Duration;

use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::TransferError;
use crate::models::repository::RepositoryRef;
use crate::ssh::connection::Connection;
use crate::ssh::script;
use crate::ssh::session::CommandOutput;
use crate::utils::{shell_quote, shell_quote_path};

/// What `transfer_or_sync` did to the checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum SyncOutcome {
    Cloned { commit: String },
    Updated { from: String, to: String },
    UpToDate { commit: String },
}

impl SyncOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, SyncOutcome::UpToDate { .. })
    }

    pub fn commit(&self) -> &str {
        match self {
            SyncOutcome::Cloned { commit } | SyncOutcome::UpToDate { commit } => commit,
            SyncOutcome::Updated { to, .. } => to,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            SyncOutcome::Cloned { commit } => format!("cloned at {}", short(commit)),
            SyncOutcome::Updated { from, to } => {
                format!("updated {} -> {}", short(from), short(to))
            }
            SyncOutcome::UpToDate { commit } => {
                format!("already up to date at {}", short(commit))
            }
        }
    }
}

/// Checkout location and what happened to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    /// Absolute path of the checkout on the remote host
    pub path: String,
    pub outcome: SyncOutcome,
}

/// State of the install path before syncing
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathState {
    Missing,
    EmptyDir,
    Checkout { origin: String },
    NonEmptyDir,
    File,
}

impl Connection {
    /// Place the repository at its install path, or refresh an existing
    /// checkout of the same repository in place.
    ///
    /// Unrelated content at the install path is never overwritten.
    pub async fn transfer_or_sync(
        &mut self,
        repo: &RepositoryRef,
        timeout: Duration,
    ) -> Result<SyncResult, TransferError> {
        let path = repo.install_path();
        let quoted = shell_quote_path(path);

        let state = self.probe_path(&quoted, timeout).await?;
        debug!(host = %self.host(), path, state = ?state, "Probed install path");

        let outcome = match state {
            PathState::Missing | PathState::EmptyDir => {
                let commit = self.clone_repo(repo, &quoted, timeout).await?;
                SyncOutcome::Cloned { commit }
            }
            PathState::Checkout { origin } if repo.matches_remote(&origin) => {
                self.refresh_checkout(repo, &quoted, timeout).await?
            }
            PathState::Checkout { origin } => {
                return Err(TransferError::UnrelatedContent {
                    path: path.to_string(),
                    found: format!("checkout of {}", origin),
                })
            }
            PathState::NonEmptyDir => {
                return Err(TransferError::UnrelatedContent {
                    path: path.to_string(),
                    found: "non-empty directory that is not a git checkout".to_string(),
                })
            }
            PathState::File => {
                return Err(TransferError::UnrelatedContent {
                    path: path.to_string(),
                    found: "a file".to_string(),
                })
            }
        };

        let resolved = self
            .run(
                &script("checkout-path", format!("cd {} && pwd -P", quoted)),
                timeout,
            )
            .await?;
        let abs_path = git_ok("resolve path", resolved)?
            .first_line()
            .to_string();

        info!(host = %self.host(), path = %abs_path, "{}", outcome.summary());
        Ok(SyncResult {
            path: abs_path,
            outcome,
        })
    }

    async fn probe_path(
        &mut self,
        quoted: &str,
        timeout: Duration,
    ) -> Result<PathState, TransferError> {
        let body = format!(
            "P={quoted}\n\
             if [ ! -e \"$P\" ]; then echo missing\n\
             elif [ -d \"$P\" ] && [ -z \"$(ls -A \"$P\")\" ]; then echo empty\n\
             elif [ -e \"$P/.git\" ]; then echo checkout; git -C \"$P\" config --get remote.origin.url || true\n\
             elif [ -d \"$P\" ]; then echo dir\n\
             else echo file; fi"
        );
        let out = self.run(&script("probe-checkout", body), timeout).await?;
        let out = git_ok("probe", out)?;

        let mut lines = out.stdout.lines().map(str::trim);
        let state = match lines.next().unwrap_or_default() {
            "missing" => PathState::Missing,
            "empty" => PathState::EmptyDir,
            "checkout" => PathState::Checkout {
                origin: lines.next().unwrap_or_default().to_string(),
            },
            "dir" => PathState::NonEmptyDir,
            _ => PathState::File,
        };
        Ok(state)
    }

    async fn clone_repo(
        &mut self,
        repo: &RepositoryRef,
        quoted: &str,
        timeout: Duration,
    ) -> Result<String, TransferError> {
        // `--branch` takes only branch and tag names; any other ref is
        // checked out after a default clone
        let clone = match repo.branch() {
            Some(branch) => format!(
                "if git {auth}ls-remote --exit-code --heads --tags {url} {b} >/dev/null 2>&1; then\n\
                 git {auth}clone --quiet --branch {b} -- {url} \"$P\"\n\
                 else\n\
                 git {auth}clone --quiet -- {url} \"$P\"\n\
                 fi",
                auth = auth_config(repo),
                url = shell_quote(repo.url()),
                b = shell_quote(branch),
            ),
            None => format!(
                "git {auth}clone --quiet -- {url} \"$P\"",
                auth = auth_config(repo),
                url = shell_quote(repo.url()),
            ),
        };
        let body = format!(
            "P={quoted}\n\
             mkdir -p \"$(dirname \"$P\")\" && {{\n{clone}\n}}"
        );
        let out = self.run_git(repo, &script("git-clone", body), timeout).await?;
        git_ok("clone", out)?;

        if repo.branch().is_some() {
            return self.checkout_target(repo, quoted, timeout).await;
        }
        self.head(quoted, timeout)
            .await?
            .ok_or_else(|| TransferError::GitFailed {
                operation: "rev-parse".to_string(),
                exit_status: 1,
                stderr: "no commit checked out after clone".to_string(),
            })
    }

    async fn refresh_checkout(
        &mut self,
        repo: &RepositoryRef,
        quoted: &str,
        timeout: Duration,
    ) -> Result<SyncOutcome, TransferError> {
        let before = self.head(quoted, timeout).await?.unwrap_or_default();

        let fetch = format!(
            "git -C {quoted} {auth}fetch --quiet --prune --tags origin",
            auth = auth_config(repo),
        );
        let out = self.run_git(repo, &script("git-fetch", fetch), timeout).await?;
        git_ok("fetch", out)?;

        let target = self.checkout_target(repo, quoted, timeout).await?;
        Ok(if before == target {
            SyncOutcome::UpToDate { commit: target }
        } else {
            SyncOutcome::Updated {
                from: before,
                to: target,
            }
        })
    }

    /// Resolve the requested ref in the checkout and hard-reset to it.
    ///
    /// A branch resolves to `origin/<branch>`, a tag or commit to itself, and
    /// no ref to `origin/HEAD`.
    async fn checkout_target(
        &mut self,
        repo: &RepositoryRef,
        quoted: &str,
        timeout: Duration,
    ) -> Result<String, TransferError> {
        let resolve = match repo.branch() {
            Some(branch) => {
                let b = shell_quote(branch);
                format!(
                    "P={quoted}\n\
                     git -C \"$P\" rev-parse --verify --quiet \"refs/remotes/origin/\"{b}\"^{{commit}}\" \
                     || git -C \"$P\" rev-parse --verify --quiet {b}\"^{{commit}}\""
                )
            }
            None => format!(
                "P={quoted}\n\
                 git -C \"$P\" {auth}remote set-head origin --auto >/dev/null 2>&1\n\
                 git -C \"$P\" rev-parse --verify --quiet \"refs/remotes/origin/HEAD^{{commit}}\"",
                auth = auth_config(repo),
            ),
        };
        let out = self
            .run_git(repo, &script("git-resolve", resolve), timeout)
            .await?;
        let target = git_ok("resolve ref", out)?.first_line().to_string();
        if target.is_empty() {
            return Err(TransferError::GitFailed {
                operation: "resolve ref".to_string(),
                exit_status: 1,
                stderr: format!("ref '{}' not found", repo.branch().unwrap_or("HEAD")),
            });
        }

        let reset = format!(
            "git -C {quoted} reset --quiet --hard {}",
            shell_quote(&target)
        );
        let out = self.run(&script("git-reset", reset), timeout).await?;
        git_ok("reset", out)?;
        Ok(target)
    }

    async fn head(
        &mut self,
        quoted: &str,
        timeout: Duration,
    ) -> Result<Option<String>, TransferError> {
        let out = self
            .run(
                &script(
                    "git-head",
                    format!("git -C {} rev-parse --verify --quiet HEAD", quoted),
                ),
                timeout,
            )
            .await?;
        let head = out.first_line().to_string();
        Ok(if out.success() && !head.is_empty() {
            Some(head)
        } else {
            None
        })
    }

    /// Git commands carrying an access token are never logged
    async fn run_git(
        &mut self,
        repo: &RepositoryRef,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransferError> {
        let out = if repo.access().is_some() {
            self.run_sensitive(command, timeout).await?
        } else {
            self.run(command, timeout).await?
        };
        Ok(out)
    }
}

fn auth_config(repo: &RepositoryRef) -> String {
    match repo.access() {
        Some(access) => format!(
            "-c http.extraHeader={} ",
            shell_quote(access.auth_header().expose_secret())
        ),
        None => String::new(),
    }
}

fn git_ok(operation: &str, out: CommandOutput) -> Result<CommandOutput, TransferError> {
    if out.success() {
        Ok(out)
    } else {
        Err(TransferError::GitFailed {
            operation: operation.to_string(),
            exit_status: out.exit_status,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

fn short(commit: &str) -> &str {
    commit.get(..12).unwrap_or(commit)
}
