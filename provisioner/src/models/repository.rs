//! Repository reference

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::errors::ProvisionError;

/// Directory under the login user's home that holds checkouts by default
pub const DEFAULT_INSTALL_ROOT: &str = "~/app";

/// Credentials for fetching a private repository over HTTPS
#[derive(Debug)]
pub struct RepositoryAccess {
    pub username: String,
    pub token: SecretString,
}

impl RepositoryAccess {
    /// `http.extraHeader` value carrying basic auth
    pub fn auth_header(&self) -> SecretString {
        let raw = format!("{}:{}", self.username, self.token.expose_secret());
        SecretString::from(format!("Authorization: Basic {}", BASE64.encode(raw)))
    }
}

/// The repository to deploy.
///
/// Immutable once a run starts; shared between hosts behind an `Arc`.
#[derive(Debug)]
pub struct RepositoryRef {
    url: String,
    branch: Option<String>,
    install_path: String,
    access: Option<RepositoryAccess>,
}

impl RepositoryRef {
    /// Create a repository reference, validating the URL
    pub fn new(
        url: impl Into<String>,
        branch: Option<String>,
        install_path: Option<String>,
    ) -> Result<Self, ProvisionError> {
        let url = url.into().trim().to_string();
        if url.is_empty() {
            return Err(ProvisionError::ConfigError(
                "Repository URL is required".to_string(),
            ));
        }
        if !is_scp_like(&url) {
            Url::parse(&url).map_err(|e| {
                ProvisionError::ConfigError(format!("Invalid repository URL '{}': {}", url, e))
            })?;
        }

        let name = repo_name(&url).ok_or_else(|| {
            ProvisionError::ConfigError(format!("Cannot derive a name from '{}'", url))
        })?;

        let branch = branch
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());
        let install_path = install_path
            .map(|p| p.trim().trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| format!("{}/{}", DEFAULT_INSTALL_ROOT, name));

        Ok(Self {
            url,
            branch,
            install_path,
            access: None,
        })
    }

    /// Attach HTTPS access credentials
    pub fn with_access(mut self, access: RepositoryAccess) -> Self {
        self.access = Some(access);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Requested branch, tag or commit; `None` means the remote default branch
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// Install path on the remote host, absolute or relative to the login directory
    pub fn install_path(&self) -> &str {
        &self.install_path
    }

    pub fn access(&self) -> Option<&RepositoryAccess> {
        self.access.as_ref()
    }

    /// Repository name, the last path segment without `.git`
    pub fn name(&self) -> &str {
        repo_name(&self.url).unwrap_or("app")
    }

    /// Whether `remote_url` points at this same repository
    pub fn matches_remote(&self, remote_url: &str) -> bool {
        normalize_url(&self.url) == normalize_url(remote_url)
    }
}

fn is_scp_like(url: &str) -> bool {
    // git@github.com:owner/repo.git
    !url.contains("://")
        && url
            .split_once(':')
            .map(|(host, path)| !host.is_empty() && !path.is_empty() && !host.contains('/'))
            .unwrap_or(false)
}

fn repo_name(url: &str) -> Option<&str> {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Comparable form of a repository URL: no credentials, lowercase host, no
/// trailing slash or `.git`
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let (host, path) = if is_scp_like(url) {
        let (host, path) = url.split_once(':').unwrap_or((url, ""));
        let host = host.rsplit('@').next().unwrap_or(host);
        (host.to_lowercase(), path.to_string())
    } else {
        match Url::parse(url) {
            Ok(parsed) => (
                parsed.host_str().unwrap_or_default().to_lowercase(),
                parsed.path().to_string(),
            ),
            Err(_) => (String::new(), url.to_string()),
        }
    };

    let path = path.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    format!("{}/{}", host, path.trim_start_matches('/'))
}
