//! SSH credential descriptors

use std::fmt;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};

use crate::errors::InvalidCredential;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Unvalidated credential fields, as read from the environment or a settings file
#[derive(Debug, Default)]
pub struct CredentialFields {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub identity_file: Option<PathBuf>,
    pub port: Option<String>,
}

impl CredentialFields {
    /// A label for reports, usable even when validation fails
    pub fn label(&self) -> Option<&str> {
        self.hostname
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }
}

/// Where to connect and as whom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl SshTarget {
    /// `user@host` destination for the ssh client
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == DEFAULT_SSH_PORT {
            write!(f, "{}@{}", self.username, self.host)
        } else {
            write!(f, "{}@{}:{}", self.username, self.host, self.port)
        }
    }
}

/// A validated credential descriptor.
///
/// Exactly one authentication strategy per host. The password never shows up
/// in `Debug` output.
#[derive(Debug)]
pub enum Credential {
    /// Password authentication
    Password {
        target: SshTarget,
        password: SecretString,
    },

    /// Private key file authentication
    IdentityFile {
        target: SshTarget,
        identity_file: PathBuf,
    },

    /// Ambient authentication (ssh-agent or the default key files)
    Agent { target: SshTarget },
}

impl Credential {
    /// Validate raw fields into a credential descriptor
    pub fn validate(fields: CredentialFields) -> Result<Self, InvalidCredential> {
        let host = non_blank(fields.hostname);
        let username = non_blank(fields.username);
        let identity_file = fields
            .identity_file
            .filter(|p| !p.as_os_str().is_empty());
        let password = fields.password.filter(|p| !p.expose_secret().is_empty());

        let mut invalid = Vec::new();
        let mut reasons = Vec::new();
        if host.is_none() {
            invalid.push("hostname".to_string());
        }
        if username.is_none() {
            invalid.push("username".to_string());
        }
        if !invalid.is_empty() {
            reasons.push("required field missing");
        }
        if password.is_some() && identity_file.is_some() {
            invalid.push("password".to_string());
            invalid.push("identity_file".to_string());
            reasons.push("password and identity file are mutually exclusive");
        }

        let (Some(host), Some(username)) = (host, username) else {
            return Err(InvalidCredential {
                fields: invalid,
                reason: reasons.join("; "),
            });
        };
        if !invalid.is_empty() {
            return Err(InvalidCredential {
                fields: invalid,
                reason: reasons.join("; "),
            });
        }

        let port = match non_blank(fields.port) {
            None => DEFAULT_SSH_PORT,
            Some(raw) => match raw.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    return Err(InvalidCredential {
                        fields: vec!["port".to_string()],
                        reason: format!("'{}' is not a valid port", raw),
                    })
                }
            },
        };

        let target = SshTarget {
            host,
            port,
            username,
        };

        Ok(match (password, identity_file) {
            (Some(password), None) => Credential::Password { target, password },
            (None, Some(identity_file)) => Credential::IdentityFile {
                target,
                identity_file,
            },
            _ => Credential::Agent { target },
        })
    }

    /// Connection target
    pub fn target(&self) -> &SshTarget {
        match self {
            Credential::Password { target, .. }
            | Credential::IdentityFile { target, .. }
            | Credential::Agent { target } => target,
        }
    }

    /// Target host name
    pub fn host(&self) -> &str {
        &self.target().host
    }

    /// Identity file, for the identity-file variant
    pub fn identity_file(&self) -> Option<&Path> {
        match self {
            Credential::IdentityFile { identity_file, .. } => Some(identity_file),
            _ => None,
        }
    }

    /// Short name of the authentication strategy, safe to log
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password { .. } => "password",
            Credential::IdentityFile { .. } => "identity-file",
            Credential::Agent { .. } => "agent",
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
