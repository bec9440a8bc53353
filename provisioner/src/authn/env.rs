//! Credential fields sourced from environment variables
//!
//! For a prefix `SSH` the recognized variables are `SSH_HOSTNAME`,
//! `SSH_USERNAME`, `SSH_PASSWORD`, `SSH_IDENTITY_FILE` and `SSH_PORT`.
//! Additional hosts use indexed sets: `SSH_1_HOSTNAME`, `SSH_2_HOSTNAME`, ...

use std::path::PathBuf;

use secrecy::SecretString;

use crate::authn::credential::CredentialFields;
use crate::deploy::procedure::RegistryLogin;
use crate::models::repository::RepositoryAccess;

pub const ENV_GIT_USERNAME: &str = "VMPROV_GIT_USERNAME";
pub const ENV_GIT_TOKEN: &str = "VMPROV_GIT_TOKEN";
pub const ENV_REGISTRY_SERVER: &str = "VMPROV_REGISTRY_SERVER";
pub const ENV_REGISTRY_USERNAME: &str = "VMPROV_REGISTRY_USERNAME";
pub const ENV_REGISTRY_PASSWORD: &str = "VMPROV_REGISTRY_PASSWORD";

const FIELD_HOSTNAME: &str = "HOSTNAME";
const FIELD_USERNAME: &str = "USERNAME";
const FIELD_PASSWORD: &str = "PASSWORD";
const FIELD_IDENTITY_FILE: &str = "IDENTITY_FILE";
const FIELD_PORT: &str = "PORT";

const ALL_FIELDS: [&str; 5] = [
    FIELD_HOSTNAME,
    FIELD_USERNAME,
    FIELD_PASSWORD,
    FIELD_IDENTITY_FILE,
    FIELD_PORT,
];

/// Read credential field sets for `prefix` from the process environment
pub fn credentials_from_env(prefix: &str) -> Vec<CredentialFields> {
    credentials_from_vars(prefix, |key| std::env::var(key).ok())
}

/// Read credential field sets for `prefix` through `lookup`.
///
/// Empty values count as unset. The unindexed set comes first, then indexed
/// sets in ascending order until the first index with no variable at all.
pub fn credentials_from_vars<F>(prefix: &str, lookup: F) -> Vec<CredentialFields>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = prefix.trim_end_matches('_');
    let get = |key: String| lookup(&key).filter(|v| !v.trim().is_empty());

    let mut sets = Vec::new();
    if let Some(fields) = read_set(prefix, &get) {
        sets.push(fields);
    }

    let mut index = 1;
    loop {
        let indexed = format!("{}_{}", prefix, index);
        match read_set(&indexed, &get) {
            Some(fields) => sets.push(fields),
            None => break,
        }
        index += 1;
    }

    sets
}

/// Repository access token, when both the username and token are set
pub fn repository_access_from_vars<F>(lookup: F) -> Option<RepositoryAccess>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    Some(RepositoryAccess {
        username: get(ENV_GIT_USERNAME)?,
        token: SecretString::from(get(ENV_GIT_TOKEN)?),
    })
}

/// Container registry login, when both the username and password are set
pub fn registry_login_from_vars<F>(lookup: F) -> Option<RegistryLogin>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    Some(RegistryLogin {
        server: get(ENV_REGISTRY_SERVER),
        username: get(ENV_REGISTRY_USERNAME)?,
        password: SecretString::from(get(ENV_REGISTRY_PASSWORD)?),
    })
}

fn read_set<G>(prefix: &str, get: &G) -> Option<CredentialFields>
where
    G: Fn(String) -> Option<String>,
{
    let key = |field: &str| format!("{}_{}", prefix, field);

    let any_set = ALL_FIELDS.iter().any(|f| get(key(f)).is_some());
    if !any_set {
        return None;
    }

    Some(CredentialFields {
        hostname: get(key(FIELD_HOSTNAME)),
        username: get(key(FIELD_USERNAME)),
        password: get(key(FIELD_PASSWORD)).map(SecretString::from),
        identity_file: get(key(FIELD_IDENTITY_FILE)).map(PathBuf::from),
        port: get(key(FIELD_PORT)),
    })
}
