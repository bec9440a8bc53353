//! Command line arguments
//!
//! Arguments use the `--key=value` form; bare `--flag` arguments are stored
//! as `true`.

use std::collections::HashMap;
use std::str::FromStr;

use crate::errors::ProvisionError;

pub const USAGE: &str = "\
Usage: vmprov --repo=<url> [options]

Options:
  --repo=<url>             repository to deploy
  --branch=<ref>           branch or tag to check out
  --install-path=<path>    checkout location on the hosts (default ~/app/<name>)
  --config=<file>          JSON settings file
  --env-prefix=<P1,P2>     credential environment prefixes (default SSH)
  --parallel=<n>           hosts provisioned at the same time (default 1)
  --connect-attempts=<n>   connection attempts per host (default 1)
  --report=<file>          write the JSON run report to <file>
  --log-level=<level>      trace, debug, info, warn or error
  --log-file=<file>        also write logs to <file>
  --json-logs              JSON log lines on stderr
  --version                print version information
  --help                   print this message
";

/// Parsed `--key=value` arguments
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    values: HashMap<String, String>,
}

impl CliArgs {
    /// Parse arguments, excluding the program name
    pub fn parse<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut values = HashMap::new();
        for arg in args {
            if let Some((key, value)) = arg.split_once('=') {
                let clean_key = key.trim_start_matches('-');
                values.insert(clean_key.to_string(), value.to_string());
            } else if arg.starts_with("--") {
                let clean_key = arg.trim_start_matches('-');
                values.insert(clean_key.to_string(), "true".to_string());
            }
        }
        Self { values }
    }

    /// Non-empty value of an argument
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Whether a flag was given and not set to `false`
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some(v) if v != "false")
    }

    /// Parse an argument's value
    pub fn parse_value<T: FromStr>(&self, key: &str) -> Result<Option<T>, ProvisionError> {
        self.get(key)
            .map(|v| {
                v.parse::<T>().map_err(|_| {
                    ProvisionError::ConfigError(format!("Invalid value for --{}: {}", key, v))
                })
            })
            .transpose()
    }

    /// Comma separated values of an argument
    pub fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}
