//! Remote shell sessions
//!
//! `Connection` is what the deployment steps use. It wraps a `RemoteSession`
//! produced by a `Connector`; `openssh` provides the real transport.

pub mod connection;
pub mod openssh;
pub mod session;
pub mod sync;

/// Prefix that sets `$SUDO` to `sudo -n` for non-root logins
pub const SUDO_PREAMBLE: &str =
    "if [ \"$(id -u)\" -eq 0 ]; then SUDO=''; else SUDO='sudo -n'; fi\n";

/// Build a remote script labelled with the operation it performs.
///
/// The label is a shell comment on the first line so it shows up in remote
/// process listings and debug logs.
pub fn script(op: &str, body: impl AsRef<str>) -> String {
    format!("# vmprov:{}\n{}", op, body.as_ref())
}

/// Like [`script`], with `$SUDO` available to the body
pub fn privileged_script(op: &str, body: impl AsRef<str>) -> String {
    script(op, format!("{}{}", SUDO_PREAMBLE, body.as_ref()))
}

/// Operation label of a script built by [`script`]
pub fn script_op(command: &str) -> Option<&str> {
    command
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("# vmprov:"))
        .map(str::trim)
}
