//! Error types for policy parsing, proxy startup, and redirect installation.
//!
//! Per-query failures (deny decisions, forward timeouts) never surface as
//! `Result`s here — they become DNS response codes, not Rust errors. Only
//! construction-time and installation-time failures are represented.

use std::fmt;

/// Failure to parse a policy document.
///
/// Carries the underlying decode reason so callers can log or display it
/// without re-deriving context from an opaque wrapped type.
#[derive(Debug)]
pub struct PolicyError {
    reason: String,
}

impl PolicyError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse network policy: {}", self.reason)
    }
}

impl std::error::Error for PolicyError {}

impl From<serde_json::Error> for PolicyError {
    fn from(value: serde_json::Error) -> Self {
        PolicyError::new(value.to_string())
    }
}

/// Failure to start the DNS proxy's listeners.
///
/// Returned from [`crate::proxy::DnsProxy::start`] wrapping the first
/// bind/IO error observed during the startup grace window.
#[derive(Debug)]
pub struct ProxyStartError {
    cause: std::io::Error,
}

impl ProxyStartError {
    pub(crate) fn new(cause: std::io::Error) -> Self {
        Self { cause }
    }
}

impl fmt::Display for ProxyStartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dns proxy failed: {}", self.cause)
    }
}

impl std::error::Error for ProxyStartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Failure to install one of the redirect installer's NAT rules.
///
/// Carries a description of the rule that failed (so the caller can tell
/// which of the eight invocations aborted installation) and the failed
/// subprocess's combined stdout/stderr.
#[derive(Debug)]
pub struct RedirectError {
    rule: String,
    output: String,
}

impl RedirectError {
    pub(crate) fn new(rule: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for RedirectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to install redirect rule ({}): {}",
            self.rule, self.output
        )
    }
}

impl std::error::Error for RedirectError {}
