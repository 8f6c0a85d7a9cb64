//! `LoadPolicyFromNamed`: the narrow "named string source → policy" helper.
//!
//! The reference implementation reads an environment variable; this is
//! expressed generically over any `key -> Option<String>` lookup so it can
//! be exercised without touching real process environment, plus a thin
//! convenience wrapper over `std::env::var` for the production path.

use crate::error::PolicyError;
use crate::policy::{self, NetworkPolicy};

/// Load and parse a policy document from a named source.
///
/// A missing key and an empty value are treated identically: both produce
/// "no policy" (`Ok(None)`). A non-empty value is forwarded to
/// [`policy::parse`].
pub fn load_policy_from<F>(lookup: F, name: &str) -> Result<Option<NetworkPolicy>, PolicyError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => policy::parse(&value),
        None => Ok(None),
    }
}

/// Load and parse a policy document from the environment variable `name`.
pub fn load_policy_from_env(name: &str) -> Result<Option<NetworkPolicy>, PolicyError> {
    load_policy_from(|key| std::env::var(key).ok(), name)
}
