//! Egress domain policy: parsing the allow/deny document and evaluating
//! domain membership against it.
//!
//! A policy document decodes to `None` ("no policy installed", equivalent to
//! allow-all) for four sentinel payloads, or `Some(NetworkPolicy)` otherwise.
//! See [`parse`] and [`evaluate`].

use crate::error::PolicyError;
use serde::Deserialize;

/// Verdict for a matched rule or a policy's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

/// A domain pattern: either an exact match or a wildcard subdomain match.
///
/// Any target text that isn't recognized as one of these two shapes (it
/// always is, since everything that doesn't start with `*.` is treated as
/// an exact match) simply never matches a real queried domain — there is no
/// separate "unknown pattern" representation to maintain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    Exact(String),
    /// Strict-subdomain suffix, stored without the leading `*.` and without
    /// its own leading dot (e.g. `*.example.com` is stored as `example.com`).
    Wildcard(String),
}

impl DomainPattern {
    fn from_target(target: &str) -> Self {
        match target.strip_prefix("*.") {
            Some(suffix) => DomainPattern::Wildcard(normalize_domain(suffix)),
            None => DomainPattern::Exact(normalize_domain(target)),
        }
    }

    /// `domain` must already be normalized (lowercase, no trailing dot).
    fn matches(&self, domain: &str) -> bool {
        match self {
            DomainPattern::Exact(exact) => domain == exact,
            DomainPattern::Wildcard(suffix) => {
                let dotted_suffix_len = suffix.len() + 1;
                domain.len() > dotted_suffix_len
                    && domain.ends_with(suffix.as_str())
                    && domain.as_bytes()[domain.len() - dotted_suffix_len] == b'.'
            }
        }
    }
}

/// A single ordered `(action, target)` egress rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressRule {
    pub action: Action,
    pub target: DomainPattern,
}

/// A parsed, immutable policy document: an ordered rule list plus a default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPolicy {
    pub egress: Vec<EgressRule>,
    pub default_action: Action,
}

#[derive(Deserialize, Default)]
struct RawRule {
    #[serde(default)]
    action: String,
    target: String,
}

#[derive(Deserialize, Default)]
struct RawDocument {
    #[serde(default)]
    egress: Vec<RawRule>,
    #[serde(default, rename = "defaultAction")]
    default_action: Option<String>,
}

/// Text → [`Action`], treating anything other than a case-insensitive
/// `"allow"` (including an empty string) as `Deny`. This is the closed-by-
/// default rule applied uniformly to both rule actions and the document's
/// `defaultAction`.
fn action_from_text(text: &str) -> Action {
    if text.eq_ignore_ascii_case("allow") {
        Action::Allow
    } else {
        Action::Deny
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.strip_suffix('.').unwrap_or(domain).to_lowercase()
}

/// Parse a policy document.
///
/// Returns `Ok(None)` for the "no policy installed" sentinels (empty,
/// all-whitespace, `null`, or `{}`), `Ok(Some(policy))` for a decoded
/// document, or `Err` if the payload is non-empty but fails to decode.
pub fn parse(raw: &str) -> Result<Option<NetworkPolicy>, PolicyError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(trimmed)?;
    let map = match value {
        serde_json::Value::Null => return Ok(None),
        serde_json::Value::Object(map) if map.is_empty() => return Ok(None),
        serde_json::Value::Object(map) => map,
        _ => {
            return Err(PolicyError::new(
                "expected a JSON object for the policy document",
            ))
        }
    };

    let doc: RawDocument = serde_json::from_value(serde_json::Value::Object(map))?;
    let egress: Vec<EgressRule> = doc
        .egress
        .into_iter()
        .map(|rule| EgressRule {
            action: action_from_text(&rule.action),
            target: DomainPattern::from_target(&rule.target),
        })
        .collect();

    let default_action = match doc.default_action {
        Some(text) => action_from_text(&text),
        None if egress.is_empty() => return Ok(None),
        None => Action::Deny,
    };

    Ok(Some(NetworkPolicy {
        egress,
        default_action,
    }))
}

/// Evaluate a domain against a (possibly absent) policy.
///
/// `None` means "no policy installed" and always resolves to `Allow`.
pub fn evaluate(policy: Option<&NetworkPolicy>, domain: &str) -> Action {
    let Some(policy) = policy else {
        return Action::Allow;
    };

    let normalized = normalize_domain(domain);
    for rule in &policy.egress {
        if rule.target.matches(&normalized) {
            return rule.action;
        }
    }
    policy.default_action
}
