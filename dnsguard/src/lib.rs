#![doc = "An egress DNS enforcement point for sandboxed network namespaces.\n\nThe crate is three pieces wired together by the caller: a policy model for\ndeciding whether a queried domain is allowed, a DNS proxy that answers\nqueries on loopback while enforcing that policy, and a redirect installer\nthat programs the host's NAT table to route the namespace's real DNS\ntraffic into the proxy. None of the three pieces know about the others;\na caller (not provided by this crate) owns installing the redirect,\nconstructing the proxy with a starting policy, calling `start`, and later\npushing policy updates in with `update_policy`.\n"]

/// Egress domain policy: parsing and evaluating the allow/deny document.
pub mod policy;
/// Error types returned by policy parsing, proxy startup, and redirect
/// installation.
pub mod error;
/// Upstream resolver discovery (`/etc/resolv.conf`, with a public fallback).
pub mod discovery;
/// Loads a policy document from a named string source (e.g. an environment
/// variable).
pub mod env_policy;
/// NAT redirect installer: `iptables`/`ip6tables` rules routing DNS to the
/// proxy.
pub mod redirect;
/// The DNS proxy itself: UDP/TCP listeners, per-query policy enforcement,
/// upstream forwarding.
pub mod proxy;

pub use error::{PolicyError, ProxyStartError, RedirectError};
pub use policy::{Action, DomainPattern, EgressRule, NetworkPolicy};
pub use proxy::DnsProxy;
