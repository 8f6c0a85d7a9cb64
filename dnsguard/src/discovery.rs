//! Upstream resolver discovery: read `/etc/resolv.conf`, fall back to a
//! built-in public resolver when discovery fails for any reason.

use std::net::IpAddr;

/// Fallback resolver used when `/etc/resolv.conf` can't be read or parsed.
///
/// This is a liveness guarantee, not a security claim: it keeps the proxy
/// answering queries rather than refusing to start.
pub const FALLBACK_UPSTREAM: &str = "8.8.8.8:53";

const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Discover the upstream `host:port`, logging and falling back to
/// [`FALLBACK_UPSTREAM`] if the system resolver configuration is
/// unavailable or has no usable nameserver entry.
///
/// An IPv6 nameserver is bracketed (`[::1]:53`) so the result is a valid
/// `SocketAddr` string; an unbracketed `host:port` form is ambiguous for
/// IPv6 (`::1:53` doesn't parse as a socket address at all).
pub fn discover_upstream(port: u16) -> String {
    match first_nameserver(RESOLV_CONF_PATH) {
        Some(IpAddr::V4(host)) => format!("{host}:{port}"),
        Some(IpAddr::V6(host)) => format!("[{host}]:{port}"),
        None => {
            log::warn!(
                "could not determine system resolver from {}, falling back to {}",
                RESOLV_CONF_PATH,
                FALLBACK_UPSTREAM
            );
            FALLBACK_UPSTREAM.to_string()
        }
    }
}

/// Read the first `nameserver` line from a resolv.conf-shaped file.
fn first_nameserver(path: &str) -> Option<IpAddr> {
    let contents = std::fs::read_to_string(path).ok()?;

    for line in contents.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("nameserver") {
            let candidate = rest.trim();
            if let Ok(ip) = candidate.parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}
