//! Redirect installer: programs the host packet-filter's NAT table so that
//! outbound DNS traffic is diverted to the proxy, while packets the proxy
//! itself emits upstream (tagged with [`BYPASS_MARK`]) bypass the redirect.

use crate::error::RedirectError;
use std::process::Command;

/// Fixed packet mark applied to every upstream socket the proxy opens.
///
/// A high-priority `RETURN` rule matching this mark is installed ahead of
/// the `REDIRECT` rules so the proxy's own queries never loop back through
/// itself.
pub const BYPASS_MARK: u32 = 0x1;

struct Rule {
    binary: &'static str,
    description: &'static str,
    args: Vec<String>,
}

fn bypass_return_rule(binary: &'static str, description: &'static str, protocol: &str) -> Rule {
    Rule {
        binary,
        description,
        args: vec![
            "-t".into(),
            "nat".into(),
            "-A".into(),
            "OUTPUT".into(),
            "-p".into(),
            protocol.into(),
            "--dport".into(),
            "53".into(),
            "-m".into(),
            "mark".into(),
            "--mark".into(),
            BYPASS_MARK.to_string(),
            "-j".into(),
            "RETURN".into(),
        ],
    }
}

fn redirect_rule(
    binary: &'static str,
    description: &'static str,
    protocol: &str,
    target_port: u16,
) -> Rule {
    Rule {
        binary,
        description,
        args: vec![
            "-t".into(),
            "nat".into(),
            "-A".into(),
            "OUTPUT".into(),
            "-p".into(),
            protocol.into(),
            "--dport".into(),
            "53".into(),
            "-j".into(),
            "REDIRECT".into(),
            "--to-port".into(),
            target_port.to_string(),
        ],
    }
}

fn rules(target_port: u16) -> Vec<Rule> {
    vec![
        bypass_return_rule("iptables", "v4 udp bypass RETURN", "udp"),
        bypass_return_rule("iptables", "v4 tcp bypass RETURN", "tcp"),
        redirect_rule("iptables", "v4 udp REDIRECT", "udp", target_port),
        redirect_rule("iptables", "v4 tcp REDIRECT", "tcp", target_port),
        bypass_return_rule("ip6tables", "v6 udp bypass RETURN", "udp"),
        bypass_return_rule("ip6tables", "v6 tcp bypass RETURN", "tcp"),
        redirect_rule("ip6tables", "v6 udp REDIRECT", "udp", target_port),
        redirect_rule("ip6tables", "v6 tcp REDIRECT", "tcp", target_port),
    ]
}

/// Install the eight NAT rules redirecting outbound DNS to `target_port`.
///
/// Rules are applied one `Command` invocation at a time, in the exact order
/// documented in the spec (bypass clauses before redirect clauses, v4
/// before v6). The first rule that fails to apply aborts installation and
/// is reported; any rules already installed are left in place for the
/// caller to clean up (no uninstall path is provided — the namespace this
/// runs in is expected to be disposable).
pub fn setup_redirect(target_port: u16) -> Result<(), RedirectError> {
    for rule in rules(target_port) {
        log::debug!("installing redirect rule: {}", rule.description);
        let output = Command::new(rule.binary)
            .args(&rule.args)
            .output()
            .map_err(|e| RedirectError::new(rule.description, e.to_string()))?;

        if !output.status.success() {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(RedirectError::new(rule.description, combined));
        }
    }

    log::info!("installed redirect rules for DNS -> 127.0.0.1:{target_port}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_order_is_bypass_before_redirect_and_v4_before_v6() {
        let built = rules(15353);
        assert_eq!(built.len(), 8);

        let descriptions: Vec<&str> = built.iter().map(|r| r.description).collect();
        assert_eq!(
            descriptions,
            vec![
                "v4 udp bypass RETURN",
                "v4 tcp bypass RETURN",
                "v4 udp REDIRECT",
                "v4 tcp REDIRECT",
                "v6 udp bypass RETURN",
                "v6 tcp bypass RETURN",
                "v6 udp REDIRECT",
                "v6 tcp REDIRECT",
            ]
        );

        assert!(built[..4].iter().all(|r| r.binary == "iptables"));
        assert!(built[4..].iter().all(|r| r.binary == "ip6tables"));
    }

    #[test]
    fn bypass_rules_carry_the_mark_and_return_target() {
        let built = rules(15353);
        let bypass = &built[0];
        assert!(bypass.args.contains(&"RETURN".to_string()));
        assert!(bypass.args.contains(&BYPASS_MARK.to_string()));
    }

    #[test]
    fn redirect_rules_target_the_requested_port() {
        let built = rules(15353);
        let redirect = &built[2];
        assert!(redirect.args.contains(&"REDIRECT".to_string()));
        assert!(redirect.args.contains(&"15353".to_string()));
    }

    #[test]
    #[ignore = "requires root/CAP_NET_ADMIN and a disposable network namespace; \
                run manually: `unshare -n` then `cargo test -- --ignored setup_redirect_installs_eight_rules`"]
    fn setup_redirect_installs_eight_rules() {
        setup_redirect(15353).expect("redirect installation should succeed in an isolated netns");
    }
}
