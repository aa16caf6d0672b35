// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Access Policy (component B).

use std::net::IpAddr;

use presswerk_core::{AccessPolicyConfig, AccessRuleKind, PolicyOrder, Sense};

/// Evaluate `config` against `peer`, returning a single allow/deny boolean.
pub fn evaluate(config: &AccessPolicyConfig, peer: &IpAddr) -> bool {
    match config.order {
        PolicyOrder::AllowThenDeny => {
            let mut decision = false; // initial: deny
            if config.allow_all {
                decision = true;
            }
            decision = apply_rules(decision, config, peer, Sense::Allow);
            decision = apply_rules(decision, config, peer, Sense::Deny);
            if config.deny_all {
                decision = false;
            }
            decision
        }
        PolicyOrder::DenyThenAllow => {
            let mut decision = true; // initial: allow
            if config.deny_all {
                decision = false;
            }
            decision = apply_rules(decision, config, peer, Sense::Deny);
            decision = apply_rules(decision, config, peer, Sense::Allow);
            if config.allow_all {
                decision = true;
            }
            decision
        }
    }
}

/// Apply every rule of the given `sense` in list order; last match wins.
fn apply_rules(mut decision: bool, config: &AccessPolicyConfig, peer: &IpAddr, sense: Sense) -> bool {
    for rule in &config.rules {
        if rule.sense != sense {
            continue;
        }
        if rule_matches(&rule.kind, peer) {
            decision = matches!(sense, Sense::Allow);
        }
    }
    decision
}

fn rule_matches(kind: &AccessRuleKind, peer: &IpAddr) -> bool {
    match kind {
        AccessRuleKind::Ip(addr) => addr == peer,
        AccessRuleKind::Network { addr, mask } => and_mask(addr, mask) == and_mask(peer, mask),
    }
}

/// AND an address with a mask, family-sensitively; mismatched families never
/// compare equal.
fn and_mask(addr: &IpAddr, mask: &IpAddr) -> Option<Vec<u8>> {
    match (addr, mask) {
        (IpAddr::V4(a), IpAddr::V4(m)) => {
            let a = u32::from(*a);
            let m = u32::from(*m);
            Some((a & m).to_be_bytes().to_vec())
        }
        (IpAddr::V6(a), IpAddr::V6(m)) => {
            let a = a.octets();
            let m = m.octets();
            Some(a.iter().zip(m.iter()).map(|(x, y)| x & y).collect())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presswerk_core::AccessRule;

    fn peer(ip: &str) -> IpAddr {
        ip.parse().unwrap()
    }

    #[test]
    fn allow_then_deny_denies_by_default() {
        let config = AccessPolicyConfig {
            order: PolicyOrder::AllowThenDeny,
            allow_all: false,
            deny_all: false,
            rules: vec![],
        };
        assert!(!evaluate(&config, &peer("10.0.0.5")));
    }

    #[test]
    fn allow_then_deny_last_match_wins() {
        let config = AccessPolicyConfig {
            order: PolicyOrder::AllowThenDeny,
            allow_all: false,
            deny_all: false,
            rules: vec![
                AccessRule {
                    sense: Sense::Allow,
                    kind: AccessRuleKind::Network {
                        addr: peer("10.0.0.0"),
                        mask: peer("255.255.255.0"),
                    },
                },
                AccessRule {
                    sense: Sense::Deny,
                    kind: AccessRuleKind::Ip(peer("10.0.0.5")),
                },
            ],
        };
        assert!(evaluate(&config, &peer("10.0.0.9")));
        assert!(!evaluate(&config, &peer("10.0.0.5")));
    }

    #[test]
    fn deny_then_allow_allows_by_default() {
        let config = AccessPolicyConfig {
            order: PolicyOrder::DenyThenAllow,
            allow_all: false,
            deny_all: false,
            rules: vec![],
        };
        assert!(evaluate(&config, &peer("192.168.1.1")));
    }

    #[test]
    fn mismatched_families_never_match_network_rule() {
        let config = AccessPolicyConfig {
            order: PolicyOrder::AllowThenDeny,
            allow_all: false,
            deny_all: false,
            rules: vec![AccessRule {
                sense: Sense::Allow,
                kind: AccessRuleKind::Network {
                    addr: peer("10.0.0.0"),
                    mask: peer("255.255.255.0"),
                },
            }],
        };
        assert!(!evaluate(&config, &peer("::1")));
    }
}
