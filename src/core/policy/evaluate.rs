//! IP allow/deny evaluation over a set of policies.
use std::net::IpAddr;

use serde::Serialize;

use crate::core::policy::{
    ip::IpNetwork,
    model::{PolicyConfig, PolicyEntry, PolicyMode, PolicyType},
};

/// One policy that objected to the client address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyViolation {
    pub policy_id: String,
    pub policy_type: PolicyType,
    pub mode: PolicyMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpVerdict {
    pub violations: Vec<PolicyViolation>,
}

impl IpVerdict {
    /// The strongest mode among the violations, if any.
    pub fn mode(&self) -> Option<PolicyMode> {
        self.violations.iter().map(|v| v.mode).max()
    }

    /// Only enforced violations block the request.
    pub fn is_blocked(&self) -> bool {
        self.mode() == Some(PolicyMode::Enforce)
    }
}

/// Evaluate enabled IP policies against `ip`.
///
/// A deny policy objects when it contains the address. Allow policies are
/// pooled: when any are enabled, an address outside all of them is a
/// violation of each, at that policy's own mode. Unparseable ranges are
/// skipped; validation keeps them out of the store.
pub fn evaluate_ip<'a>(policies: impl IntoIterator<Item = &'a PolicyEntry>, ip: IpAddr) -> IpVerdict {
    let mut verdict = IpVerdict::default();
    let mut allow_lists: Vec<&PolicyEntry> = Vec::new();
    let mut allowed = false;

    for policy in policies.into_iter().filter(|p| p.enabled) {
        let PolicyConfig::Ip(config) = &policy.config else {
            continue;
        };
        let contains = config
            .cidrs
            .iter()
            .filter_map(|cidr| IpNetwork::parse(cidr).ok())
            .any(|network| network.contains(ip));

        match policy.policy_type {
            PolicyType::IpDeny if contains => verdict.violations.push(violation(policy)),
            PolicyType::IpAllow => {
                allowed |= contains;
                allow_lists.push(policy);
            }
            _ => {}
        }
    }

    if !allowed {
        verdict
            .violations
            .extend(allow_lists.into_iter().map(violation));
    }
    verdict
        .violations
        .sort_by(|a, b| b.mode.cmp(&a.mode).then_with(|| a.policy_id.cmp(&b.policy_id)));
    verdict
}

fn violation(policy: &PolicyEntry) -> PolicyViolation {
    PolicyViolation {
        policy_id: policy.id.clone(),
        policy_type: policy.policy_type,
        mode: policy.mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::model::IpConfig;

    fn ip_policy(id: &str, policy_type: PolicyType, mode: PolicyMode, cidrs: &[&str]) -> PolicyEntry {
        PolicyEntry::new(
            id,
            policy_type,
            PolicyConfig::Ip(IpConfig {
                cidrs: cidrs.iter().map(|c| c.to_string()).collect(),
            }),
        )
        .with_mode(mode)
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_no_policies_allows_everything() {
        let verdict = evaluate_ip(&Vec::<PolicyEntry>::new(), addr("10.0.0.1"));
        assert!(verdict.violations.is_empty());
        assert!(!verdict.is_blocked());
    }

    #[test]
    fn test_deny_blocks_only_matching_addresses() {
        let policies = [ip_policy("deny", PolicyType::IpDeny, PolicyMode::Enforce, &["10.0.0.0/8"])];
        assert!(evaluate_ip(&policies, addr("10.1.2.3")).is_blocked());
        assert!(!evaluate_ip(&policies, addr("192.168.0.1")).is_blocked());
    }

    #[test]
    fn test_allow_lists_are_pooled() {
        let policies = [
            ip_policy("office", PolicyType::IpAllow, PolicyMode::Enforce, &["192.168.1.0/24"]),
            ip_policy("vpn", PolicyType::IpAllow, PolicyMode::AuditOnly, &["10.8.0.0/16"]),
        ];
        assert!(evaluate_ip(&policies, addr("10.8.3.3")).violations.is_empty());

        let verdict = evaluate_ip(&policies, addr("8.8.8.8"));
        assert_eq!(verdict.violations.len(), 2);
        assert_eq!(verdict.violations[0].policy_id, "office");
        assert!(verdict.is_blocked());
    }

    #[test]
    fn test_non_enforced_violation_does_not_block() {
        let policies = [ip_policy("deny", PolicyType::IpDeny, PolicyMode::Shadow, &["10.0.0.1"])];
        let verdict = evaluate_ip(&policies, addr("10.0.0.1"));
        assert_eq!(verdict.mode(), Some(PolicyMode::Shadow));
        assert!(!verdict.is_blocked());
    }

    #[test]
    fn test_disabled_policies_are_ignored() {
        let mut deny = ip_policy("deny", PolicyType::IpDeny, PolicyMode::Enforce, &["10.0.0.1"]);
        deny.enabled = false;
        assert!(!evaluate_ip(&[deny], addr("10.0.0.1")).is_blocked());
    }
}
