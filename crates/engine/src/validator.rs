//! Desired-state validation
//!
//! Syntactic checks (names, CIDRs, ports) plus referential integrity of the
//! ACL policy: every group, tag, autogroup and host a rule mentions must be
//! defined.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use meshsync_common::{AclPolicy, DesiredState, ValidationReport};

/// Autogroups understood by the control plane without a definition
const BUILTIN_AUTOGROUPS: &[&str] = &[
    "autogroup:internet",
    "autogroup:member",
    "autogroup:tagged",
    "autogroup:self",
    "autogroup:nonroot",
    "autogroup:danger-all",
];

#[derive(Default)]
struct Issues(Vec<String>);

impl Issues {
    fn push(&mut self, issue: String) {
        if !self.0.contains(&issue) {
            self.0.push(issue);
        }
    }
}

/// Validate all three documents together
pub fn validate(state: &DesiredState) -> ValidationReport {
    let mut issues = Issues::default();

    let mut seen: Vec<&str> = Vec::with_capacity(state.users.len());
    for user in &state.users {
        let name = user.name.trim();
        if name.is_empty() {
            issues.push("user name must not be empty".to_string());
        } else if seen.contains(&name) {
            issues.push(format!("duplicate user name: {name}"));
        } else {
            seen.push(name);
        }
    }

    for (i, route) in state.routes.iter().enumerate() {
        if route.node.trim().is_empty() {
            issues.push(format!("route entry {}: node must not be empty", i + 1));
        }
        for prefix in &route.routes {
            if !is_cidr(prefix) {
                issues.push(format!("invalid route prefix {prefix} for node {}", route.node));
            }
        }
    }

    check_policy(&state.policy, &mut issues);
    ValidationReport::from_issues(issues.0)
}

/// Validate an ACL policy on its own
pub fn validate_policy(policy: &AclPolicy) -> ValidationReport {
    let mut issues = Issues::default();
    check_policy(policy, &mut issues);
    ValidationReport::from_issues(issues.0)
}

fn check_policy(policy: &AclPolicy, issues: &mut Issues) {
    for (name, value) in &policy.hosts {
        if value.parse::<IpAddr>().is_err() && !is_cidr(value) {
            issues.push(format!("invalid host {name}: {value}"));
        }
    }

    for name in policy.groups.keys() {
        if !name.starts_with("group:") {
            issues.push(format!("invalid group name {name}: must start with group:"));
        }
    }

    for (tag, owners) in &policy.tag_owners {
        if !tag.starts_with("tag:") {
            issues.push(format!("invalid tag owner {tag}: must start with tag:"));
        }
        for owner in owners {
            if owner.starts_with("group:") || owner.starts_with("tag:") {
                check_selector(policy, owner, issues);
            }
        }
    }

    for rule in &policy.acls {
        for src in &rule.src {
            check_selector(policy, src, issues);
        }
        for dst in &rule.dst {
            match dst.rsplit_once(':') {
                Some((selector, ports)) if !selector.is_empty() => {
                    check_selector(policy, selector, issues);
                    if !valid_ports(ports) {
                        issues.push(format!("invalid ports in destination {dst}"));
                    }
                }
                _ => issues.push(format!("invalid destination {dst}: expected selector:ports")),
            }
        }
    }

    for rule in &policy.ssh {
        for selector in rule.src.iter().chain(&rule.dst) {
            check_selector(policy, selector, issues);
        }
    }
}

fn check_selector(policy: &AclPolicy, selector: &str, issues: &mut Issues) {
    if selector == "*" || selector.contains('@') || is_ip_or_cidr(selector) {
        return;
    }
    if selector.starts_with("group:") {
        if !policy.groups.contains_key(selector) {
            issues.push(format!("undefined group reference: {selector}"));
        }
    } else if selector.starts_with("tag:") {
        if !policy.tag_owners.contains_key(selector) {
            issues.push(format!("undefined tag reference: {selector}"));
        }
    } else if selector.starts_with("autogroup:") {
        if !BUILTIN_AUTOGROUPS.contains(&selector) && !policy.auto_groups.contains_key(selector) {
            issues.push(format!("undefined autogroup reference: {selector}"));
        }
    } else if !policy.hosts.contains_key(selector) {
        issues.push(format!("undefined host reference: {selector}"));
    }
}

fn is_cidr(s: &str) -> bool {
    s.contains('/') && s.parse::<IpNetwork>().is_ok()
}

fn is_ip_or_cidr(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok() || is_cidr(s)
}

fn valid_ports(ports: &str) -> bool {
    if ports == "*" {
        return true;
    }
    ports.split(',').all(|part| match part.split_once('-') {
        Some((lo, hi)) => match (lo.parse::<u16>(), hi.parse::<u16>()) {
            (Ok(lo), Ok(hi)) => lo <= hi,
            _ => false,
        },
        None => part.parse::<u16>().is_ok(),
    })
}
