//! Core types for meshsync
//!
//! Desired-state documents (users, routes, ACL policy), the live views the
//! control plane returns, and the result types of apply / drift / validate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Prefixes advertised by an exit node
pub const EXIT_NODE_PREFIXES: [&str; 2] = ["0.0.0.0/0", "::/0"];

// ============================================================================
// Desired state
// ============================================================================

/// A mesh identity. Identity is the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: String::new(),
            tags: BTreeSet::new(),
        }
    }
}

/// Subnet routes a node should have enabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub node: String,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub advertise_exit_node: bool,
}

impl Route {
    pub fn new(node: impl Into<String>, routes: &[&str]) -> Self {
        Self {
            node: node.into(),
            routes: routes.iter().map(|r| r.to_string()).collect(),
            advertise_exit_node: false,
        }
    }

    /// All prefixes this entry wants enabled, exit prefixes included.
    /// Order follows the document; duplicates are dropped.
    pub fn prefixes(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.routes.len() + 2);
        let exit: &[&str] = if self.advertise_exit_node {
            &EXIT_NODE_PREFIXES
        } else {
            &[]
        };
        for prefix in self.routes.iter().map(String::as_str).chain(exit.iter().copied()) {
            if !out.iter().any(|p| p == prefix) {
                out.push(prefix.to_string());
            }
        }
        out
    }
}

/// ACL rule action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    #[serde(alias = "allow")]
    Accept,
    Deny,
}

/// SSH rule action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshAction {
    Accept,
    Check,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    pub action: AclAction,
    pub src: Vec<String>,
    pub dst: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshRule {
    pub action: SshAction,
    pub src: Vec<String>,
    pub dst: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
}

/// The ACL policy document. `acls` and `ssh` are evaluated in order by the
/// control plane, so their order must survive every round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclPolicy {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, Vec<String>>,
    #[serde(default, rename = "tagOwners", skip_serializing_if = "BTreeMap::is_empty")]
    pub tag_owners: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub acls: Vec<AclRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh: Vec<SshRule>,
    #[serde(default, rename = "autoGroups", skip_serializing_if = "BTreeMap::is_empty")]
    pub auto_groups: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hosts: BTreeMap<String, String>,
}

/// Snapshot of all three desired-state documents, loaded once per operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub users: Vec<User>,
    pub routes: Vec<Route>,
    pub policy: AclPolicy,
}

// ============================================================================
// Live state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveUser {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A route as advertised by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRoute {
    pub id: String,
    pub node: String,
    pub prefix: String,
    pub advertised: bool,
    pub enabled: bool,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub given_name: String,
    pub user: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

// ============================================================================
// Auth keys
// ============================================================================

/// Request to issue a pre-authentication key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthKeyRequest {
    pub user: String,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub reusable: bool,
    /// Duration string such as `24h` or `1h30m`
    #[serde(default)]
    pub expiration: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// What the control plane is asked to create, with expiration resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthKeySpec {
    pub user: String,
    pub ephemeral: bool,
    pub reusable: bool,
    pub expiration: DateTime<Utc>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub key: String,
    pub user: String,
    pub ephemeral: bool,
    pub reusable: bool,
    #[serde(default)]
    pub used: bool,
    pub expiration: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

// ============================================================================
// Apply / drift / validate results
// ============================================================================

/// Options for a reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOptions {
    #[serde(default)]
    pub dry_run: bool,
    /// Bypasses confirmation prompts in front-ends; no effect on the engine.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub validate: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyStats {
    pub users_processed: usize,
    pub routes_processed: usize,
    pub acl_processed: usize,
    pub changes_applied: usize,
    pub errors_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub success: bool,
    pub message: String,
    pub changes: Vec<String>,
    pub errors: Vec<String>,
    pub dry_run: bool,
    pub stats: ApplyStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftSummary {
    pub headscale_users_count: usize,
    pub config_users_count: usize,
    pub headscale_routes_count: usize,
    pub config_routes_count: usize,
    pub drift_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub has_drift: bool,
    pub drifts: Vec<String>,
    pub summary: DriftSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub message: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl ValidationReport {
    pub fn from_issues(issues: Vec<String>) -> Self {
        if issues.is_empty() {
            Self {
                valid: true,
                message: "Configuration is valid".to_string(),
                issues,
            }
        } else {
            Self {
                valid: false,
                message: issues.join("; "),
                issues,
            }
        }
    }

    pub fn into_result(self) -> Result<(), crate::ValidationError> {
        if self.valid {
            Ok(())
        } else {
            Err(crate::ValidationError {
                issues: self.issues,
            })
        }
    }
}
