//! In-memory control plane
//!
//! Holds live state in process, records the most recent calls in order and
//! can be told to fail specific operations. Used by the engine's tests and by `meshsyncd
//! --memory` for local development without a Headscale server.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use meshsync_common::{
    AclPolicy, AuthKey, AuthKeySpec, ControlPlaneError, ControlPlaneResult, LiveNode, LiveRoute,
    LiveUser, User,
};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;

use super::ControlPlane;

/// Calls kept in the log; older ones are dropped first
pub const CALL_LOG_LIMIT: usize = 1024;

/// One call issued against the memory control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneCall {
    ListUsers,
    CreateUser(String),
    ListRoutes,
    EnableRoute(String),
    GetPolicy,
    SetPolicy,
    ListNodes,
    DeleteNode(String),
    ExpireNode(String),
    CreateAuthKey(String),
    ListAuthKeys(String),
    ExpireAuthKey { user: String, key: String },
}

impl ControlPlaneCall {
    /// Whether the call changes live state
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            ControlPlaneCall::ListUsers
                | ControlPlaneCall::ListRoutes
                | ControlPlaneCall::GetPolicy
                | ControlPlaneCall::ListNodes
                | ControlPlaneCall::ListAuthKeys(_)
        )
    }
}

#[derive(Default)]
struct Inner {
    users: Vec<LiveUser>,
    routes: Vec<LiveRoute>,
    policy: Option<AclPolicy>,
    nodes: Vec<LiveNode>,
    keys: Vec<AuthKey>,
    calls: VecDeque<ControlPlaneCall>,
    /// Live policy exists but cannot be parsed
    policy_unreadable: bool,
    /// (operation, target); a `None` target fails every call of that operation
    failures: HashSet<(&'static str, Option<String>)>,
    next_id: u64,
}

impl Inner {
    fn record(&mut self, call: ControlPlaneCall) {
        if self.calls.len() == CALL_LOG_LIMIT {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn check(&self, operation: &'static str, target: Option<&str>) -> ControlPlaneResult<()> {
        let all = self.failures.contains(&(operation, None));
        let this = target.is_some_and(|t| self.failures.contains(&(operation, Some(t.to_string()))));
        if all || this {
            return Err(ControlPlaneError::rejected(operation, "injected failure"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryControlPlane {
    inner: Mutex<Inner>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with these users already present
    pub fn with_users(names: &[&str]) -> Self {
        let plane = Self::new();
        for name in names {
            plane.add_user(name);
        }
        plane
    }

    pub fn add_user(&self, name: &str) -> LiveUser {
        let mut inner = self.inner.lock();
        let user = LiveUser {
            id: inner.next_id(),
            name: name.to_string(),
            email: None,
            created_at: Some(Utc::now()),
        };
        inner.users.push(user.clone());
        user
    }

    /// Register a node, returning its id
    pub fn add_node(&self, name: &str, user: &str) -> String {
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        let octet = inner.nodes.len() + 1;
        inner.nodes.push(LiveNode {
            id: id.clone(),
            name: name.to_string(),
            given_name: name.to_string(),
            user: user.to_string(),
            ip_addresses: vec![format!("100.64.0.{octet}")],
            online: true,
            last_seen: Some(Utc::now()),
            expiry: None,
            tags: Vec::new(),
        });
        id
    }

    /// Have `node` advertise `prefix`, returning the route id
    pub fn advertise(&self, node: &str, prefix: &str, enabled: bool) -> String {
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        inner.routes.push(LiveRoute {
            id: id.clone(),
            node: node.to_string(),
            prefix: prefix.to_string(),
            advertised: true,
            enabled,
            primary: enabled,
        });
        id
    }

    pub fn set_live_policy(&self, policy: Option<AclPolicy>) {
        let mut inner = self.inner.lock();
        inner.policy = policy;
        inner.policy_unreadable = false;
    }

    /// Make `get_policy` fail to decode until a policy is set
    pub fn set_unreadable_policy(&self) {
        self.inner.lock().policy_unreadable = true;
    }

    /// Every call of `operation` fails
    pub fn fail_operation(&self, operation: &'static str) {
        self.inner.lock().failures.insert((operation, None));
    }

    /// Calls of `operation` against `target` fail (user name, route id,
    /// node id, or key owner)
    pub fn fail_for(&self, operation: &'static str, target: &str) {
        self.inner
            .lock()
            .failures
            .insert((operation, Some(target.to_string())));
    }

    pub fn clear_failures(&self) {
        self.inner.lock().failures.clear();
    }

    pub fn users(&self) -> Vec<LiveUser> {
        self.inner.lock().users.clone()
    }

    pub fn routes(&self) -> Vec<LiveRoute> {
        self.inner.lock().routes.clone()
    }

    pub fn policy(&self) -> Option<AclPolicy> {
        self.inner.lock().policy.clone()
    }

    pub fn nodes(&self) -> Vec<LiveNode> {
        self.inner.lock().nodes.clone()
    }

    pub fn keys(&self) -> Vec<AuthKey> {
        self.inner.lock().keys.clone()
    }

    pub fn calls(&self) -> Vec<ControlPlaneCall> {
        self.inner.lock().calls.iter().cloned().collect()
    }

    pub fn mutations(&self) -> Vec<ControlPlaneCall> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }
}

fn generate_key() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    format!("hskey_{}", hex::encode(bytes))
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn list_users(&self) -> ControlPlaneResult<Vec<LiveUser>> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::ListUsers);
        inner.check("list users", None)?;
        Ok(inner.users.clone())
    }

    async fn create_user(&self, user: &User) -> ControlPlaneResult<LiveUser> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::CreateUser(user.name.clone()));
        inner.check("create user", Some(&user.name))?;
        if inner.users.iter().any(|u| u.name == user.name) {
            return Err(ControlPlaneError::rejected("create user", "user already exists"));
        }
        let live = LiveUser {
            id: inner.next_id(),
            name: user.name.clone(),
            email: Some(user.email.clone()).filter(|e| !e.is_empty()),
            created_at: Some(Utc::now()),
        };
        inner.users.push(live.clone());
        Ok(live)
    }

    async fn list_routes(&self) -> ControlPlaneResult<Vec<LiveRoute>> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::ListRoutes);
        inner.check("list routes", None)?;
        Ok(inner.routes.clone())
    }

    async fn enable_route(&self, route_id: &str) -> ControlPlaneResult<()> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::EnableRoute(route_id.to_string()));
        inner.check("enable route", Some(route_id))?;
        let route = inner
            .routes
            .iter_mut()
            .find(|r| r.id == route_id)
            .ok_or_else(|| ControlPlaneError::not_found("route", route_id))?;
        route.enabled = true;
        route.primary = true;
        Ok(())
    }

    async fn get_policy(&self) -> ControlPlaneResult<Option<AclPolicy>> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::GetPolicy);
        inner.check("get policy", None)?;
        if inner.policy_unreadable {
            return Err(ControlPlaneError::Decode {
                operation: "get policy",
                message: "live policy is not valid JSON".to_string(),
            });
        }
        Ok(inner.policy.clone())
    }

    async fn set_policy(&self, policy: &AclPolicy) -> ControlPlaneResult<()> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::SetPolicy);
        inner.check("set policy", None)?;
        inner.policy = Some(policy.clone());
        inner.policy_unreadable = false;
        Ok(())
    }

    async fn list_nodes(&self) -> ControlPlaneResult<Vec<LiveNode>> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::ListNodes);
        inner.check("list nodes", None)?;
        Ok(inner.nodes.clone())
    }

    async fn delete_node(&self, node_id: &str) -> ControlPlaneResult<()> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::DeleteNode(node_id.to_string()));
        inner.check("delete node", Some(node_id))?;
        let pos = inner
            .nodes
            .iter()
            .position(|n| n.id == node_id)
            .ok_or_else(|| ControlPlaneError::not_found("node", node_id))?;
        let node = inner.nodes.remove(pos);
        inner.routes.retain(|r| r.node != node.given_name);
        Ok(())
    }

    async fn expire_node(&self, node_id: &str) -> ControlPlaneResult<()> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::ExpireNode(node_id.to_string()));
        inner.check("expire node", Some(node_id))?;
        let node = inner
            .nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| ControlPlaneError::not_found("node", node_id))?;
        node.expiry = Some(Utc::now());
        Ok(())
    }

    async fn create_auth_key(&self, spec: &AuthKeySpec) -> ControlPlaneResult<AuthKey> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::CreateAuthKey(spec.user.clone()));
        inner.check("create auth key", Some(&spec.user))?;
        if !inner.users.iter().any(|u| u.name == spec.user) {
            return Err(ControlPlaneError::not_found("user", spec.user.clone()));
        }
        let key = AuthKey {
            id: Some(inner.next_id()),
            key: generate_key(),
            user: spec.user.clone(),
            ephemeral: spec.ephemeral,
            reusable: spec.reusable,
            used: false,
            expiration: spec.expiration,
            created_at: Some(Utc::now()),
            tags: spec.tags.clone(),
        };
        inner.keys.push(key.clone());
        Ok(key)
    }

    async fn list_auth_keys(&self, user: &str) -> ControlPlaneResult<Vec<AuthKey>> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::ListAuthKeys(user.to_string()));
        inner.check("list auth keys", Some(user))?;
        Ok(inner.keys.iter().filter(|k| k.user == user).cloned().collect())
    }

    async fn expire_auth_key(&self, user: &str, key: &str) -> ControlPlaneResult<()> {
        let mut inner = self.inner.lock();
        inner.record(ControlPlaneCall::ExpireAuthKey {
            user: user.to_string(),
            key: key.to_string(),
        });
        inner.check("expire auth key", Some(user))?;
        let found = inner
            .keys
            .iter_mut()
            .find(|k| k.user == user && k.key == key)
            .ok_or_else(|| ControlPlaneError::not_found("auth key", key))?;
        found.expiration = Utc::now();
        Ok(())
    }
}
