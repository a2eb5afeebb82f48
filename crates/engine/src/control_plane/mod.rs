//! Control-plane adapter interface
//!
//! Everything the engine needs from the remote mesh coordination service:
//! - Headscale REST API (production)
//! - In-memory control plane (tests and local development)

pub mod headscale;
pub mod memory;

use async_trait::async_trait;
use meshsync_common::{
    AclPolicy, AuthKey, AuthKeySpec, ControlPlaneResult, LiveNode, LiveRoute, LiveUser, User,
};

pub use headscale::{HeadscaleClient, HeadscaleConfig};
pub use memory::{ControlPlaneCall, MemoryControlPlane};

/// Operations the engine issues against the control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_users(&self) -> ControlPlaneResult<Vec<LiveUser>>;

    async fn create_user(&self, user: &User) -> ControlPlaneResult<LiveUser>;

    async fn list_routes(&self) -> ControlPlaneResult<Vec<LiveRoute>>;

    async fn enable_route(&self, route_id: &str) -> ControlPlaneResult<()>;

    /// Current policy, or `None` when the control plane has none set.
    /// A policy that exists but cannot be parsed is a `Decode` error.
    async fn get_policy(&self) -> ControlPlaneResult<Option<AclPolicy>>;

    async fn set_policy(&self, policy: &AclPolicy) -> ControlPlaneResult<()>;

    async fn list_nodes(&self) -> ControlPlaneResult<Vec<LiveNode>>;

    async fn delete_node(&self, node_id: &str) -> ControlPlaneResult<()>;

    async fn expire_node(&self, node_id: &str) -> ControlPlaneResult<()>;

    async fn create_auth_key(&self, spec: &AuthKeySpec) -> ControlPlaneResult<AuthKey>;

    async fn list_auth_keys(&self, user: &str) -> ControlPlaneResult<Vec<AuthKey>>;

    async fn expire_auth_key(&self, user: &str, key: &str) -> ControlPlaneResult<()>;
}
