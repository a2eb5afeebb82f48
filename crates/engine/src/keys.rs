//! Pre-authentication key issuance

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use meshsync_common::{AuthKey, AuthKeyRequest, AuthKeySpec, ControlPlaneError};
use tracing::{debug, info};

use crate::control_plane::ControlPlane;

/// Lifetime of a key when the request names none, or one we can't parse
pub const DEFAULT_KEY_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Resolve a duration string like `24h` or `1h30m` against `now`.
/// Missing, empty and unparseable inputs all fall back to the default.
pub fn resolve_expiration(expiration: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    let lifetime = expiration
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| match humantime::parse_duration(s) {
            Ok(d) => Some(d),
            Err(e) => {
                debug!("Ignoring expiration {:?}: {}", s, e);
                None
            }
        })
        .unwrap_or(DEFAULT_KEY_LIFETIME);

    chrono::Duration::from_std(lifetime)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Issues, lists and revokes keys through the control plane
pub struct AuthKeyIssuer {
    control_plane: Arc<dyn ControlPlane>,
}

impl AuthKeyIssuer {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }

    pub async fn issue(&self, request: AuthKeyRequest) -> Result<AuthKey, ControlPlaneError> {
        let spec = AuthKeySpec {
            expiration: resolve_expiration(request.expiration.as_deref(), Utc::now()),
            user: request.user,
            ephemeral: request.ephemeral,
            reusable: request.reusable,
            tags: request.tags,
        };
        let key = self.control_plane.create_auth_key(&spec).await?;
        info!(
            "Created auth key for user {} (reusable={}, ephemeral={}, expires {})",
            key.user, key.reusable, key.ephemeral, key.expiration
        );
        Ok(key)
    }

    pub async fn list(&self, user: &str) -> Result<Vec<AuthKey>, ControlPlaneError> {
        self.control_plane.list_auth_keys(user).await
    }

    /// Keys of every live user, in user order
    pub async fn list_all(&self) -> Result<Vec<AuthKey>, ControlPlaneError> {
        let users = self.control_plane.list_users().await?;
        let mut keys = Vec::new();
        for user in users {
            keys.extend(self.control_plane.list_auth_keys(&user.name).await?);
        }
        Ok(keys)
    }

    pub async fn revoke(&self, user: &str, key: &str) -> Result<(), ControlPlaneError> {
        self.control_plane.expire_auth_key(user, key).await?;
        info!("Expired auth key for user {}", user);
        Ok(())
    }
}
