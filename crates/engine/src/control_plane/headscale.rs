//! Headscale REST client
//!
//! Base path: /api/v1/
//! Auth: `Authorization: Bearer <api key>`
//!
//! Wire types mirror the grpc-gateway JSON that Headscale emits (camelCase,
//! 64-bit ids as strings) and are converted into the engine's live views.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshsync_common::{
    AclPolicy, AuthKey, AuthKeySpec, ControlPlaneError, ControlPlaneResult, LiveNode, LiveRoute,
    LiveUser, User,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Response, StatusCode};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use url::Url;

use super::ControlPlane;

/// Connection settings for a Headscale server
#[derive(Clone)]
pub struct HeadscaleConfig {
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for HeadscaleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadscaleConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Control plane backed by the Headscale HTTP API
pub struct HeadscaleClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HeadscaleClient {
    pub fn new(config: &HeadscaleConfig) -> ControlPlaneResult<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| ControlPlaneError::rejected("configure client", format!("invalid API key: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ControlPlaneError::Transport {
                operation: "configure client",
                message: e.to_string(),
            })?;

        Self::with_client(http, &config.url)
    }

    /// Wrap an existing `reqwest::Client` (caller manages auth headers).
    pub fn with_client(http: reqwest::Client, base_url: &str) -> ControlPlaneResult<Self> {
        let mut base_url = Url::parse(base_url).map_err(|e| {
            ControlPlaneError::rejected("configure client", format!("invalid URL {base_url}: {e}"))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    /// `api/v1/` followed by `segments`. Each segment is percent-encoded on
    /// its own, so an id can never add or climb path levels.
    fn url(&self, operation: &'static str, segments: &[&str]) -> ControlPlaneResult<Url> {
        if let Some(bad) = segments.iter().find(|s| matches!(**s, "" | "." | "..")) {
            return Err(ControlPlaneError::rejected(
                operation,
                format!("invalid path segment {bad:?}"),
            ));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ControlPlaneError::rejected(operation, "base URL cannot hold a path"))?
            .pop_if_empty()
            .extend(["api", "v1"])
            .extend(segments);
        Ok(url)
    }

    // ========================================================================
    // HTTP verbs
    // ========================================================================

    async fn get<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &[&str],
        params: &[(&str, &str)],
    ) -> ControlPlaneResult<T> {
        let url = self.url(operation, path)?;
        debug!("GET {url}");
        let resp = self
            .http
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| transport(operation, e))?;
        decode(operation, resp).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        operation: &'static str,
        path: &[&str],
        body: &B,
    ) -> ControlPlaneResult<T> {
        let url = self.url(operation, path)?;
        debug!("POST {url}");
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport(operation, e))?;
        decode(operation, resp).await
    }

    async fn put<B: Serialize + Sync>(
        &self,
        operation: &'static str,
        path: &[&str],
        body: &B,
    ) -> ControlPlaneResult<()> {
        let url = self.url(operation, path)?;
        debug!("PUT {url}");
        let resp = self
            .http
            .put(url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport(operation, e))?;
        check_status(operation, resp).await.map(drop)
    }

    async fn delete(&self, operation: &'static str, path: &[&str]) -> ControlPlaneResult<()> {
        let url = self.url(operation, path)?;
        debug!("DELETE {url}");
        let resp = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(|e| transport(operation, e))?;
        check_status(operation, resp).await.map(drop)
    }
}

fn transport(operation: &'static str, e: reqwest::Error) -> ControlPlaneError {
    ControlPlaneError::Transport {
        operation,
        message: e.to_string(),
    }
}

async fn check_status(operation: &'static str, resp: Response) -> ControlPlaneResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ControlPlaneError::Status {
        operation,
        status: status.as_u16(),
        body: error_message(&body),
    })
}

async fn decode<T: DeserializeOwned>(operation: &'static str, resp: Response) -> ControlPlaneResult<T> {
    let resp = check_status(operation, resp).await?;
    let bytes = resp.bytes().await.map_err(|e| transport(operation, e))?;
    serde_json::from_slice(&bytes).map_err(|e| ControlPlaneError::Decode {
        operation,
        message: e.to_string(),
    })
}

/// grpc-gateway errors look like `{"code": 5, "message": "..."}`
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct GatewayError {
        message: String,
    }
    serde_json::from_str::<GatewayError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

// ============================================================================
// Wire types
// ============================================================================

fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("unexpected id: {other}"))),
    }
}

/// Users appear either by name or as a nested user object.
fn user_name<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Object(map) => Ok(map
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(D::Error::custom(format!("unexpected user: {other}"))),
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.is_empty())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUser {
    #[serde(deserialize_with = "id_string")]
    id: String,
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl From<WireUser> for LiveUser {
    fn from(u: WireUser) -> Self {
        Self {
            id: u.id,
            name: u.name,
            email: non_empty(u.email),
            created_at: u.created_at,
        }
    }
}

#[derive(Deserialize)]
struct UsersEnvelope {
    #[serde(default)]
    users: Vec<WireUser>,
}

#[derive(Deserialize)]
struct UserEnvelope {
    user: WireUser,
}

#[derive(Serialize)]
struct CreateUserBody<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    email: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNode {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    given_name: String,
    #[serde(default, deserialize_with = "user_name")]
    user: String,
    #[serde(default)]
    ip_addresses: Vec<String>,
    #[serde(default)]
    online: bool,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    forced_tags: Vec<String>,
    #[serde(default)]
    valid_tags: Vec<String>,
}

impl WireNode {
    /// Desired routes name nodes by their DNS name, which Headscale calls
    /// the given name.
    fn display_name(&self) -> &str {
        if self.given_name.is_empty() {
            &self.name
        } else {
            &self.given_name
        }
    }
}

impl From<WireNode> for LiveNode {
    fn from(n: WireNode) -> Self {
        let mut tags = n.forced_tags;
        for tag in n.valid_tags {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Self {
            id: n.id,
            name: n.name,
            given_name: n.given_name,
            user: n.user,
            ip_addresses: n.ip_addresses,
            online: n.online,
            last_seen: n.last_seen,
            expiry: n.expiry,
            tags,
        }
    }
}

#[derive(Deserialize)]
struct NodesEnvelope {
    #[serde(default)]
    nodes: Vec<WireNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRoute {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default)]
    node: Option<WireNode>,
    prefix: String,
    #[serde(default)]
    advertised: bool,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    is_primary: bool,
}

impl From<WireRoute> for LiveRoute {
    fn from(r: WireRoute) -> Self {
        Self {
            id: r.id,
            node: r
                .node
                .as_ref()
                .map(|n| n.display_name().to_string())
                .unwrap_or_default(),
            prefix: r.prefix,
            advertised: r.advertised,
            enabled: r.enabled,
            primary: r.is_primary,
        }
    }
}

#[derive(Deserialize)]
struct RoutesEnvelope {
    #[serde(default)]
    routes: Vec<WireRoute>,
}

#[derive(Serialize, Deserialize)]
struct PolicyEnvelope {
    #[serde(default)]
    policy: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePreAuthKey {
    #[serde(default, deserialize_with = "user_name")]
    user: String,
    #[serde(deserialize_with = "id_string")]
    id: String,
    key: String,
    #[serde(default)]
    reusable: bool,
    #[serde(default)]
    ephemeral: bool,
    #[serde(default)]
    used: bool,
    expiration: DateTime<Utc>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    acl_tags: Vec<String>,
}

impl From<WirePreAuthKey> for AuthKey {
    fn from(k: WirePreAuthKey) -> Self {
        Self {
            id: Some(k.id),
            key: k.key,
            user: k.user,
            ephemeral: k.ephemeral,
            reusable: k.reusable,
            used: k.used,
            expiration: k.expiration,
            created_at: k.created_at,
            tags: k.acl_tags,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreAuthKeyEnvelope {
    pre_auth_key: WirePreAuthKey,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreAuthKeysEnvelope {
    #[serde(default)]
    pre_auth_keys: Vec<WirePreAuthKey>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePreAuthKeyBody<'a> {
    user: &'a str,
    reusable: bool,
    ephemeral: bool,
    expiration: DateTime<Utc>,
    acl_tags: &'a [String],
}

#[derive(Serialize)]
struct ExpirePreAuthKeyBody<'a> {
    user: &'a str,
    key: &'a str,
}

/// Empty JSON object, for endpoints that answer `{}`
#[derive(Deserialize)]
struct Empty {}

// ============================================================================
// ControlPlane implementation
// ============================================================================

#[async_trait]
impl ControlPlane for HeadscaleClient {
    async fn list_users(&self) -> ControlPlaneResult<Vec<LiveUser>> {
        let env: UsersEnvelope = self.get("list users", &["user"], &[]).await?;
        Ok(env.users.into_iter().map(LiveUser::from).collect())
    }

    async fn create_user(&self, user: &User) -> ControlPlaneResult<LiveUser> {
        let body = CreateUserBody {
            name: &user.name,
            email: &user.email,
        };
        let env: UserEnvelope = self.post("create user", &["user"], &body).await?;
        Ok(env.user.into())
    }

    async fn list_routes(&self) -> ControlPlaneResult<Vec<LiveRoute>> {
        let env: RoutesEnvelope = self.get("list routes", &["routes"], &[]).await?;
        Ok(env.routes.into_iter().map(LiveRoute::from).collect())
    }

    async fn enable_route(&self, route_id: &str) -> ControlPlaneResult<()> {
        let path = ["routes", route_id, "enable"];
        let _: Empty = self.post("enable route", &path, &serde_json::json!({})).await?;
        Ok(())
    }

    async fn get_policy(&self) -> ControlPlaneResult<Option<AclPolicy>> {
        let env: PolicyEnvelope = match self.get("get policy", &["policy"], &[]).await {
            Ok(env) => env,
            Err(ControlPlaneError::Status { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        if env.policy.trim().is_empty() {
            return Ok(None);
        }
        // Hand-edited HuJSON with comments won't parse
        serde_json::from_str(&env.policy)
            .map(Some)
            .map_err(|e| ControlPlaneError::Decode {
                operation: "get policy",
                message: format!("live policy is not valid JSON: {e}"),
            })
    }

    async fn set_policy(&self, policy: &AclPolicy) -> ControlPlaneResult<()> {
        let policy = serde_json::to_string_pretty(policy).map_err(|e| {
            ControlPlaneError::rejected("set policy", format!("encode policy: {e}"))
        })?;
        self.put("set policy", &["policy"], &PolicyEnvelope { policy }).await
    }

    async fn list_nodes(&self) -> ControlPlaneResult<Vec<LiveNode>> {
        let env: NodesEnvelope = self.get("list nodes", &["node"], &[]).await?;
        Ok(env.nodes.into_iter().map(LiveNode::from).collect())
    }

    async fn delete_node(&self, node_id: &str) -> ControlPlaneResult<()> {
        match self.delete("delete node", &["node", node_id]).await {
            Err(ControlPlaneError::Status { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Err(ControlPlaneError::not_found("node", node_id))
            }
            other => other,
        }
    }

    async fn expire_node(&self, node_id: &str) -> ControlPlaneResult<()> {
        let path = ["node", node_id, "expire"];
        match self
            .post::<serde_json::Value, _>("expire node", &path, &serde_json::json!({}))
            .await
        {
            Ok(_) => Ok(()),
            Err(ControlPlaneError::Status { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Err(ControlPlaneError::not_found("node", node_id))
            }
            Err(e) => Err(e),
        }
    }

    async fn create_auth_key(&self, spec: &AuthKeySpec) -> ControlPlaneResult<AuthKey> {
        let body = CreatePreAuthKeyBody {
            user: &spec.user,
            reusable: spec.reusable,
            ephemeral: spec.ephemeral,
            expiration: spec.expiration,
            acl_tags: &spec.tags,
        };
        let env: PreAuthKeyEnvelope = match self.post("create auth key", &["preauthkey"], &body).await {
            Ok(env) => env,
            Err(ControlPlaneError::Status { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                return Err(ControlPlaneError::not_found("user", spec.user.clone()))
            }
            Err(e) => return Err(e),
        };
        let mut key = AuthKey::from(env.pre_auth_key);
        if key.user.is_empty() {
            key.user = spec.user.clone();
        }
        Ok(key)
    }

    async fn list_auth_keys(&self, user: &str) -> ControlPlaneResult<Vec<AuthKey>> {
        let env: PreAuthKeysEnvelope = self
            .get("list auth keys", &["preauthkey"], &[("user", user)])
            .await?;
        Ok(env
            .pre_auth_keys
            .into_iter()
            .map(|k| {
                let mut key = AuthKey::from(k);
                if key.user.is_empty() {
                    key.user = user.to_string();
                }
                key
            })
            .collect())
    }

    async fn expire_auth_key(&self, user: &str, key: &str) -> ControlPlaneResult<()> {
        let body = ExpirePreAuthKeyBody { user, key };
        let _: Empty = self.post("expire auth key", &["preauthkey", "expire"], &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (MockServer, HeadscaleClient) {
        let server = MockServer::start().await;
        let client = HeadscaleClient::new(&HeadscaleConfig {
            url: server.uri(),
            api_key: "hs-test-key".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_list_users_sends_bearer_and_decodes() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/user"))
            .and(header("authorization", "Bearer hs-test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [
                    {"id": "1", "name": "alice", "createdAt": "2024-05-01T10:00:00Z", "email": ""},
                    {"id": 2, "name": "bob", "email": "bob@example.com"}
                ]
            })))
            .mount(&server)
            .await;

        let users = client.list_users().await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id, "1");
        assert_eq!(users[0].email, None);
        assert!(users[0].created_at.is_some());
        assert_eq!(users[1].id, "2");
        assert_eq!(users[1].email.as_deref(), Some("bob@example.com"));
    }

    #[tokio::test]
    async fn test_create_user_posts_name_and_email() {
        let (server, client) = setup().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/user"))
            .and(body_json(json!({"name": "carol", "email": "carol@example.com"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user": {"id": "7", "name": "carol"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut user = User::new("carol");
        user.email = "carol@example.com".into();
        let created = client.create_user(&user).await.unwrap();
        assert_eq!(created.id, "7");
    }

    #[tokio::test]
    async fn test_error_status_carries_gateway_message() {
        let (server, client) = setup().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/user"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(json!({"code": 2, "message": "user already exists"})),
            )
            .mount(&server)
            .await;

        let err = client.create_user(&User::new("alice")).await.unwrap_err();
        match err {
            ControlPlaneError::Status { status, body, operation } => {
                assert_eq!(status, 500);
                assert_eq!(body, "user already exists");
                assert_eq!(operation, "create user");
            }
            other => panic!("expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_routes_uses_given_name() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/routes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "routes": [{
                    "id": "3",
                    "node": {"id": "1", "name": "router-abc123", "givenName": "router"},
                    "prefix": "10.0.0.0/8",
                    "advertised": true,
                    "enabled": false,
                    "isPrimary": false
                }]
            })))
            .mount(&server)
            .await;

        let routes = client.list_routes().await.unwrap();
        assert_eq!(
            routes,
            vec![LiveRoute {
                id: "3".into(),
                node: "router".into(),
                prefix: "10.0.0.0/8".into(),
                advertised: true,
                enabled: false,
                primary: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_enable_route() {
        let (server, client) = setup().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/routes/3/enable"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        client.enable_route("3").await.unwrap();
    }

    #[tokio::test]
    async fn test_policy_round_trip() {
        let (server, client) = setup().await;
        let policy: AclPolicy = serde_json::from_value(json!({
            "groups": {"group:eng": ["alice"]},
            "acls": [{"action": "accept", "src": ["group:eng"], "dst": ["*:*"]}]
        }))
        .unwrap();
        let encoded = serde_json::to_string_pretty(&policy).unwrap();

        Mock::given(method("PUT"))
            .and(path("/api/v1/policy"))
            .and(body_json(json!({"policy": encoded})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"policy": encoded})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/policy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "policy": encoded,
                "updatedAt": "2024-05-01T10:00:00Z"
            })))
            .mount(&server)
            .await;

        client.set_policy(&policy).await.unwrap();
        assert_eq!(client.get_policy().await.unwrap(), Some(policy));
    }

    #[tokio::test]
    async fn test_missing_policy_is_none_and_unparseable_is_decode_error() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/policy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "policy": "{ // hujson comment\n \"acls\": [] }"
            })))
            .mount(&server)
            .await;
        assert!(matches!(
            client.get_policy().await,
            Err(ControlPlaneError::Decode { operation: "get policy", .. })
        ));

        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/policy"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;
        assert_eq!(client.get_policy().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_auth_key() {
        let (server, client) = setup().await;
        let expiration: DateTime<Utc> = "2030-01-01T00:00:00Z".parse().unwrap();

        Mock::given(method("POST"))
            .and(path("/api/v1/preauthkey"))
            .and(body_json(json!({
                "user": "alice",
                "reusable": true,
                "ephemeral": false,
                "expiration": "2030-01-01T00:00:00Z",
                "aclTags": ["tag:server"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "preAuthKey": {
                    "user": "alice",
                    "id": "12",
                    "key": "abcdef0123456789",
                    "reusable": true,
                    "ephemeral": false,
                    "used": false,
                    "expiration": "2030-01-01T00:00:00Z",
                    "createdAt": "2029-12-31T00:00:00Z",
                    "aclTags": ["tag:server"]
                }
            })))
            .mount(&server)
            .await;

        let key = client
            .create_auth_key(&AuthKeySpec {
                user: "alice".into(),
                ephemeral: false,
                reusable: true,
                expiration,
                tags: vec!["tag:server".into()],
            })
            .await
            .unwrap();
        assert_eq!(key.key, "abcdef0123456789");
        assert_eq!(key.id.as_deref(), Some("12"));
        assert_eq!(key.expiration, expiration);
        assert_eq!(key.tags, vec!["tag:server"]);
    }

    #[tokio::test]
    async fn test_list_and_expire_auth_keys() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/preauthkey"))
            .and(query_param("user", "alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "preAuthKeys": [{
                    "id": "1",
                    "key": "k1",
                    "expiration": "2030-01-01T00:00:00Z"
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/preauthkey/expire"))
            .and(body_json(json!({"user": "alice", "key": "k1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let keys = client.list_auth_keys("alice").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].user, "alice");
        client.expire_auth_key("alice", "k1").await.unwrap();
    }

    #[tokio::test]
    async fn test_node_operations() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/node"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nodes": [{
                    "id": "1",
                    "name": "laptop",
                    "givenName": "laptop",
                    "user": {"id": "1", "name": "alice"},
                    "ipAddresses": ["100.64.0.1"],
                    "online": true,
                    "forcedTags": ["tag:dev"],
                    "validTags": ["tag:dev", "tag:ci"]
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/node/9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/node/1/expire"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"node": {"id": "1"}})))
            .mount(&server)
            .await;

        let nodes = client.list_nodes().await.unwrap();
        assert_eq!(nodes[0].user, "alice");
        assert_eq!(nodes[0].tags, vec!["tag:dev", "tag:ci"]);

        assert!(matches!(
            client.delete_node("9").await,
            Err(ControlPlaneError::NotFound { .. })
        ));
        client.expire_node("1").await.unwrap();
    }

    #[tokio::test]
    async fn test_ids_stay_inside_their_path_segment() {
        let (server, client) = setup().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        for id in ["..", ".", ""] {
            assert!(matches!(
                client.delete_node(id).await,
                Err(ControlPlaneError::Rejected { .. })
            ));
        }
        client.delete_node("../user/5").await.unwrap();
        client.expire_node("1/../../user/5").await.unwrap();
        client.enable_route("3/../../node/1").await.unwrap();

        let seen: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| format!("{} {}", r.method, r.url.path()))
            .collect();
        assert_eq!(
            seen,
            vec![
                "DELETE /api/v1/node/..%2Fuser%2F5",
                "POST /api/v1/node/1%2F..%2F..%2Fuser%2F5/expire",
                "POST /api/v1/routes/3%2F..%2F..%2Fnode%2F1/enable",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_auth_key_for_unknown_user() {
        let (server, client) = setup().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/preauthkey"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(json!({"code": 5, "message": "user not found"})),
            )
            .mount(&server)
            .await;

        let err = client
            .create_auth_key(&AuthKeySpec {
                user: "ghost".into(),
                ephemeral: false,
                reusable: false,
                expiration: chrono::Utc::now(),
                tags: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound { kind: "user", .. }));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let client = HeadscaleClient::new(&HeadscaleConfig {
            url: "http://127.0.0.1:1".to_string(),
            api_key: "k".to_string(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert!(matches!(
            client.list_users().await,
            Err(ControlPlaneError::Transport { .. })
        ));
    }
}
