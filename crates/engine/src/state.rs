//! Desired-state store
//!
//! The three documents live as YAML files under the data directory. Each
//! load reads the files fresh and hands back an owned snapshot, so a
//! reconciliation pass never observes a half-written store. Writes are
//! serialized and replace files atomically.

use meshsync_common::{
    AclPolicy, DesiredState, Document, LoadError, LoadErrorKind, Route, StoreError, User,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Loader and editor for the desired-state documents
#[derive(Clone)]
pub struct DesiredStateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    data_path: PathBuf,
    /// Held for read-modify-write cycles. Plain loads never take it.
    write_lock: Mutex<()>,
}

impl DesiredStateStore {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                data_path: data_path.into(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn data_path(&self) -> &Path {
        &self.inner.data_path
    }

    pub fn document_path(&self, document: Document) -> PathBuf {
        self.inner.data_path.join(document.file_name())
    }

    /// Load all three documents. Any single failure fails the whole load.
    pub async fn load(&self) -> Result<DesiredState, LoadError> {
        let (users, routes, policy) =
            tokio::join!(self.load_users(), self.load_routes(), self.load_policy());

        let state = DesiredState {
            users: users?,
            routes: routes?,
            policy: policy?,
        };
        debug!(
            users = state.users.len(),
            routes = state.routes.len(),
            acls = state.policy.acls.len(),
            "Loaded desired state from {}",
            self.inner.data_path.display()
        );
        Ok(state)
    }

    pub async fn load_users(&self) -> Result<Vec<User>, LoadError> {
        self.read_document(Document::Users).await
    }

    pub async fn load_routes(&self) -> Result<Vec<Route>, LoadError> {
        self.read_document(Document::Routes).await
    }

    pub async fn load_policy(&self) -> Result<AclPolicy, LoadError> {
        self.read_document(Document::Acl).await
    }

    async fn read_document<T>(&self, document: Document) -> Result<T, LoadError>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.document_path(document);
        let fail = |kind| LoadError {
            document,
            path: path.clone(),
            kind,
        };

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(fail(LoadErrorKind::Missing))
            }
            Err(e) => return Err(fail(LoadErrorKind::Read(e))),
        };

        // An empty file is an empty document, not a parse error.
        if content.trim().is_empty() {
            return Ok(T::default());
        }

        serde_yaml::from_str(&content).map_err(|e| fail(LoadErrorKind::Malformed(e)))
    }

    /// Like `read_document`, but a missing file starts an empty document.
    async fn read_for_update<T>(&self, document: Document) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Default,
    {
        match self.read_document(document).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_missing() => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_document<T: Serialize>(
        &self,
        document: Document,
        value: &T,
    ) -> Result<(), StoreError> {
        let path = self.document_path(document);
        let yaml = serde_yaml::to_string(value)
            .map_err(|source| StoreError::Encode { document, source })?;

        let dir = self.inner.data_path.clone();
        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(yaml.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)));

        written.map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        debug!("Wrote {} document to {}", document, path.display());
        Ok(())
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Insert or replace a user by name. Returns true when the user is new.
    pub async fn upsert_user(&self, user: User) -> Result<bool, StoreError> {
        let _guard = self.inner.write_lock.lock().await;
        let mut users: Vec<User> = self.read_for_update(Document::Users).await?;

        let created = match users.iter_mut().find(|u| u.name == user.name) {
            Some(existing) => {
                *existing = user.clone();
                false
            }
            None => {
                users.push(user.clone());
                true
            }
        };

        self.write_document(Document::Users, &users).await?;
        info!(
            "{} user {} in config",
            if created { "Added" } else { "Updated" },
            user.name
        );
        Ok(created)
    }

    pub async fn remove_user(&self, name: &str) -> Result<User, StoreError> {
        let _guard = self.inner.write_lock.lock().await;
        let mut users: Vec<User> = self.read_for_update(Document::Users).await?;

        let index = users
            .iter()
            .position(|u| u.name == name)
            .ok_or_else(|| StoreError::NotFound {
                kind: "user",
                id: name.to_string(),
            })?;
        let removed = users.remove(index);

        self.write_document(Document::Users, &users).await?;
        info!("Removed user {} from config", name);
        Ok(removed)
    }

    // ========================================================================
    // Routes
    // ========================================================================

    /// Insert or replace a route entry. Entries are identified by node plus
    /// route set, so the same node may carry several entries.
    pub async fn upsert_route(&self, route: Route) -> Result<bool, StoreError> {
        let _guard = self.inner.write_lock.lock().await;
        let mut routes: Vec<Route> = self.read_for_update(Document::Routes).await?;

        let key = route_set(&route);
        let created = match routes
            .iter_mut()
            .find(|r| r.node == route.node && route_set(r) == key)
        {
            Some(existing) => {
                *existing = route.clone();
                false
            }
            None => {
                routes.push(route.clone());
                true
            }
        };

        self.write_document(Document::Routes, &routes).await?;
        info!("Saved routes for node {} in config", route.node);
        Ok(created)
    }

    /// Drop every route entry for a node. Returns how many were removed.
    pub async fn remove_routes_for_node(&self, node: &str) -> Result<usize, StoreError> {
        let _guard = self.inner.write_lock.lock().await;
        let mut routes: Vec<Route> = self.read_for_update(Document::Routes).await?;

        let before = routes.len();
        routes.retain(|r| r.node != node);
        let removed = before - routes.len();
        if removed == 0 {
            return Err(StoreError::NotFound {
                kind: "routes for node",
                id: node.to_string(),
            });
        }

        self.write_document(Document::Routes, &routes).await?;
        info!("Removed {} route entries for node {} from config", removed, node);
        Ok(removed)
    }

    // ========================================================================
    // ACL policy
    // ========================================================================

    pub async fn save_policy(&self, policy: &AclPolicy) -> Result<(), StoreError> {
        let _guard = self.inner.write_lock.lock().await;
        self.write_document(Document::Acl, policy).await?;
        info!("Saved ACL policy ({} rules) to config", policy.acls.len());
        Ok(())
    }
}

fn route_set(route: &Route) -> BTreeSet<&str> {
    route.routes.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_common::AclAction;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn seeded_store() -> (tempfile::TempDir, DesiredStateStore) {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "users.yaml",
            "- name: alice\n  email: alice@example.com\n  tags: [eng]\n- name: bob\n",
        );
        write(
            dir.path(),
            "routes.yaml",
            "- node: gw\n  routes: [10.0.0.0/8]\n  advertise_exit_node: true\n",
        );
        write(
            dir.path(),
            "acls.yaml",
            "acls:\n  - action: accept\n    src: ['*']\n    dst: ['*:*']\n",
        );
        let store = DesiredStateStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_load_all_documents() {
        let (_dir, store) = seeded_store();
        let state = store.load().await.unwrap();

        assert_eq!(state.users.len(), 2);
        assert_eq!(state.users[0].email, "alice@example.com");
        assert!(state.users[0].tags.contains("eng"));
        assert!(state.routes[0].advertise_exit_node);
        assert_eq!(state.policy.acls[0].action, AclAction::Accept);
    }

    #[tokio::test]
    async fn test_missing_document_fails_whole_load() {
        let (dir, store) = seeded_store();
        std::fs::remove_file(dir.path().join("routes.yaml")).unwrap();

        let err = store.load().await.unwrap_err();
        assert_eq!(err.document, Document::Routes);
        assert!(err.is_missing());
    }

    #[tokio::test]
    async fn test_malformed_document_names_document() {
        let (dir, store) = seeded_store();
        write(dir.path(), "acls.yaml", "acls: [ {action: explode} ]\n");

        let err = store.load().await.unwrap_err();
        assert_eq!(err.document, Document::Acl);
        assert!(matches!(err.kind, LoadErrorKind::Malformed(_)));

        // The other documents still load on their own.
        assert_eq!(store.load_users().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_document_is_empty() {
        let (dir, store) = seeded_store();
        write(dir.path(), "users.yaml", "\n");
        assert!(store.load_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_and_remove_user() {
        let (_dir, store) = seeded_store();

        let mut carol = User::new("carol");
        carol.email = "carol@example.com".into();
        assert!(store.upsert_user(carol.clone()).await.unwrap());

        carol.email = "c@example.com".into();
        assert!(!store.upsert_user(carol).await.unwrap());

        let users = store.load_users().await.unwrap();
        assert_eq!(users.len(), 3);
        assert_eq!(users[2].email, "c@example.com");

        store.remove_user("alice").await.unwrap();
        assert!(matches!(
            store.remove_user("alice").await,
            Err(StoreError::NotFound { .. })
        ));
        assert_eq!(store.load_users().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_creates_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = DesiredStateStore::new(dir.path().join("nested"));

        store.upsert_route(Route::new("gw", &["10.0.0.0/8"])).await.unwrap();
        let routes = store.load_routes().await.unwrap();
        assert_eq!(routes, vec![Route::new("gw", &["10.0.0.0/8"])]);
    }

    #[tokio::test]
    async fn test_route_identity_is_node_and_route_set() {
        let (_dir, store) = seeded_store();

        // Same node, different set: a second entry.
        assert!(store
            .upsert_route(Route::new("gw", &["192.168.0.0/16"]))
            .await
            .unwrap());
        // Same node, same set: replaces the existing entry.
        assert!(!store
            .upsert_route(Route::new("gw", &["10.0.0.0/8"]))
            .await
            .unwrap());

        let routes = store.load_routes().await.unwrap();
        assert_eq!(routes.len(), 2);
        assert!(!routes[0].advertise_exit_node);

        assert_eq!(store.remove_routes_for_node("gw").await.unwrap(), 2);
        assert!(store.load_routes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_policy_round_trips() {
        let (_dir, store) = seeded_store();
        let mut policy = store.load_policy().await.unwrap();
        policy
            .groups
            .insert("group:eng".into(), vec!["alice".into()]);

        store.save_policy(&policy).await.unwrap();
        assert_eq!(store.load_policy().await.unwrap(), policy);
    }
}
