//! Drift detection
//!
//! Read-only comparison of desired state against live state. Users are
//! compared by name, routes as (node, prefix) pairs against the routes the
//! control plane has enabled.

use std::collections::BTreeSet;
use std::sync::Arc;

use meshsync_common::{ControlPlaneError, DesiredState, DriftReport, DriftSummary, LoadError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::control_plane::ControlPlane;
use crate::metrics::{MetricsSink, DRIFT_CHECKS_TOTAL};
use crate::state::DesiredStateStore;

/// Why a drift check produced no report
#[derive(Error, Debug)]
pub enum DriftError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

/// Detects configuration drift between the store and the control plane
pub struct DriftDetector {
    control_plane: Arc<dyn ControlPlane>,
    metrics: Arc<dyn MetricsSink>,
}

impl DriftDetector {
    pub fn new(control_plane: Arc<dyn ControlPlane>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            control_plane,
            metrics,
        }
    }

    /// Load a fresh snapshot from `store` and compare it
    pub async fn detect_from(&self, store: &DesiredStateStore) -> Result<DriftReport, DriftError> {
        let desired = store.load().await.map_err(|e| {
            warn!("Drift check aborted: {}", e);
            self.metrics.increment(DRIFT_CHECKS_TOTAL, "has_drift", "error");
            e
        })?;
        Ok(self.detect(&desired).await?)
    }

    pub async fn detect(&self, desired: &DesiredState) -> Result<DriftReport, ControlPlaneError> {
        let live = tokio::try_join!(
            self.control_plane.list_users(),
            self.control_plane.list_routes()
        );
        let (live_users, live_routes) = match live {
            Ok(live) => live,
            Err(e) => {
                warn!("Drift check failed: {}", e);
                self.metrics.increment(DRIFT_CHECKS_TOTAL, "has_drift", "error");
                return Err(e);
            }
        };

        let mut drifts = Vec::new();

        let live_names: BTreeSet<&str> = live_users.iter().map(|u| u.name.as_str()).collect();
        let desired_names: BTreeSet<&str> = desired.users.iter().map(|u| u.name.as_str()).collect();
        let mut reported = BTreeSet::new();
        for user in &live_users {
            if !desired_names.contains(user.name.as_str()) && reported.insert(user.name.as_str()) {
                drifts.push(format!("User {} exists in Headscale but not in config", user.name));
            }
        }
        for user in &desired.users {
            if !live_names.contains(user.name.as_str()) && reported.insert(user.name.as_str()) {
                drifts.push(format!("User {} exists in config but not in Headscale", user.name));
            }
        }

        let live_pairs: BTreeSet<(&str, &str)> = live_routes
            .iter()
            .filter(|r| r.enabled)
            .map(|r| (r.node.as_str(), r.prefix.as_str()))
            .collect();
        let desired_prefixes: Vec<(&str, Vec<String>)> = desired
            .routes
            .iter()
            .map(|r| (r.node.as_str(), r.prefixes()))
            .collect();
        let desired_pairs: BTreeSet<(&str, &str)> = desired_prefixes
            .iter()
            .flat_map(|(node, prefixes)| prefixes.iter().map(move |p| (*node, p.as_str())))
            .collect();

        let mut reported = BTreeSet::new();
        for route in live_routes.iter().filter(|r| r.enabled) {
            let pair = (route.node.as_str(), route.prefix.as_str());
            if !desired_pairs.contains(&pair) && reported.insert(pair) {
                drifts.push(format!(
                    "Route {} on node {} exists in Headscale but not in config",
                    route.prefix, route.node
                ));
            }
        }
        for (node, prefixes) in &desired_prefixes {
            for prefix in prefixes {
                let pair = (*node, prefix.as_str());
                if !live_pairs.contains(&pair) && reported.insert(pair) {
                    drifts.push(format!(
                        "Route {prefix} on node {node} exists in config but not in Headscale"
                    ));
                }
            }
        }

        let has_drift = !drifts.is_empty();
        self.metrics.increment(
            DRIFT_CHECKS_TOTAL,
            "has_drift",
            if has_drift { "true" } else { "false" },
        );
        if has_drift {
            info!("Drift detected: {} discrepancies", drifts.len());
        } else {
            debug!("No drift detected");
        }

        Ok(DriftReport {
            has_drift,
            summary: DriftSummary {
                headscale_users_count: live_users.len(),
                config_users_count: desired.users.len(),
                headscale_routes_count: live_routes.len(),
                config_routes_count: desired.routes.len(),
                drift_count: drifts.len(),
            },
            drifts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::MemoryControlPlane;
    use crate::metrics::RecordingSink;
    use meshsync_common::{Route, User};

    fn detector(plane: &Arc<MemoryControlPlane>) -> (DriftDetector, RecordingSink) {
        let sink = RecordingSink::new();
        (DriftDetector::new(plane.clone(), Arc::new(sink.clone())), sink)
    }

    #[tokio::test]
    async fn test_user_drift_is_symmetric() {
        let plane = Arc::new(MemoryControlPlane::with_users(&["alice", "carol"]));
        let (detector, sink) = detector(&plane);
        let desired = DesiredState {
            users: vec![User::new("alice"), User::new("bob")],
            ..Default::default()
        };

        let report = detector.detect(&desired).await.unwrap();
        assert!(report.has_drift);
        assert_eq!(
            report.drifts,
            vec![
                "User carol exists in Headscale but not in config",
                "User bob exists in config but not in Headscale",
            ]
        );
        assert_eq!(report.summary.headscale_users_count, 2);
        assert_eq!(report.summary.config_users_count, 2);
        assert_eq!(report.summary.drift_count, 2);
        assert_eq!(sink.count(DRIFT_CHECKS_TOTAL, "has_drift", "true"), 1);
    }

    #[tokio::test]
    async fn test_route_drift_uses_enabled_routes_only() {
        let plane = Arc::new(MemoryControlPlane::new());
        plane.advertise("router", "10.0.0.0/8", true);
        plane.advertise("router", "172.16.0.0/12", true);
        plane.advertise("router", "192.168.0.0/16", false);
        let (detector, _) = detector(&plane);
        let desired = DesiredState {
            routes: vec![Route::new("router", &["10.0.0.0/8", "192.168.0.0/16"])],
            ..Default::default()
        };

        let report = detector.detect(&desired).await.unwrap();
        assert_eq!(
            report.drifts,
            vec![
                "Route 172.16.0.0/12 on node router exists in Headscale but not in config",
                "Route 192.168.0.0/16 on node router exists in config but not in Headscale",
            ]
        );
        assert_eq!(report.summary.headscale_routes_count, 3);
        assert_eq!(report.summary.config_routes_count, 1);
    }

    #[tokio::test]
    async fn test_exit_node_prefixes_are_desired() {
        let plane = Arc::new(MemoryControlPlane::new());
        plane.advertise("gw", "0.0.0.0/0", true);
        let (detector, _) = detector(&plane);
        let desired = DesiredState {
            routes: vec![Route {
                node: "gw".into(),
                routes: vec![],
                advertise_exit_node: true,
            }],
            ..Default::default()
        };

        let report = detector.detect(&desired).await.unwrap();
        assert_eq!(
            report.drifts,
            vec!["Route ::/0 on node gw exists in config but not in Headscale"]
        );
    }

    #[tokio::test]
    async fn test_no_drift_and_read_only() {
        let plane = Arc::new(MemoryControlPlane::with_users(&["alice"]));
        plane.advertise("router", "10.0.0.0/8", true);
        let (detector, sink) = detector(&plane);
        let desired = DesiredState {
            users: vec![User::new("alice")],
            routes: vec![Route::new("router", &["10.0.0.0/8"])],
            ..Default::default()
        };

        let report = detector.detect(&desired).await.unwrap();
        assert!(!report.has_drift);
        assert!(report.drifts.is_empty());
        assert!(plane.mutations().is_empty());
        assert_eq!(sink.count(DRIFT_CHECKS_TOTAL, "has_drift", "false"), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_counts_error() {
        let plane = Arc::new(MemoryControlPlane::new());
        plane.fail_operation("list routes");
        let (detector, sink) = detector(&plane);

        assert!(detector.detect(&DesiredState::default()).await.is_err());
        assert_eq!(sink.count(DRIFT_CHECKS_TOTAL, "has_drift", "error"), 1);
    }

    #[tokio::test]
    async fn test_detect_from_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = DesiredStateStore::new(dir.path());
        let plane = Arc::new(MemoryControlPlane::new());
        let (detector, sink) = detector(&plane);

        let err = detector.detect_from(&store).await.unwrap_err();
        assert!(matches!(err, DriftError::Load(ref e) if e.is_missing()));
        assert!(plane.calls().is_empty());
        assert_eq!(sink.count(DRIFT_CHECKS_TOTAL, "has_drift", "error"), 1);
    }
}
