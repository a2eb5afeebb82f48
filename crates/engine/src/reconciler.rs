//! Reconciliation pipeline
//!
//! Pushes desired state onto the control plane as an ordered pipeline of
//! steps: users, then routes, then the ACL policy (which may reference users
//! created earlier in the same pass). Each step fetches the live state it
//! needs, plans against it, then either executes or describes the plan.
//! Nothing that exists live but not in config is ever removed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use meshsync_common::{
    AclPolicy, ApplyOptions, ApplyResult, ApplyStats, ControlPlaneError, DesiredState, LiveRoute,
    LoadError, Route,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::control_plane::ControlPlane;
use crate::metrics::{MetricsSink, APPLY_TOTAL, CONFIG_SYNC_DURATION};
use crate::state::DesiredStateStore;
use crate::validator;

/// Why an apply did not run
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("an apply is already in progress")]
    InProgress,
}

/// One stage of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Users,
    Routes,
    Acl,
}

impl Step {
    /// Execution order
    pub const PIPELINE: [Step; 3] = [Step::Users, Step::Routes, Step::Acl];
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Users => write!(f, "users"),
            Step::Routes => write!(f, "routes"),
            Step::Acl => write!(f, "acl"),
        }
    }
}

/// What a single step did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub considered: usize,
    pub changes: Vec<String>,
    pub errors: Vec<String>,
}

/// Route ids to enable for one desired entry, plus prefixes the node
/// doesn't advertise
struct RoutePlan<'a> {
    enable: Vec<&'a LiveRoute>,
    missing: Vec<String>,
}

fn plan_route<'a>(entry: &Route, live: &'a [LiveRoute]) -> RoutePlan<'a> {
    let mut plan = RoutePlan {
        enable: Vec::new(),
        missing: Vec::new(),
    };
    for prefix in entry.prefixes() {
        match live
            .iter()
            .find(|r| r.node == entry.node && r.prefix == prefix && r.advertised)
        {
            Some(route) if route.enabled => {}
            Some(route) => plan.enable.push(route),
            None => plan.missing.push(prefix),
        }
    }
    plan
}

fn prefix_list<'a>(prefixes: impl IntoIterator<Item = &'a str>) -> String {
    format!("[{}]", prefixes.into_iter().collect::<Vec<_>>().join(", "))
}

/// Reconciler that pushes desired state onto the control plane
pub struct Reconciler {
    control_plane: Arc<dyn ControlPlane>,
    metrics: Arc<dyn MetricsSink>,
    /// Held for the whole of an apply; a second apply fails fast
    in_flight: Mutex<()>,
}

impl Reconciler {
    pub fn new(control_plane: Arc<dyn ControlPlane>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            control_plane,
            metrics,
            in_flight: Mutex::new(()),
        }
    }

    /// Whether an apply is currently running
    pub fn is_applying(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Apply an already-loaded snapshot
    pub async fn apply(
        &self,
        desired: &DesiredState,
        options: ApplyOptions,
    ) -> Result<ApplyResult, ApplyError> {
        let _guard = self.in_flight.try_lock().map_err(|_| ApplyError::InProgress)?;
        Ok(self.run(desired, options).await)
    }

    /// Load a fresh snapshot from `store` and apply it. Any load failure
    /// aborts before the control plane is touched.
    pub async fn apply_from(
        &self,
        store: &DesiredStateStore,
        options: ApplyOptions,
    ) -> Result<ApplyResult, ApplyError> {
        let _guard = self.in_flight.try_lock().map_err(|_| ApplyError::InProgress)?;
        let desired = store.load().await.map_err(|e| {
            error!("Apply aborted: {}", e);
            self.metrics.increment(APPLY_TOTAL, "status", "error");
            e
        })?;
        Ok(self.run(&desired, options).await)
    }

    async fn run(&self, desired: &DesiredState, options: ApplyOptions) -> ApplyResult {
        let started = Instant::now();
        info!(
            "Applying configuration (dry_run={}, validate={})",
            options.dry_run, options.validate
        );
        if options.force {
            debug!("force requested; no confirmation safeguards apply here");
        }

        if options.validate {
            let report = validator::validate(desired);
            if !report.valid {
                warn!("Validation failed: {}", report.message);
                self.metrics.increment(APPLY_TOTAL, "status", "error");
                return ApplyResult {
                    success: false,
                    message: "Validation failed".to_string(),
                    changes: Vec::new(),
                    errors: vec![report.message],
                    dry_run: options.dry_run,
                    stats: ApplyStats::default(),
                };
            }
        }

        let mut stats = ApplyStats::default();
        let mut changes = Vec::new();
        let mut errors = Vec::new();

        for step in Step::PIPELINE {
            let outcome = self.run_step(step, desired, options.dry_run).await;
            debug!(
                "Step {}: {} considered, {} changes, {} errors",
                step,
                outcome.considered,
                outcome.changes.len(),
                outcome.errors.len()
            );
            match step {
                Step::Users => stats.users_processed = outcome.considered,
                Step::Routes => stats.routes_processed = outcome.considered,
                Step::Acl => stats.acl_processed = outcome.considered,
            }
            changes.extend(outcome.changes);
            errors.extend(outcome.errors);
        }

        stats.changes_applied = changes.len();
        stats.errors_count = errors.len();
        let success = errors.is_empty();

        let message = if options.dry_run {
            format!("Would apply {} changes with {} errors", changes.len(), errors.len())
        } else {
            format!("Applied {} changes with {} errors", changes.len(), errors.len())
        };
        if success {
            info!("{}", message);
        } else {
            warn!("{}", message);
        }

        self.metrics.increment(
            APPLY_TOTAL,
            "status",
            if success { "success" } else { "error" },
        );
        self.metrics
            .observe(CONFIG_SYNC_DURATION, started.elapsed().as_secs_f64());

        ApplyResult {
            success,
            message,
            changes,
            errors,
            dry_run: options.dry_run,
            stats,
        }
    }

    async fn run_step(&self, step: Step, desired: &DesiredState, dry_run: bool) -> StepOutcome {
        match step {
            Step::Users => self.reconcile_users(desired, dry_run).await,
            Step::Routes => self.reconcile_routes(desired, dry_run).await,
            Step::Acl => self.reconcile_acl(desired, dry_run).await,
        }
    }

    /// Create users missing live. Existing users are left alone.
    async fn reconcile_users(&self, desired: &DesiredState, dry_run: bool) -> StepOutcome {
        let mut out = StepOutcome {
            considered: desired.users.len(),
            ..Default::default()
        };

        let live = match self.control_plane.list_users().await {
            Ok(live) => live,
            Err(e) => {
                out.errors.push(format!("Failed to list users: {e}"));
                return out;
            }
        };
        let mut present: HashSet<&str> = live.iter().map(|u| u.name.as_str()).collect();

        for user in &desired.users {
            if !present.insert(user.name.as_str()) {
                continue;
            }
            if dry_run {
                out.changes.push(format!("Would create user: {}", user.name));
                continue;
            }
            match self.control_plane.create_user(user).await {
                Ok(_) => {
                    info!("Created user: {}", user.name);
                    out.changes.push(format!("Created user: {}", user.name));
                }
                Err(e) => {
                    warn!("Failed to create user {}: {}", user.name, e);
                    out.errors
                        .push(format!("Failed to create user {}: {}", user.name, e));
                }
            }
        }
        out
    }

    /// Enable advertised-but-disabled prefixes for each route entry
    async fn reconcile_routes(&self, desired: &DesiredState, dry_run: bool) -> StepOutcome {
        let mut out = StepOutcome {
            considered: desired.routes.len(),
            ..Default::default()
        };
        if desired.routes.is_empty() {
            return out;
        }

        let live = match self.control_plane.list_routes().await {
            Ok(live) => live,
            Err(e) => {
                out.errors.push(format!("Failed to list routes: {e}"));
                return out;
            }
        };

        for entry in &desired.routes {
            let plan = plan_route(entry, &live);

            if !plan.missing.is_empty() {
                out.errors.push(format!(
                    "Node {} does not advertise routes: {}",
                    entry.node,
                    prefix_list(plan.missing.iter().map(String::as_str))
                ));
            }
            if plan.enable.is_empty() {
                continue;
            }

            if dry_run {
                out.changes.push(format!(
                    "Would enable routes for node {}: {}",
                    entry.node,
                    prefix_list(plan.enable.iter().map(|r| r.prefix.as_str()))
                ));
                continue;
            }

            // The entry is one unit: any failed enable makes it an error,
            // never a change.
            let mut enabled = Vec::with_capacity(plan.enable.len());
            let mut failed = Vec::new();
            for route in plan.enable {
                match self.control_plane.enable_route(&route.id).await {
                    Ok(()) => enabled.push(route.prefix.as_str()),
                    Err(e) => {
                        warn!(
                            "Failed to enable route {} for node {}: {}",
                            route.prefix, entry.node, e
                        );
                        failed.push(format!(
                            "Failed to enable route {} for node {}: {}",
                            route.prefix, entry.node, e
                        ));
                    }
                }
            }
            if !failed.is_empty() {
                if !enabled.is_empty() {
                    info!(
                        "Node {} partially enabled: {}",
                        entry.node,
                        prefix_list(enabled)
                    );
                }
                out.errors.extend(failed);
                continue;
            }
            let msg = format!(
                "Enabled routes for node {}: {}",
                entry.node,
                prefix_list(enabled)
            );
            info!("{}", msg);
            out.changes.push(msg);
        }
        out
    }

    /// Replace the live policy when it differs from the desired one
    async fn reconcile_acl(&self, desired: &DesiredState, dry_run: bool) -> StepOutcome {
        let mut out = StepOutcome {
            considered: 1,
            ..Default::default()
        };

        match self.control_plane.get_policy().await {
            Ok(live) if live.as_ref().unwrap_or(&AclPolicy::default()) == &desired.policy => {
                debug!("ACL policy unchanged");
                return out;
            }
            Ok(_) => {}
            Err(e @ ControlPlaneError::Decode { .. }) => {
                warn!("Live ACL policy cannot be compared, replacing it: {}", e);
            }
            Err(e) => {
                out.errors.push(format!("Failed to fetch ACL policy: {e}"));
                return out;
            }
        }

        if dry_run {
            out.changes.push("Would update ACL policy".to_string());
            return out;
        }
        match self.control_plane.set_policy(&desired.policy).await {
            Ok(()) => {
                info!("Updated ACL policy");
                out.changes.push("Updated ACL policy".to_string());
            }
            Err(e) => {
                warn!("Failed to update ACL policy: {}", e);
                out.errors.push(format!("Failed to update ACL policy: {e}"));
            }
        }
        out
    }
}
