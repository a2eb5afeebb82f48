//! meshsync Engine
//!
//! Keeps declared users, subnet routes and ACL policy in sync with a
//! Headscale control plane:
//! - `state`: desired-state documents on disk
//! - `control_plane`: adapter trait, Headscale client, in-memory fake
//! - `reconciler`: ordered Users → Routes → ACL apply pipeline
//! - `drift`: read-only desired/live comparison
//! - `validator`: syntax and referential integrity checks
//! - `keys`: pre-auth key issuance
//! - `metrics`: counters and histograms behind an injected sink

pub mod control_plane;
pub mod drift;
pub mod keys;
pub mod metrics;
pub mod reconciler;
pub mod state;
pub mod validator;

pub use control_plane::{
    ControlPlane, ControlPlaneCall, HeadscaleClient, HeadscaleConfig, MemoryControlPlane,
};
pub use drift::{DriftDetector, DriftError};
pub use keys::{resolve_expiration, AuthKeyIssuer, DEFAULT_KEY_LIFETIME};
pub use metrics::{MetricsSink, PrometheusSink, RecordingSink};
pub use reconciler::{ApplyError, Reconciler, Step, StepOutcome};
pub use state::DesiredStateStore;
pub use validator::{validate, validate_policy};
