//! meshsync Common Library
//!
//! Shared data model and error taxonomy for the meshsync workspace.

pub mod error;
pub mod types;

pub use error::{
    AuthError, ControlPlaneError, ControlPlaneResult, Document, LoadError, LoadErrorKind,
    StoreError, ValidationError,
};
pub use types::*;

/// meshsync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name reported by health and status endpoints
pub const SERVICE_NAME: &str = "meshsync";

/// Default data directory holding the desired-state documents
pub fn default_data_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/app/data")
}
