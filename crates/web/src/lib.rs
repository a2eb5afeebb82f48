//! meshsync Web API
//!
//! HTTP surface over the sync engine, plus the `meshsyncd` configuration.

pub mod config;
pub mod server;

pub use config::{LogFormat, ServiceConfig};
pub use server::{router, serve, ApiError, AppState};
