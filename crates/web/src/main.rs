//! meshsync daemon
//!
//! Serves the declarative sync API in front of a Headscale control plane.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshsync_engine::{
    ControlPlane, DesiredStateStore, HeadscaleClient, HeadscaleConfig, MemoryControlPlane,
    PrometheusSink,
};
use meshsync_web::config::{LogFormat, ServiceConfig};
use meshsync_web::server::{self, AppState};

#[derive(Parser)]
#[command(name = "meshsyncd")]
#[command(about = "meshsync daemon - declarative users, routes and ACLs for Headscale")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MESHSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Headscale base URL
    #[arg(long, env = "HEADSCALE_URL")]
    headscale_url: Option<String>,

    /// Headscale API key
    #[arg(long, env = "HEADSCALE_API_KEY", hide_env_values = true)]
    headscale_api_key: Option<String>,

    /// Bearer token required by the API (defaults to the Headscale key)
    #[arg(long, env = "MESHSYNC_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// HTTP listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Directory holding the desired-state documents
    #[arg(short, long, env = "DATA_PATH")]
    data_path: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    #[arg(long, env = "LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    /// Per-request timeout for Headscale calls, in seconds
    #[arg(long, env = "HEADSCALE_TIMEOUT_SECS")]
    headscale_timeout_secs: Option<u64>,

    /// Use an in-memory control plane instead of Headscale
    #[arg(long)]
    memory: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(ServiceConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::load(path)?,
            None => ServiceConfig::default(),
        };

        if let Some(v) = self.headscale_url {
            config.headscale_url = v;
        }
        if let Some(v) = self.headscale_api_key {
            config.headscale_api_key = v;
        }
        if let Some(v) = self.api_token {
            config.api_token = Some(v);
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.data_path {
            config.data_path = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
        if let Some(v) = self.log_format {
            config.log_format = v;
        }
        if let Some(v) = self.headscale_timeout_secs {
            config.headscale_timeout_secs = v;
        }

        Ok((config, self.memory))
    }
}

fn init_logging(config: &ServiceConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, memory) = Cli::parse().into_config()?;
    init_logging(&config);

    info!("meshsync daemon v{}", meshsync_common::VERSION);

    if config.headscale_api_key.is_empty() && !memory {
        anyhow::bail!("HEADSCALE_API_KEY is required (or pass --memory)");
    }

    let control_plane: Arc<dyn ControlPlane> = if memory {
        warn!("Using in-memory control plane; changes are not persisted to Headscale");
        Arc::new(MemoryControlPlane::new())
    } else {
        info!("Headscale: {}", config.headscale_url);
        Arc::new(HeadscaleClient::new(&HeadscaleConfig {
            url: config.headscale_url.clone(),
            api_key: config.headscale_api_key.clone(),
            timeout: config.headscale_timeout(),
        })?)
    };

    let api_token = match config.api_token() {
        token if !token.trim().is_empty() => token.to_string(),
        _ => {
            let token = hex::encode(rand::random::<[u8; 16]>());
            println!("meshsync API token (dev-random): {token}");
            token
        }
    };

    tokio::fs::create_dir_all(&config.data_path).await?;
    info!("Desired state: {}", config.data_path.display());

    let state = AppState::new(
        DesiredStateStore::new(config.data_path.clone()),
        control_plane,
        Arc::new(PrometheusSink::new()?),
        api_token,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    server::serve(addr, Arc::new(state)).await?;

    info!("Daemon shutdown complete");
    Ok(())
}
