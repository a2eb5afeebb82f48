//! Service configuration
//!
//! Values come from an optional TOML file, then environment variables and
//! command-line flags on top (see `main.rs`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// meshsyncd configuration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Headscale base URL
    pub headscale_url: String,

    /// Headscale API key
    pub headscale_api_key: String,

    /// Bearer token clients must present; falls back to the Headscale key
    pub api_token: Option<String>,

    /// HTTP listen port
    pub port: u16,

    /// Directory holding users.yaml, routes.yaml and acls.yaml
    pub data_path: PathBuf,

    pub log_level: String,

    pub log_format: LogFormat,

    /// Per-request timeout for Headscale calls
    pub headscale_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            headscale_url: "http://localhost:8080".to_string(),
            headscale_api_key: String::new(),
            api_token: None,
            port: 8000,
            data_path: meshsync_common::default_data_path(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            headscale_timeout_secs: 30,
        }
    }
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |s: &str| if s.is_empty() { "<unset>" } else { "<redacted>" };
        f.debug_struct("ServiceConfig")
            .field("headscale_url", &self.headscale_url)
            .field("headscale_api_key", &redact(self.headscale_api_key.as_str()))
            .field("api_token", &self.api_token.as_deref().map(redact))
            .field("port", &self.port)
            .field("data_path", &self.data_path)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("headscale_timeout_secs", &self.headscale_timeout_secs)
            .finish()
    }
}

impl ServiceConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Token the API expects in `Authorization: Bearer`
    pub fn api_token(&self) -> &str {
        match self.api_token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => &self.headscale_api_key,
        }
    }

    pub fn headscale_timeout(&self) -> Duration {
        Duration::from_secs(self.headscale_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshsync.toml");
        std::fs::write(
            &path,
            "headscale_url = \"https://hs.example.com\"\nlog_format = \"json\"\n",
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.headscale_url, "https://hs.example.com");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.port, 8000);
        assert_eq!(config.headscale_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ServiceConfig::load(Path::new("/nonexistent/meshsync.toml")).is_err());
    }

    #[test]
    fn test_api_token_falls_back_to_headscale_key() {
        let mut config = ServiceConfig {
            headscale_api_key: "hs-key".into(),
            ..Default::default()
        };
        assert_eq!(config.api_token(), "hs-key");
        config.api_token = Some("client-token".into());
        assert_eq!(config.api_token(), "client-token");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = ServiceConfig {
            headscale_api_key: "hs-secret".into(),
            api_token: Some("client-secret".into()),
            ..Default::default()
        };
        let shown = format!("{config:?}");
        assert!(!shown.contains("hs-secret"));
        assert!(!shown.contains("client-secret"));
        assert!(shown.contains("<redacted>"));
    }
}
