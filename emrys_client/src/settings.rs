use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

pub const CONFIG_PATH_ENV: &str = "EMRYS_CLIENT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "client_config.json";

/// Reporter settings, read from `client_config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    pub report_key: String,
    /// Seconds between reports.
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub external_disks: Vec<PathBuf>,
}

fn default_report_interval() -> u64 {
    300
}

impl ClientSettings {
    pub fn load() -> Result<Self> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(Path::new(&path))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read client config from {}", path.display()))?;
        let settings: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed client config {}", path.display()))?;

        if settings.server_url.trim().is_empty() {
            bail!("server_url must be set");
        }
        if settings.report_interval == 0 {
            bail!("report_interval must be at least 1 second");
        }
        Ok(settings)
    }
}
