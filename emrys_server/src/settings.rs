use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

pub const CONFIG_PATH_ENV: &str = "EMRYS_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Upper bound on `history_days`.
pub const MAX_HISTORY_DAYS: i64 = 36_500;
/// Upper bound on `write_interval`, one year in seconds.
pub const MAX_WRITE_INTERVAL: i64 = 365 * 24 * 3600;

/// How entries leave the GPU usage log once they are old.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuLogAging {
    /// When the oldest history entry of the reporting machine is past the
    /// window, drop one entry from the front of the log.
    #[default]
    HistoryCoupled,
    /// Drop every event whose own timestamp is past the window.
    EventTimestamp,
}

/// Server settings, read from `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub report_key: String,
    pub view_key: String,
    pub history_days: i64,
    /// Seconds between persisted snapshots.
    pub write_interval: i64,
    pub max_records: usize,
    pub max_gpu_records: usize,
    pub status_file: PathBuf,
    pub gpu_log_file: PathBuf,
    pub gpu_log_aging: GpuLogAging,
}

impl ServerSettings {
    /// Load settings from the path in `EMRYS_CONFIG` (or `config.json`),
    /// then apply key overrides from the environment.
    pub fn load() -> Result<Self> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut settings = Self::from_file(Path::new(&path))?;

        if let Ok(key) = env::var("EMRYS_REPORT_KEY") {
            settings.report_key = key;
        }
        if let Ok(key) = env::var("EMRYS_VIEW_KEY") {
            settings.view_key = key;
        }

        settings.check()?;
        Ok(settings)
    }

    /// Read settings from a JSON file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed config file {}", path.display()))?;
        settings.check()?;
        Ok(settings)
    }

    pub fn check(&self) -> Result<()> {
        if self.max_records == 0 {
            bail!("max_records must be at least 1");
        }
        if self.max_gpu_records == 0 {
            bail!("max_gpu_records must be at least 1");
        }
        if !(0..=MAX_HISTORY_DAYS).contains(&self.history_days) {
            bail!("history_days must be between 0 and {MAX_HISTORY_DAYS}");
        }
        if !(0..=MAX_WRITE_INTERVAL).contains(&self.write_interval) {
            bail!("write_interval must be between 0 and {MAX_WRITE_INTERVAL} seconds");
        }
        Ok(())
    }

    /// Retention window for histories and the GPU log. Out-of-range values
    /// saturate so an unchecked config can't overflow later arithmetic.
    pub fn history_window(&self) -> TimeDelta {
        TimeDelta::try_days(self.history_days.max(0)).unwrap_or(TimeDelta::MAX)
    }

    /// Time between snapshots, saturating like `history_window`.
    pub fn write_interval(&self) -> TimeDelta {
        TimeDelta::try_seconds(self.write_interval.max(0)).unwrap_or(TimeDelta::MAX)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            report_key: String::new(),
            view_key: String::new(),
            history_days: 14,
            write_interval: 3600,
            max_records: 10,
            max_gpu_records: 100_000,
            status_file: PathBuf::from("machine_status.json"),
            gpu_log_file: PathBuf::from("gpu_status.csv"),
            gpu_log_aging: GpuLogAging::HistoryCoupled,
        }
    }
}
