use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};

/// Rotate after this many bytes.
const MAX_LOG_BYTES: u64 = 2_000_000;
const KEEP_LOG_FILES: usize = 3;

/// Reporter logging: size-bounded files under `EMRYS_LOG_DIR`, only
/// warnings and errors echoed to stderr.
pub fn init_logging() -> Result<LoggerHandle> {
    let log_dir = resolve_log_dir(env::var("EMRYS_LOG_DIR").ok());
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let handle = Logger::try_with_env_or_str("info")?
        .log_to_file(FileSpec::default().directory(&log_dir).basename("emrys_client"))
        .format_for_files(flexi_logger::detailed_format)
        .rotate(
            Criterion::Size(MAX_LOG_BYTES),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(KEEP_LOG_FILES),
        )
        .duplicate_to_stderr(Duplicate::Warn)
        .start()?;

    Ok(handle)
}

fn resolve_log_dir(configured: Option<String>) -> PathBuf {
    configured
        .filter(|dir| !dir.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("logs"))
}
