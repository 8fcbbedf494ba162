use std::env;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{Local, Utc};
use flexi_logger::{Age, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};

pub const LOG_DIR_ENV: &str = "EMRYS_LOG_DIR";

/// Initialize logging for the Emrys server. `RUST_LOG` overrides the level.
///
/// One file per day, seven kept. File lines carry the thread name since
/// store writes run on Rocket's blocking pool.
pub fn init_logger() -> Result<LoggerHandle> {
    let log_dir = env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("logs"));

    let handle = Logger::try_with_env_or_str("info")?
        .log_to_file(FileSpec::default().directory(&log_dir).basename("emrys_server"))
        .format_for_files(flexi_logger::with_thread)
        .append()
        .rotate(
            Criterion::Age(Age::Day),
            Naming::Numbers,
            Cleanup::KeepLogFiles(7),
        )
        .duplicate_to_stderr(Duplicate::Info)
        .start()?;

    Ok(handle)
}

/// Log the clock the server runs on; report timestamps default to it.
pub fn log_clock() {
    log::info!("Environ 'TZ'    : {}", env::var("TZ").unwrap_or_else(|_| "N.A.".into()));
    log::info!("Current Time    : {}", Local::now());
    log::info!("Current UTC Time: {}", Utc::now());
}
