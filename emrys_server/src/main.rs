use anyhow::Result;

use emrys_server::settings::ServerSettings;
use emrys_server::{build_rocket, logging};

#[rocket::main]
async fn main() -> Result<()> {
    let _logger = logging::init_logger()?;
    logging::log_clock();

    let settings = ServerSettings::load()?;
    log::info!(
        "Keeping {} records per machine, {} gpu usage events, snapshot every {}s",
        settings.max_records,
        settings.max_gpu_records,
        settings.write_interval
    );

    build_rocket(&settings)
        .launch()
        .await
        .map_err(|e| anyhow::anyhow!("Server stopped with error: {e}"))?;
    Ok(())
}
