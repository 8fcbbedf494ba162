mod gpu;
mod logging;
mod report;
mod settings;
mod system_info;

use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tokio::time::{MissedTickBehavior, interval};

use settings::ClientSettings;
use system_info::Collector;

#[tokio::main]
async fn main() -> Result<()> {
    let _logger = logging::init_logging()?;
    let settings = ClientSettings::load()?;
    log::info!(
        "Reporting to {} every {}s",
        settings.server_url,
        settings.report_interval
    );

    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
    let mut collector = Collector::new(&settings);

    let mut ticker = interval(Duration::from_secs(settings.report_interval));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = collector.collect();
                match report::send_report(&client, &settings.server_url, &report).await {
                    Ok(()) => log::debug!("Status report sent"),
                    Err(e) => log::warn!("Status report failed, retrying next interval: {e:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Stopping reporter");
                break;
            }
        }
    }

    Ok(())
}
