use std::sync::Arc;

use rocket::fairing::{Fairing, Info, Kind};
use rocket::tokio;
use rocket::{Orbit, Rocket};

use crate::state::AppState;

/// Writes a final snapshot when the server shuts down, so reports received
/// since the last periodic save are not lost.
pub struct FlushOnShutdown;

#[rocket::async_trait]
impl Fairing for FlushOnShutdown {
    fn info(&self) -> Info {
        Info {
            name: "Telemetry Snapshot Flush",
            kind: Kind::Shutdown,
        }
    }

    async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
        let Some(state) = rocket.state::<AppState>() else {
            return;
        };
        let store = Arc::clone(&state.store);

        match tokio::task::spawn_blocking(move || store.flush()).await {
            Ok(Ok(())) => log::info!("Telemetry snapshot flushed on shutdown"),
            Ok(Err(e)) => log::error!("Failed to flush telemetry snapshot: {e:#}"),
            Err(e) => log::error!("Snapshot flush task failed: {e}"),
        }
    }
}
