use std::sync::Arc;

use rocket::{Build, Rocket};

pub mod auth;
pub mod error;
pub mod logging;
pub mod mask;
pub mod models;
pub mod persistence;
pub mod retention;
pub mod routes;
pub mod settings;
pub mod state;
pub mod store;
pub mod tasks;

use auth::AccessGate;
use settings::ServerSettings;
use state::AppState;
use store::TelemetryStore;

/// Build the collector: open the store from disk and mount the API on it.
pub fn build_rocket(settings: &ServerSettings) -> Rocket<Build> {
    let state = AppState {
        store: Arc::new(TelemetryStore::open(settings)),
        gate: AccessGate::from_settings(settings),
    };

    rocket::build()
        .manage(state)
        .mount("/", routes::api_routes())
        .attach(tasks::flush::FlushOnShutdown)
}
