use std::sync::Arc;

use rocket::serde::json::{Json, Value, json};
use rocket::{State, get, tokio};

use crate::auth::Role;
use crate::error::ApiError;
use crate::models::{GpuUsageEvent, TelemetryRecord};
use crate::state::AppState;
use crate::store::TelemetryStore;

#[get("/")]
pub fn hello() -> Json<Value> {
    Json(json!({ "msg": "Hello, this is Emrys." }))
}

/// Latest report of every machine, machine id descending.
#[get("/server_status?<view_key>")]
pub async fn view_status(
    state: &State<AppState>,
    view_key: Option<&str>,
) -> Result<Json<Vec<TelemetryRecord>>, ApiError> {
    state.gate.check(Role::View, view_key)?;
    read_store(state, |store| store.latest_per_machine()).await.map(Json)
}

/// The GPU usage log.
#[get("/gpu_usage?<view_key>")]
pub async fn gpu_usage(
    state: &State<AppState>,
    view_key: Option<&str>,
) -> Result<Json<Vec<GpuUsageEvent>>, ApiError> {
    state.gate.check(Role::View, view_key)?;
    read_store(state, |store| store.gpu_usage_log()).await.map(Json)
}

/// Retained history of one machine, oldest first.
#[get("/history/<machine_id>?<view_key>")]
pub async fn machine_history(
    state: &State<AppState>,
    machine_id: &str,
    view_key: Option<&str>,
) -> Result<Json<Vec<TelemetryRecord>>, ApiError> {
    state.gate.check(Role::View, view_key)?;

    let id = machine_id.to_string();
    read_store(state, move |store| store.history(&id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(machine_id.to_string()))
}

/// Run a read off the async executor; a save in progress holds the lock.
async fn read_store<T, F>(state: &AppState, read: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&TelemetryStore) -> T + Send + 'static,
{
    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || read(&store))
        .await
        .map_err(|_| ApiError::Internal)
}
