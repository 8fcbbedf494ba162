use std::sync::Arc;

use chrono::Utc;
use rocket::http::Status;
use rocket::serde::json::{Json, Value, json};
use rocket::{State, post, tokio};

use crate::auth::Role;
use crate::error::ApiError;
use crate::models::StatusReport;
use crate::state::AppState;

/// Receive a status report from a monitored machine.
///
/// The report key is checked before anything else; a rejected report never
/// reaches the store.
#[post("/report", format = "json", data = "<report>")]
pub async fn report_status(
    state: &State<AppState>,
    report: Json<StatusReport>,
) -> Result<(Status, Json<Value>), ApiError> {
    let report = report.into_inner();
    state.gate.check(Role::Report, report.report_key.as_deref())?;

    let record = report.validate(Utc::now()).map_err(|e| {
        log::info!("Rejected status report: {e}");
        ApiError::from(e)
    })?;
    let machine_id = record.machine_id.clone();

    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || store.add(record))
        .await
        .map_err(|_| ApiError::Internal)?;

    log::debug!("Received status report from {machine_id}");
    Ok((Status::Created, Json(json!({ "msg": "OK" }))))
}
