use std::sync::Arc;

use crate::auth::AccessGate;
use crate::store::TelemetryStore;

pub struct AppState {
    pub store: Arc<TelemetryStore>,
    pub gate: AccessGate,
}
