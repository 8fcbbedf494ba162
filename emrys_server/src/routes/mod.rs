use rocket::{Route, routes};

pub mod report;
pub mod status;

/// API routes
pub fn api_routes() -> Vec<Route> {
    routes![
        status::hello,
        // Ingestion
        report::report_status,
        // Retrieval
        status::view_status,
        status::gpu_usage,
        status::machine_history,
    ]
}
