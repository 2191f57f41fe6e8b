use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use status_cell::{create_status_router, StatusMonitorService};

pub fn create_router(monitor: Arc<StatusMonitorService>) -> Router {
    Router::new()
        .route("/", get(|| async { "Status Monitor API is running!" }))
        .nest("/api", create_status_router(monitor))
}
