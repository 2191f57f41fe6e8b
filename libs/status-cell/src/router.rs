use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::handlers::{
    clear_status, delete_status, get_carrier, get_carrier_aggregate, get_carrier_statuses,
    get_kind_aggregate, get_status, get_status_history, link_deployment, link_sub_carrier,
    list_statuses, register_carrier, register_status, set_status_enabled, submit_event,
};
use crate::services::monitor::StatusMonitorService;

pub fn create_status_router(monitor: Arc<StatusMonitorService>) -> Router {
    let status_routes = Router::new()
        .route("/statuses", get(list_statuses).post(register_status))
        .route("/statuses/{code}", get(get_status).delete(delete_status))
        .route("/statuses/{code}/history", get(get_status_history))
        .route("/statuses/{code}/clear", post(clear_status))
        .route("/statuses/{code}/enabled", put(set_status_enabled));

    let carrier_routes = Router::new()
        .route("/carriers", post(register_carrier))
        .route("/carriers/{carrier_id}", get(get_carrier))
        .route("/carriers/{carrier_id}/sub_carriers", post(link_sub_carrier))
        .route("/carriers/{carrier_id}/deployments", post(link_deployment))
        .route("/carriers/{carrier_id}/statuses", get(get_carrier_statuses))
        .route("/carriers/{carrier_id}/aggregate", get(get_carrier_aggregate))
        .route("/carriers/kind/{kind}/aggregate", get(get_kind_aggregate));

    let event_routes = Router::new().route("/events", post(submit_event));

    Router::new()
        .merge(status_routes)
        .merge(carrier_routes)
        .merge(event_routes)
        .with_state(monitor)
}
