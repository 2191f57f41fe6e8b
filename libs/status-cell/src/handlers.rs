use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde_json::{json, Value};
use tracing::info;

use crate::carrier::{CarrierId, CarrierKind, CarrierRef};
use crate::models::{
    AggregateQuery, CarrierLinkRequest, CarrierRequest, ClearanceRequest, ClearanceResponse,
    EnableRequest, EventAccepted, HistoryPage, HistoryQuery, LoggedEvent, Status, StatusDefinition,
};
use crate::services::monitor::StatusMonitorService;
use crate::StatusError;

pub async fn list_statuses(
    State(monitor): State<Arc<StatusMonitorService>>,
) -> Result<Json<Vec<Status>>, StatusError> {
    Ok(Json(monitor.list().await?))
}

pub async fn register_status(
    State(monitor): State<Arc<StatusMonitorService>>,
    Json(definition): Json<StatusDefinition>,
) -> Result<(StatusCode, Json<Status>), StatusError> {
    info!("Registering status {}", definition.code);
    let status = monitor.register(definition).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

pub async fn get_status(
    State(monitor): State<Arc<StatusMonitorService>>,
    Path(code): Path<String>,
) -> Result<Json<Status>, StatusError> {
    Ok(Json(monitor.find_by_code(&code).await?))
}

pub async fn get_status_history(
    State(monitor): State<Arc<StatusMonitorService>>,
    Path(code): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, StatusError> {
    let page = monitor
        .history(&code, query.page_size, query.page_no, query.anchor)
        .await?;
    Ok(Json(page))
}

/// Manual clearance by an operator
pub async fn clear_status(
    State(monitor): State<Arc<StatusMonitorService>>,
    Path(code): Path<String>,
    Json(request): Json<ClearanceRequest>,
) -> Result<Json<ClearanceResponse>, StatusError> {
    let applied = monitor
        .clear_status_manually(&code, &request.clearer, &request.reason)
        .await?;
    Ok(Json(ClearanceResponse::from(&applied)))
}

pub async fn set_status_enabled(
    State(monitor): State<Arc<StatusMonitorService>>,
    Path(code): Path<String>,
    Json(request): Json<EnableRequest>,
) -> Result<Json<Status>, StatusError> {
    Ok(Json(monitor.set_enabled(&code, request.enabled).await?))
}

pub async fn delete_status(
    State(monitor): State<Arc<StatusMonitorService>>,
    Path(code): Path<String>,
) -> Result<StatusCode, StatusError> {
    monitor.delete(&code).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn submit_event(
    State(monitor): State<Arc<StatusMonitorService>>,
    Json(event): Json<LoggedEvent>,
) -> Result<(StatusCode, Json<EventAccepted>), StatusError> {
    let event = monitor.submit_event(event).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EventAccepted {
            event_id: event.id,
            code: event.code,
        }),
    ))
}

pub async fn register_carrier(
    State(monitor): State<Arc<StatusMonitorService>>,
    Json(request): Json<CarrierRequest>,
) -> Result<(StatusCode, Json<CarrierRef>), StatusError> {
    let carrier = monitor.register_carrier(request).await?;
    Ok((StatusCode::CREATED, Json(carrier)))
}

pub async fn get_carrier(
    State(monitor): State<Arc<StatusMonitorService>>,
    Path(carrier_id): Path<CarrierId>,
) -> Result<Json<CarrierRef>, StatusError> {
    Ok(Json(monitor.find_carrier(carrier_id).await?))
}

pub async fn link_sub_carrier(
    State(monitor): State<Arc<StatusMonitorService>>,
    Path(carrier_id): Path<CarrierId>,
    Json(request): Json<CarrierLinkRequest>,
) -> Result<StatusCode, StatusError> {
    monitor.link_sub_carrier(carrier_id, request.carrier_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn link_deployment(
    State(monitor): State<Arc<StatusMonitorService>>,
    Path(carrier_id): Path<CarrierId>,
    Json(request): Json<CarrierLinkRequest>,
) -> Result<StatusCode, StatusError> {
    monitor.link_deployment(carrier_id, request.carrier_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_carrier_statuses(
    State(monitor): State<Arc<StatusMonitorService>>,
    Path(carrier_id): Path<CarrierId>,
) -> Result<Json<Vec<Status>>, StatusError> {
    Ok(Json(monitor.status_for_carrier(carrier_id).await?))
}

pub async fn get_carrier_aggregate(
    State(monitor): State<Arc<StatusMonitorService>>,
    Path(carrier_id): Path<CarrierId>,
    Query(query): Query<AggregateQuery>,
) -> Result<Json<Value>, StatusError> {
    let with_deployments = query.with_deployments.unwrap_or(false);
    let histogram = monitor
        .aggregated_status_for_carrier(carrier_id, with_deployments)
        .await?;

    Ok(Json(json!({
        "carrier_id": carrier_id,
        "with_deployments": with_deployments,
        "total": histogram.total(),
        "histogram": histogram
    })))
}

pub async fn get_kind_aggregate(
    State(monitor): State<Arc<StatusMonitorService>>,
    Path(kind): Path<CarrierKind>,
    Query(query): Query<AggregateQuery>,
) -> Result<Json<Value>, StatusError> {
    let with_deployments = query.with_deployments.unwrap_or(false);
    let per_carrier = monitor.aggregate_for_kind(kind, with_deployments).await?;

    Ok(Json(json!({
        "kind": kind,
        "with_deployments": with_deployments,
        "carriers": per_carrier
    })))
}
