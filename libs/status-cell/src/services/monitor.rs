// =====================================================================================
// STATUS MONITOR SERVICE
// =====================================================================================

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{info, instrument};

use crate::carrier::{CarrierDirectory, CarrierHierarchy, CarrierId, CarrierKind, CarrierRef};
use crate::clock::Clock;
use crate::models::{
    AppliedChange, CarrierRequest, ChangeDraft, HistoryPage, LoggedEvent, Status, StatusDefinition,
    StatusHistogram, MAX_STALENESS_TIMEOUT_SECONDS,
};
use crate::services::aggregation::AggregationEngine;
use crate::services::ingest::EventSink;
use crate::services::state_machine::StatusStateMachine;
use crate::services::store::StatusStore;
use crate::StatusError;

pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Query surface and operator actions over the status engine.
pub struct StatusMonitorService {
    store: Arc<dyn StatusStore>,
    carriers: Arc<dyn CarrierDirectory>,
    state_machine: Arc<StatusStateMachine>,
    aggregation: Arc<AggregationEngine>,
    clock: Arc<dyn Clock>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl StatusMonitorService {
    pub fn new(
        store: Arc<dyn StatusStore>,
        carriers: Arc<dyn CarrierDirectory>,
        state_machine: Arc<StatusStateMachine>,
        aggregation: Arc<AggregationEngine>,
    ) -> Self {
        let clock = state_machine.clock();
        Self {
            store,
            carriers,
            state_machine,
            aggregation,
            clock,
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub async fn register(&self, definition: StatusDefinition) -> Result<Status, StatusError> {
        if definition.code.trim().is_empty() {
            return Err(StatusError::ValidationError("status code must not be empty".to_string()));
        }
        if let Some(seconds) = definition.staleness_timeout_seconds {
            if seconds == 0 || seconds > MAX_STALENESS_TIMEOUT_SECONDS {
                return Err(StatusError::ValidationError(format!(
                    "staleness timeout must be between 1 and {} seconds",
                    MAX_STALENESS_TIMEOUT_SECONDS
                )));
            }
        }
        let status = Status::from_definition(definition, self.clock.now());
        self.store.insert(status).await
    }

    /// Hands an event to the inbound feed. Matching happens on the consumer side.
    pub async fn submit_event(&self, event: LoggedEvent) -> Result<LoggedEvent, StatusError> {
        if event.code.trim().is_empty() {
            return Err(StatusError::ValidationError("event code must not be empty".to_string()));
        }
        let sink = self
            .event_sink
            .as_ref()
            .ok_or_else(|| StatusError::QueueError("no event feed configured".to_string()))?;

        sink.submit(&event).await?;
        Ok(event)
    }

    pub async fn register_carrier(&self, request: CarrierRequest) -> Result<CarrierRef, StatusError> {
        let carrier = match request.location {
            Some(location) => CarrierRef {
                location: Some(location),
                ..CarrierRef::new(request.kind, request.code)
            },
            None => CarrierRef::new(request.kind, request.code),
        };
        self.carriers.add_carrier(carrier).await
    }

    pub async fn find_carrier(&self, id: CarrierId) -> Result<CarrierRef, StatusError> {
        self.carriers
            .carrier(id)
            .await
            .ok_or_else(|| StatusError::NotFound(format!("carrier {}", id)))
    }

    pub async fn link_sub_carrier(&self, parent: CarrierId, child: CarrierId) -> Result<(), StatusError> {
        self.carriers.add_sub_carrier(parent, child).await?;
        info!("Carrier {} linked under {}", child, parent);
        Ok(())
    }

    pub async fn link_deployment(&self, owner: CarrierId, deployment: CarrierId) -> Result<(), StatusError> {
        self.carriers.add_deployment(owner, deployment).await?;
        info!("Deployment {} associated with {}", deployment, owner);
        Ok(())
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Status, StatusError> {
        self.store
            .find_by_code(code)
            .await?
            .ok_or_else(|| StatusError::NotFound(code.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Status>, StatusError> {
        self.store.find_all().await
    }

    pub async fn history(
        &self,
        code: &str,
        page_size: Option<usize>,
        page_no: Option<usize>,
        anchor: Option<u64>,
    ) -> Result<HistoryPage, StatusError> {
        self.state_machine
            .history(
                code,
                page_size.unwrap_or(DEFAULT_PAGE_SIZE),
                page_no.unwrap_or(0),
                anchor,
            )
            .await
    }

    pub async fn status_for_carrier(&self, carrier: CarrierId) -> Result<Vec<Status>, StatusError> {
        self.store.find_by_carriers(&HashSet::from([carrier])).await
    }

    pub async fn aggregated_status_for_carrier(
        &self,
        carrier: CarrierId,
        with_deployments: bool,
    ) -> Result<StatusHistogram, StatusError> {
        if self.carriers.carrier(carrier).await.is_none() {
            return Err(StatusError::NotFound(format!("carrier {}", carrier)));
        }
        self.aggregation.aggregate(carrier, with_deployments).await
    }

    pub async fn aggregate_for_kind(
        &self,
        kind: CarrierKind,
        with_deployments: bool,
    ) -> Result<BTreeMap<String, StatusHistogram>, StatusError> {
        self.aggregation.aggregate_for_kind(kind, with_deployments).await
    }

    /// Operator acknowledgement that puts the status back to OK. Rejected while the
    /// status has never left NONE.
    #[instrument(skip(self, reason))]
    pub async fn clear_status_manually(
        &self,
        code: &str,
        clearer: &str,
        reason: &str,
    ) -> Result<AppliedChange, StatusError> {
        if clearer.trim().is_empty() {
            return Err(StatusError::ValidationError("clearer must not be empty".to_string()));
        }

        let applied = self
            .state_machine
            .apply(code, ChangeDraft::manual_clearance(clearer, reason))
            .await?;

        info!("Status {} manually cleared by {}", code, clearer);
        Ok(applied)
    }

    pub async fn set_enabled(&self, code: &str, enabled: bool) -> Result<Status, StatusError> {
        let status = self.store.set_enabled(code, enabled).await?;
        info!("Status {} {}", code, if enabled { "enabled" } else { "disabled" });
        Ok(status)
    }

    pub async fn delete(&self, code: &str) -> Result<(), StatusError> {
        self.store.delete(code).await
    }
}
