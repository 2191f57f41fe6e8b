// =====================================================================================
// EVENT TRIGGER ENGINE
// =====================================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, instrument, warn};

use crate::carrier::{reachable_carriers, CarrierHierarchy, CarrierId};
use crate::models::{AppliedChange, ChangeDraft, EventTemplate, LoggedEvent, Status, StatusState};
use crate::services::matching::TemplateMatcher;
use crate::services::state_machine::StatusStateMachine;
use crate::services::store::StatusStore;
use crate::StatusError;

pub struct TriggerEngine {
    store: Arc<dyn StatusStore>,
    hierarchy: Arc<dyn CarrierHierarchy>,
    matcher: Arc<dyn TemplateMatcher>,
    state_machine: Arc<StatusStateMachine>,
}

impl TriggerEngine {
    pub fn new(
        store: Arc<dyn StatusStore>,
        hierarchy: Arc<dyn CarrierHierarchy>,
        matcher: Arc<dyn TemplateMatcher>,
        state_machine: Arc<StatusStateMachine>,
    ) -> Self {
        Self {
            store,
            hierarchy,
            matcher,
            state_machine,
        }
    }

    /// Target state for `status` given `event`: ERROR wins over OK, `None` when neither
    /// template matches. A broken template counts as no match.
    pub fn evaluate(&self, status: &Status, event: &LoggedEvent) -> Option<StatusState> {
        if self.template_matches(status, event, status.error_template.as_ref(), "error") {
            return Some(StatusState::Error);
        }
        if self.template_matches(status, event, status.ok_template.as_ref(), "ok") {
            return Some(StatusState::Ok);
        }
        None
    }

    fn template_matches(
        &self,
        status: &Status,
        event: &LoggedEvent,
        template: Option<&EventTemplate>,
        which: &str,
    ) -> bool {
        let Some(template) = template else {
            return false;
        };

        match self.matcher.matches(event, template) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(
                    status_code = %status.code,
                    template = which,
                    "Ignoring unusable template: {}", e
                );
                false
            }
        }
    }

    /// Applies at most one transition per enabled status whose carrier chain contains
    /// the event's deployment. Statuses are handled concurrently; a failure on one status
    /// is logged and does not affect the others.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_code = %event.code))]
    pub async fn process_event(&self, event: &LoggedEvent) -> Result<Vec<AppliedChange>, StatusError> {
        let statuses = self.store.find_all().await?;
        let mut reach: HashMap<CarrierId, HashSet<CarrierId>> = HashMap::new();
        let mut transitions = Vec::new();

        for status in statuses.iter().filter(|status| status.enabled) {
            if !self.is_relevant(status, event, &mut reach).await {
                continue;
            }
            if let Some(target) = self.evaluate(status, event) {
                transitions.push((status.code.clone(), ChangeDraft::event(event.clone(), target)));
            }
        }

        if transitions.is_empty() {
            debug!("Event matched no status");
            return Ok(Vec::new());
        }

        let results = join_all(
            transitions
                .iter()
                .map(|(code, draft)| self.state_machine.apply(code, draft.clone())),
        )
        .await;

        let mut applied = Vec::with_capacity(results.len());
        for ((code, _), result) in transitions.iter().zip(results) {
            match result {
                Ok(change) => applied.push(change),
                Err(StatusError::NotFound(_)) => {
                    debug!(status_code = %code, "Status removed before the event was applied");
                }
                Err(e) => {
                    error!(status_code = %code, "Failed to apply event transition: {}", e);
                }
            }
        }

        Ok(applied)
    }

    async fn is_relevant(
        &self,
        status: &Status,
        event: &LoggedEvent,
        reach: &mut HashMap<CarrierId, HashSet<CarrierId>>,
    ) -> bool {
        if status.context == event.deployment {
            return true;
        }

        if !reach.contains_key(&status.context) {
            let carriers = reachable_carriers(self.hierarchy.as_ref(), status.context, true).await;
            reach.insert(status.context, carriers);
        }

        reach
            .get(&status.context)
            .is_some_and(|carriers| carriers.contains(&event.deployment))
    }
}
