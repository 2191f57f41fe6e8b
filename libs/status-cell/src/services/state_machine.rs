// =====================================================================================
// STATUS STATE MACHINE
// =====================================================================================

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::models::{AppliedChange, ChangeDraft, HistoryPage, MonitorConfig, Status};
use crate::services::notification::NotificationDispatcher;
use crate::services::store::{AppendOutcome, StatusStore};
use crate::StatusError;

enum AppendAttempt {
    Applied(AppliedChange),
    Abandoned,
}

/// Single entry point for every status mutation. Event triggers, staleness sweeps and
/// manual clearances all append through here, so the store's per-status serialization
/// and the notification path apply uniformly.
pub struct StatusStateMachine {
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    dispatcher: Option<Arc<NotificationDispatcher>>,
    max_append_attempts: u32,
}

impl StatusStateMachine {
    pub fn new(store: Arc<dyn StatusStore>, clock: Arc<dyn Clock>, config: &MonitorConfig) -> Self {
        Self {
            store,
            clock,
            dispatcher: None,
            max_append_attempts: config.max_append_attempts.max(1),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Appends `draft` as the new head of the status history, retrying when another
    /// writer got there first.
    #[instrument(skip(self, draft), fields(new_status = %draft.new_status))]
    pub async fn apply(&self, code: &str, draft: ChangeDraft) -> Result<AppliedChange, StatusError> {
        match self.append(code, draft, |_: &Status| true).await? {
            AppendAttempt::Applied(applied) => Ok(applied),
            AppendAttempt::Abandoned => Err(StatusError::Conflict(code.to_string())),
        }
    }

    /// Like `apply`, but `guard` is re-evaluated against the freshest head before every
    /// attempt. Returns `Ok(None)` when the guard no longer holds.
    pub async fn apply_if<G>(
        &self,
        code: &str,
        draft: ChangeDraft,
        guard: G,
    ) -> Result<Option<AppliedChange>, StatusError>
    where
        G: Fn(&Status) -> bool + Send + Sync,
    {
        match self.append(code, draft, guard).await? {
            AppendAttempt::Applied(applied) => Ok(Some(applied)),
            AppendAttempt::Abandoned => Ok(None),
        }
    }

    async fn append<G>(&self, code: &str, draft: ChangeDraft, guard: G) -> Result<AppendAttempt, StatusError>
    where
        G: Fn(&Status) -> bool + Send + Sync,
    {
        for attempt in 1..=self.max_append_attempts {
            let status = self
                .store
                .find_by_code(code)
                .await?
                .ok_or_else(|| StatusError::NotFound(code.to_string()))?;

            if !guard(&status) {
                debug!(status_code = %code, "Transition abandoned, precondition no longer holds");
                return Ok(AppendAttempt::Abandoned);
            }

            draft.validate_against(status.state())?;

            let previous_status = status.state();
            let change = status.current.successor(draft.clone(), self.clock.now());

            match self
                .store
                .append_if_head(code, status.current.sequence, change.clone())
                .await?
            {
                AppendOutcome::Appended(updated) => {
                    info!(
                        status_code = %code,
                        from = %previous_status,
                        to = %change.new_status,
                        sequence = change.sequence,
                        "Status changed: {}", change.cause.describe()
                    );

                    let applied = AppliedChange {
                        status: updated,
                        previous_status,
                        change,
                    };

                    if let Some(dispatcher) = &self.dispatcher {
                        dispatcher.dispatch(applied.clone());
                    }

                    return Ok(AppendAttempt::Applied(applied));
                }
                AppendOutcome::HeadMoved { current } => {
                    debug!(
                        status_code = %code,
                        attempt,
                        head = current.sequence,
                        "Head moved during append, retrying"
                    );
                }
            }
        }

        warn!(status_code = %code, "Giving up after {} append attempts", self.max_append_attempts);
        Err(StatusError::Conflict(format!(
            "status {} kept changing during {} attempts",
            code, self.max_append_attempts
        )))
    }

    /// Page `page_no` of the history, most recent first. Paging is anchored at the head
    /// observed by the first page so later appends never shift the pages.
    pub async fn history(
        &self,
        code: &str,
        page_size: usize,
        page_no: usize,
        anchor: Option<u64>,
    ) -> Result<HistoryPage, StatusError> {
        if page_size == 0 {
            return Err(StatusError::ValidationError("page_size must be positive".to_string()));
        }

        let status = self
            .store
            .find_by_code(code)
            .await?
            .ok_or_else(|| StatusError::NotFound(code.to_string()))?;

        let head = status.current.sequence;
        let anchor = anchor.unwrap_or(head);
        if anchor > head {
            return Err(StatusError::ValidationError(format!(
                "anchor {} is beyond the head {} of status {}",
                anchor, head, code
            )));
        }

        let skip = page_no
            .checked_mul(page_size)
            .map(|skip| skip as u64)
            .unwrap_or(u64::MAX);

        let changes = if skip > anchor {
            Vec::new()
        } else {
            self.store.walk_back(code, anchor - skip, page_size).await?
        };

        Ok(HistoryPage {
            status_code: status.code,
            anchor,
            page_no,
            page_size,
            total_changes: anchor + 1,
            changes,
        })
    }
}
