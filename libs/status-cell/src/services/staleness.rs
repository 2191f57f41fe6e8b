// =====================================================================================
// STALENESS MONITOR
// =====================================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::models::{ChangeDraft, MonitorConfig, Status};
use crate::services::state_machine::StatusStateMachine;
use crate::services::store::StatusStore;
use crate::StatusError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub staled: Vec<String>,
    pub abandoned: usize,
}

pub struct StalenessMonitor {
    store: Arc<dyn StatusStore>,
    state_machine: Arc<StatusStateMachine>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    shutdown: watch::Sender<bool>,
}

fn is_overdue(status: &Status, now: DateTime<Utc>, timeout: Duration) -> bool {
    now.signed_duration_since(status.current.last_signal_at()) > timeout
}

impl StalenessMonitor {
    pub fn new(
        store: Arc<dyn StatusStore>,
        state_machine: Arc<StatusStateMachine>,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            state_machine,
            clock,
            config,
            shutdown,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, StatusError> {
        self.sweep_at(self.clock.now()).await
    }

    /// Marks every enabled, timed status that has been silent for longer than its timeout
    /// as STALE. Already stale statuses are left alone. Each candidate is re-checked
    /// against its freshest head right before the append; if an event got in first the
    /// transition is dropped.
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StatusError> {
        let statuses = self.store.find_all().await?;
        let mut report = SweepReport::default();

        for status in statuses.iter().filter(|status| status.enabled) {
            let Some(timeout) = status.staleness_timeout(self.config.default_staleness_timeout_seconds) else {
                continue;
            };
            report.examined += 1;

            if status.is_stale() || !is_overdue(status, now, timeout) {
                continue;
            }

            let outcome = self
                .state_machine
                .apply_if(&status.code, ChangeDraft::staleness(), |fresh| {
                    fresh.enabled && !fresh.is_stale() && is_overdue(fresh, now, timeout)
                })
                .await;

            match outcome {
                Ok(Some(_)) => report.staled.push(status.code.clone()),
                Ok(None) | Err(StatusError::NotFound(_)) | Err(StatusError::Conflict(_)) => {
                    debug!(status_code = %status.code, "Staleness transition abandoned");
                    report.abandoned += 1;
                }
                Err(e) => {
                    warn!(status_code = %status.code, "Failed to mark status stale: {}", e);
                }
            }
        }

        Ok(report)
    }

    /// Sweeps on a fixed interval until `shutdown` is called. A sweep in progress always
    /// runs to completion.
    pub async fn run(&self) -> Result<(), StatusError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let period = std::time::Duration::from_secs(self.config.staleness_sweep_interval_seconds.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Staleness monitor started with {:?} interval", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => {}
            }

            if *shutdown_rx.borrow() {
                break;
            }

            match self.sweep().await {
                Ok(report) if !report.staled.is_empty() => {
                    info!(
                        examined = report.examined,
                        abandoned = report.abandoned,
                        "Marked {} statuses stale", report.staled.len()
                    );
                }
                Ok(report) => {
                    debug!(examined = report.examined, "Staleness sweep found nothing overdue");
                }
                Err(e) => {
                    error!("Staleness sweep failed: {}", e);
                }
            }
        }

        info!("Staleness monitor stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}
