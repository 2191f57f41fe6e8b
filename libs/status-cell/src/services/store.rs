// =====================================================================================
// STATUS STORE
// =====================================================================================
//
// Append-only change log per status, keyed by (status code, sequence number), with the
// status row holding the head. Each status sits behind its own mutex, so appends to one
// status are serialized while different statuses proceed in parallel.
//
// =====================================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::carrier::CarrierId;
use crate::models::{Status, StatusChange};
use crate::StatusError;

#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Appended(Status),
    /// The head moved since the caller read it; nothing was written.
    HeadMoved { current: StatusChange },
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn insert(&self, status: Status) -> Result<Status, StatusError>;

    async fn find_by_code(&self, code: &str) -> Result<Option<Status>, StatusError>;

    async fn find_by_carriers(&self, carriers: &HashSet<CarrierId>) -> Result<Vec<Status>, StatusError>;

    async fn find_all(&self) -> Result<Vec<Status>, StatusError>;

    async fn set_enabled(&self, code: &str, enabled: bool) -> Result<Status, StatusError>;

    /// Appends `change` only if the head is still `expected_head`.
    async fn append_if_head(
        &self,
        code: &str,
        expected_head: u64,
        change: StatusChange,
    ) -> Result<AppendOutcome, StatusError>;

    /// Walks `previous` links starting at (and including) `from`, returning at most
    /// `limit` changes, most recent first.
    async fn walk_back(&self, code: &str, from: u64, limit: usize) -> Result<Vec<StatusChange>, StatusError>;

    /// Removes the status together with its whole history.
    async fn delete(&self, code: &str) -> Result<(), StatusError>;
}

struct StatusRecord {
    status: Status,
    log: Vec<StatusChange>,
}

pub struct InMemoryStatusStore {
    records: RwLock<HashMap<String, Arc<Mutex<StatusRecord>>>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    async fn record(&self, code: &str) -> Result<Arc<Mutex<StatusRecord>>, StatusError> {
        let records = self.records.read().await;
        records
            .get(code)
            .cloned()
            .ok_or_else(|| StatusError::NotFound(code.to_string()))
    }

    async fn snapshot_where<F>(&self, filter: F) -> Vec<Status>
    where
        F: Fn(&Status) -> bool,
    {
        let handles: Vec<Arc<Mutex<StatusRecord>>> = {
            let records = self.records.read().await;
            records.values().cloned().collect()
        };

        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            let record = handle.lock().await;
            if filter(&record.status) {
                statuses.push(record.status.clone());
            }
        }
        statuses.sort_by(|a, b| a.code.cmp(&b.code));
        statuses
    }
}

impl Default for InMemoryStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn insert(&self, status: Status) -> Result<Status, StatusError> {
        if status.current.sequence != 0 || status.current.previous.is_some() {
            return Err(StatusError::ValidationError(
                "a new status must start from its initial change".to_string(),
            ));
        }

        let mut records = self.records.write().await;
        if records.contains_key(&status.code) {
            return Err(StatusError::AlreadyExists(status.code));
        }

        let record = StatusRecord {
            log: vec![status.current.clone()],
            status: status.clone(),
        };
        records.insert(status.code.clone(), Arc::new(Mutex::new(record)));

        info!("Registered status {}", status.code);
        Ok(status)
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<Status>, StatusError> {
        let handle = {
            let records = self.records.read().await;
            records.get(code).cloned()
        };

        match handle {
            Some(handle) => Ok(Some(handle.lock().await.status.clone())),
            None => Ok(None),
        }
    }

    async fn find_by_carriers(&self, carriers: &HashSet<CarrierId>) -> Result<Vec<Status>, StatusError> {
        Ok(self.snapshot_where(|status| carriers.contains(&status.context)).await)
    }

    async fn find_all(&self) -> Result<Vec<Status>, StatusError> {
        Ok(self.snapshot_where(|_| true).await)
    }

    async fn set_enabled(&self, code: &str, enabled: bool) -> Result<Status, StatusError> {
        let handle = self.record(code).await?;
        let mut record = handle.lock().await;
        record.status.enabled = enabled;
        Ok(record.status.clone())
    }

    async fn append_if_head(
        &self,
        code: &str,
        expected_head: u64,
        change: StatusChange,
    ) -> Result<AppendOutcome, StatusError> {
        let handle = self.record(code).await?;
        let mut record = handle.lock().await;

        let head = record.status.current.sequence;
        if head != expected_head {
            debug!(status_code = %code, expected_head, head, "Append rejected, head moved");
            return Ok(AppendOutcome::HeadMoved {
                current: record.status.current.clone(),
            });
        }

        if change.sequence != head + 1 || change.previous != Some(head) {
            return Err(StatusError::ValidationError(format!(
                "change {} does not follow head {} of status {}",
                change.sequence, head, code
            )));
        }

        let head_index = head as usize;
        record.log[head_index].next = Some(change.sequence);
        record.log.push(change.clone());
        record.status.current = change;

        Ok(AppendOutcome::Appended(record.status.clone()))
    }

    async fn walk_back(&self, code: &str, from: u64, limit: usize) -> Result<Vec<StatusChange>, StatusError> {
        let handle = self.record(code).await?;
        let record = handle.lock().await;

        let mut changes = Vec::with_capacity(limit.min(record.log.len()));
        let mut cursor = record.log.get(from as usize).map(|change| change.sequence);

        while let Some(sequence) = cursor {
            if changes.len() >= limit {
                break;
            }
            let change = &record.log[sequence as usize];
            changes.push(change.clone());
            cursor = change.previous;
        }

        Ok(changes)
    }

    async fn delete(&self, code: &str) -> Result<(), StatusError> {
        let removed = {
            let mut records = self.records.write().await;
            records.remove(code)
        };

        match removed {
            Some(handle) => {
                // Wait out any in-flight append before dropping the log.
                let mut record = handle.lock().await;
                let dropped = record.log.len();
                record.log.clear();
                info!("Deleted status {} with {} changes", code, dropped);
                Ok(())
            }
            None => Err(StatusError::NotFound(code.to_string())),
        }
    }
}
