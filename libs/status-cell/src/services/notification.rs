// =====================================================================================
// STATUS CHANGE NOTIFICATIONS
// =====================================================================================

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::models::{AppliedChange, ChangeKind, MonitorConfig, StatusChangeMessage};
use crate::services::email::EmailNotifier;
use crate::StatusError;

pub type StatusChangeReceiver = broadcast::Receiver<StatusChangeMessage>;

#[async_trait]
pub trait ChangePublisher: Send + Sync {
    async fn publish(&self, message: &StatusChangeMessage) -> Result<(), StatusError>;
}

/// In-process topic for subscribers living in the same binary (UI push, tests).
#[derive(Clone)]
pub struct BroadcastChangePublisher {
    sender: broadcast::Sender<StatusChangeMessage>,
}

impl BroadcastChangePublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> StatusChangeReceiver {
        self.sender.subscribe()
    }
}

impl Default for BroadcastChangePublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl ChangePublisher for BroadcastChangePublisher {
    async fn publish(&self, message: &StatusChangeMessage) -> Result<(), StatusError> {
        if let Err(e) = self.sender.send(message.clone()) {
            // Nobody listening right now.
            debug!("No subscribers for status change {}: {}", message.status_code, e);
        }
        Ok(())
    }
}

/// Publishes change messages as JSON on a Redis pub/sub channel.
pub struct RedisChangePublisher {
    pool: Pool,
    topic: String,
}

impl RedisChangePublisher {
    pub async fn new(redis_url: &str, topic: impl Into<String>) -> Result<Self, StatusError> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StatusError::NotificationError(format!("Failed to create Redis pool: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StatusError::NotificationError(format!("Failed to connect to Redis: {}", e)))?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        let topic = topic.into();
        info!("Redis status topic publisher ready on '{}'", topic);
        Ok(Self { pool, topic })
    }
}

#[async_trait]
impl ChangePublisher for RedisChangePublisher {
    async fn publish(&self, message: &StatusChangeMessage) -> Result<(), StatusError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StatusError::NotificationError(format!("Failed to get Redis connection: {}", e)))?;

        let receivers: i64 = conn.publish(&self.topic, payload).await?;
        debug!("Published change of {} to {} Redis subscribers", message.status_code, receivers);
        Ok(())
    }
}

fn log_join_failure(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!("Status notification task failed: {}", e);
    }
}

/// `changed_at + ttl`, saturating at the latest representable instant.
fn expiry(changed_at: DateTime<Utc>, ttl_seconds: u64) -> DateTime<Utc> {
    i64::try_from(ttl_seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|ttl| changed_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Fans every applied change out to the topic publishers and, for notify-worthy
/// transitions, to email. Delivery is best effort: failures are logged and never touch
/// the already committed change.
pub struct NotificationDispatcher {
    publishers: Vec<Arc<dyn ChangePublisher>>,
    mailer: Option<Arc<EmailNotifier>>,
    config: MonitorConfig,
    in_flight: Mutex<JoinSet<()>>,
}

impl NotificationDispatcher {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            publishers: Vec::new(),
            mailer: None,
            config,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn ChangePublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<EmailNotifier>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn message_for(&self, applied: &AppliedChange) -> StatusChangeMessage {
        let changed_at = applied.change.date_of_change;
        StatusChangeMessage {
            status_code: applied.status.code.clone(),
            old_status: applied.previous_status,
            new_status: applied.change.new_status,
            change_kind: applied.change.kind(),
            sequence: applied.change.sequence,
            changed_at,
            expires_at: expiry(changed_at, self.config.notification_ttl_seconds),
            counters: self
                .config
                .publish_counters_on_change
                .then_some(applied.change.counters),
        }
    }

    pub fn is_notify_worthy(&self, applied: &AppliedChange) -> bool {
        if applied.change.kind() == ChangeKind::ManualClearance {
            return self.config.notify_on_clearance;
        }
        self.config.notify_states.contains(&applied.change.new_status)
    }

    /// Delivers `applied` on a background task so slow transports never hold up the
    /// caller. The task is tracked until `drain` collects it.
    pub fn dispatch(self: &Arc<Self>, applied: AppliedChange) {
        let dispatcher = Arc::clone(self);
        let mut in_flight = self.lock_in_flight();

        // Reap deliveries that already finished.
        while let Some(result) = in_flight.try_join_next() {
            log_join_failure(result);
        }

        in_flight.spawn(async move {
            dispatcher.deliver(&applied).await;
        });
    }

    pub fn pending_deliveries(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// Waits for every delivery dispatched so far.
    pub async fn drain(&self) {
        let mut in_flight = std::mem::take(&mut *self.lock_in_flight());
        if in_flight.is_empty() {
            return;
        }

        info!("Waiting for {} in-flight status notifications", in_flight.len());
        while let Some(result) = in_flight.join_next().await {
            log_join_failure(result);
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(skip(self, applied), fields(status_code = %applied.status.code, sequence = applied.change.sequence))]
    pub async fn deliver(&self, applied: &AppliedChange) {
        let message = self.message_for(applied);

        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(&message).await {
                warn!("Failed to publish status change: {}", e);
            }
        }

        if !self.config.email_enabled || !self.is_notify_worthy(applied) {
            return;
        }

        if let Some(mailer) = &self.mailer {
            if let Err(e) = mailer.notify(applied).await {
                error!("Failed to send status notification email: {}", e);
            }
        }
    }
}
