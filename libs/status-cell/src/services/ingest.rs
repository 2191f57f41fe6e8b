// =====================================================================================
// INBOUND EVENT FEED
// =====================================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, instrument, warn};

use shared_config::AppConfig;

use crate::models::{LoggedEvent, MonitorConfig};
use crate::services::trigger::TriggerEngine;
use crate::StatusError;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Next event from the feed, or `None` when nothing arrived within the poll window.
    async fn next_event(&self) -> Result<Option<LoggedEvent>, StatusError>;
}

/// Producer side of the feed, used by the HTTP ingestion route.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, event: &LoggedEvent) -> Result<(), StatusError>;
}

/// Feeds a `ChannelEventSource` from inside the same process.
pub struct ChannelEventSink {
    sender: mpsc::Sender<LoggedEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: mpsc::Sender<LoggedEvent>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn submit(&self, event: &LoggedEvent) -> Result<(), StatusError> {
        self.sender
            .send(event.clone())
            .await
            .map_err(|_| StatusError::QueueError("event channel closed".to_string()))?;
        debug!("Event {} queued in process", event.id);
        Ok(())
    }
}

pub struct ChannelEventSource {
    receiver: Mutex<mpsc::Receiver<LoggedEvent>>,
    poll_timeout: Duration,
}

impl ChannelEventSource {
    pub fn channel(capacity: usize) -> (mpsc::Sender<LoggedEvent>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let source = Self {
            receiver: Mutex::new(receiver),
            poll_timeout: Duration::from_millis(200),
        };
        (sender, source)
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next_event(&self) -> Result<Option<LoggedEvent>, StatusError> {
        let mut receiver = self.receiver.lock().await;
        match timeout(self.poll_timeout, receiver.recv()).await {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => Err(StatusError::QueueError("event channel closed".to_string())),
            Err(_) => Ok(None),
        }
    }
}

/// Events as JSON on a Redis list: producers `LPUSH`, consumers `BRPOP`.
pub struct RedisEventQueue {
    pool: Pool,
    queue_key: String,
}

impl RedisEventQueue {
    pub async fn new(config: &AppConfig) -> Result<Self, StatusError> {
        let redis_url = config
            .redis_url
            .clone()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StatusError::QueueError(format!("Failed to create Redis pool: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StatusError::QueueError(format!("Failed to connect to Redis: {}", e)))?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!("Redis event queue initialized on '{}'", config.event_queue_key);
        Ok(Self {
            pool,
            queue_key: config.event_queue_key.clone(),
        })
    }

    async fn get_connection(&self) -> Result<Connection, StatusError> {
        self.pool
            .get()
            .await
            .map_err(|e| StatusError::QueueError(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl EventSink for RedisEventQueue {
    async fn submit(&self, event: &LoggedEvent) -> Result<(), StatusError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.get_connection().await?;
        let _: () = conn.lpush(&self.queue_key, payload).await?;
        debug!("Event {} enqueued", event.id);
        Ok(())
    }
}

#[async_trait]
impl EventSource for RedisEventQueue {
    async fn next_event(&self) -> Result<Option<LoggedEvent>, StatusError> {
        let mut conn = self.get_connection().await?;
        let popped: Option<(String, String)> = conn.brpop(&self.queue_key, 1.0).await?;

        let Some((_, payload)) = popped else {
            return Ok(None);
        };

        match serde_json::from_str::<LoggedEvent>(&payload) {
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                warn!("Dropping malformed event from '{}': {}", self.queue_key, e);
                Ok(None)
            }
        }
    }
}

/// Drains an `EventSource` with a fixed number of concurrent workers, each running the
/// trigger engine for one event at a time.
pub struct EventConsumerService {
    source: Arc<dyn EventSource>,
    trigger: Arc<TriggerEngine>,
    workers: u32,
    shutdown: watch::Sender<bool>,
    processed: AtomicU64,
    transitions: AtomicU64,
}

impl EventConsumerService {
    pub fn new(source: Arc<dyn EventSource>, trigger: Arc<TriggerEngine>, config: &MonitorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            source,
            trigger,
            workers: config.event_workers.max(1),
            shutdown,
            processed: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
        }
    }

    /// Runs until `shutdown` is called and every worker has finished the event it holds.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), StatusError> {
        info!("Starting event consumer with {} workers", self.workers);

        let handles: Vec<_> = (0..self.workers)
            .map(|i| {
                let consumer = Arc::clone(self);
                let worker_name = format!("event-worker-{}", i);
                tokio::spawn(async move { consumer.worker_loop(worker_name).await })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Event worker terminated abnormally: {}", e);
            }
        }

        info!(
            processed = self.processed_events(),
            transitions = self.applied_transitions(),
            "Event consumer stopped"
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        info!("Initiating event consumer shutdown");
        self.shutdown.send_replace(true);
    }

    pub fn processed_events(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn applied_transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    async fn worker_loop(&self, worker_name: String) {
        debug!("Worker loop started: {}", worker_name);
        let shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                debug!("Worker {} received shutdown signal", worker_name);
                break;
            }

            match self.source.next_event().await {
                Ok(Some(event)) => {
                    match self.trigger.process_event(&event).await {
                        Ok(applied) => {
                            self.transitions.fetch_add(applied.len() as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            error!("Worker {} failed to process event {}: {}", worker_name, event.id, e);
                        }
                    }
                    self.processed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Worker {} failed to read from event feed: {}", worker_name, e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }

        debug!("Worker loop ended: {}", worker_name);
    }
}
