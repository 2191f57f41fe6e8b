use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use shared_config::AppConfig;
use status_cell::{
    AggregationEngine, BroadcastChangePublisher, CarrierRegistry, ChannelEventSink, ChannelEventSource,
    EmailNotifier, EventConsumerService, EventSink, EventSource, FieldTemplateMatcher,
    InMemoryStatusStore, MonitorConfig, NotificationDispatcher, RedisChangePublisher, RedisEventQueue,
    SmtpMailTransport, StalenessMonitor, StatusMonitorService, StatusStateMachine, SystemClock,
    TemplateRepository, TriggerEngine,
};

const NOTIFICATION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Status Monitor API server");

    // Load configuration
    let config = AppConfig::from_env();
    let monitor_config = MonitorConfig::from_app_config(&config);

    // Notification fan-out
    let mut dispatcher = NotificationDispatcher::new(monitor_config.clone())
        .with_publisher(Arc::new(BroadcastChangePublisher::default()));

    if let Some(redis_url) = &config.redis_url {
        match RedisChangePublisher::new(redis_url, config.status_topic.clone()).await {
            Ok(publisher) => dispatcher = dispatcher.with_publisher(Arc::new(publisher)),
            Err(e) => warn!("Redis status topic unavailable, publishing in-process only: {}", e),
        }
    }

    if monitor_config.email_enabled {
        match SmtpMailTransport::from_config(&config) {
            Ok(transport) => {
                let notifier = EmailNotifier::new(
                    TemplateRepository::new(&config.template_folder),
                    Arc::new(transport),
                    config.mail_sender.clone(),
                );
                dispatcher = dispatcher.with_mailer(Arc::new(notifier));
            }
            Err(e) => warn!("Email notifications disabled: {}", e),
        }
    }
    let dispatcher = Arc::new(dispatcher);

    // Engine
    let store = Arc::new(InMemoryStatusStore::new());
    let registry = Arc::new(CarrierRegistry::new());
    let clock = Arc::new(SystemClock);

    let state_machine = Arc::new(
        StatusStateMachine::new(store.clone(), clock.clone(), &monitor_config)
            .with_dispatcher(Arc::clone(&dispatcher)),
    );
    let trigger = Arc::new(TriggerEngine::new(
        store.clone(),
        registry.clone(),
        Arc::new(FieldTemplateMatcher::new()),
        state_machine.clone(),
    ));
    let staleness = Arc::new(StalenessMonitor::new(
        store.clone(),
        state_machine.clone(),
        clock,
        monitor_config.clone(),
    ));

    // Inbound event feed
    let (source, sink): (Arc<dyn EventSource>, Arc<dyn EventSink>) = match &config.redis_url {
        Some(_) => {
            let queue = Arc::new(
                RedisEventQueue::new(&config)
                    .await
                    .context("Failed to connect to the Redis event queue")?,
            );
            (
                Arc::clone(&queue) as Arc<dyn EventSource>,
                queue as Arc<dyn EventSink>,
            )
        }
        None => {
            info!("REDIS_URL not set, using the in-process event feed");
            let (sender, source) = ChannelEventSource::channel(1024);
            (
                Arc::new(source) as Arc<dyn EventSource>,
                Arc::new(ChannelEventSink::new(sender)) as Arc<dyn EventSink>,
            )
        }
    };

    let aggregation = Arc::new(AggregationEngine::new(store.clone(), registry.clone()));
    let monitor = Arc::new(
        StatusMonitorService::new(store, registry, state_machine, aggregation).with_event_sink(sink),
    );

    let consumer = Arc::new(EventConsumerService::new(source, trigger, &monitor_config));

    // Background tasks
    let consumer_task = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move {
            if let Err(e) = consumer.start().await {
                error!("Event consumer failed: {}", e);
            }
        })
    };
    let staleness_task = {
        let staleness = Arc::clone(&staleness);
        tokio::spawn(async move {
            if let Err(e) = staleness.run().await {
                error!("Staleness monitor failed: {}", e);
            }
        })
    };

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = router::create_router(monitor)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // Stop background work and let in-flight transitions finish
    info!("Shutting down background tasks");
    consumer.shutdown();
    staleness.shutdown();
    let (consumer_result, staleness_result) = tokio::join!(consumer_task, staleness_task);
    for result in [consumer_result, staleness_result] {
        if let Err(e) = result {
            error!("Background task terminated abnormally: {}", e);
        }
    }

    if tokio::time::timeout(NOTIFICATION_DRAIN_TIMEOUT, dispatcher.drain())
        .await
        .is_err()
    {
        warn!("Gave up waiting for in-flight notifications after {:?}", NOTIFICATION_DRAIN_TIMEOUT);
    }

    info!("Status Monitor API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
