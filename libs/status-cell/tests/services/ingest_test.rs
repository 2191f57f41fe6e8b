use std::sync::Arc;

use assert_matches::assert_matches;
use tokio::time::{sleep, timeout, Duration};

use status_cell::*;
use super::TestEngine;

#[tokio::test]
async fn test_channel_source_reports_idle_and_closed() {
    let (sender, source) = ChannelEventSource::channel(4);

    assert!(source.next_event().await.unwrap().is_none());

    drop(sender);
    assert_matches!(source.next_event().await, Err(StatusError::QueueError(_)));
}

#[tokio::test]
async fn test_consumer_applies_queued_events() {
    let engine = TestEngine::new();
    let carrier = engine.carrier(CarrierKind::Component, "db").await;
    engine.status("S1", carrier, "DB_DOWN", "DB_UP").await;
    engine.status("S2", carrier, "DISK_FULL", "DISK_OK").await;

    let (sender, source) = ChannelEventSource::channel(16);
    let consumer = Arc::new(EventConsumerService::new(
        Arc::new(source),
        Arc::clone(&engine.trigger),
        &MonitorConfig {
            event_workers: 2,
            ..MonitorConfig::default()
        },
    ));

    let running = Arc::clone(&consumer);
    let handle = tokio::spawn(async move { running.start().await });

    sender.send(engine.event(carrier, "DB_DOWN", EventLevel::Error)).await.unwrap();
    sender.send(engine.event(carrier, "DISK_FULL", EventLevel::Error)).await.unwrap();
    sender.send(engine.event(carrier, "NOISE", EventLevel::Debug)).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while consumer.processed_events() < 3 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("events were not consumed");

    consumer.shutdown();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("consumer did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(consumer.applied_transitions(), 2);
    assert!(engine.current("S1").await.is_error());
    assert!(engine.current("S2").await.is_error());
}

#[tokio::test]
async fn test_consumer_shutdown_without_traffic() {
    let engine = TestEngine::new();
    let (_sender, source) = ChannelEventSource::channel(1);
    let consumer = Arc::new(EventConsumerService::new(
        Arc::new(source),
        Arc::clone(&engine.trigger),
        &MonitorConfig::default(),
    ));

    let running = Arc::clone(&consumer);
    let handle = tokio::spawn(async move { running.start().await });
    sleep(Duration::from_millis(50)).await;

    consumer.shutdown();
    let result = timeout(Duration::from_secs(5), handle).await;

    assert!(result.is_ok());
    assert_eq!(consumer.processed_events(), 0);
}

#[test]
fn test_logged_event_wire_format() {
    let payload = r#"{
        "deployment": "6f1c7a52-3f0e-4d0b-9a8e-0a4c3e2b1d55",
        "code": "DB_DOWN",
        "level": "error",
        "message": "connection refused",
        "occurred_at": "2024-05-01T10:00:00Z",
        "tags": ["database"]
    }"#;

    let event: LoggedEvent = serde_json::from_str(payload).unwrap();

    assert_eq!(event.code, "DB_DOWN");
    assert_eq!(event.level, EventLevel::Error);
    assert!(event.tags.contains("database"));
    assert!(event.fields.is_empty());
}
