use chrono::Duration;

use status_cell::*;
use super::TestEngine;

#[tokio::test]
async fn test_db_down_then_manual_clearance() {
    let engine = TestEngine::new();
    let environment = engine.carrier(CarrierKind::Environment, "prod").await;
    let component = engine.carrier(CarrierKind::Component, "db").await;
    engine.registry.link_sub_carrier(environment, component).await.unwrap();
    let deployment = engine.deployment(component, "db", "eu-west").await;

    engine.status("S1", component, "DB_DOWN", "DB_UP").await;
    let mut changes = engine.publisher.subscribe();

    let before = engine
        .monitor
        .aggregated_status_for_carrier(environment, true)
        .await
        .unwrap();

    engine
        .trigger
        .process_event(&engine.event(deployment, "DB_DOWN", EventLevel::Error))
        .await
        .unwrap();

    assert_eq!(engine.current("S1").await.current.new_status, StatusState::Error);

    let after = engine
        .monitor
        .aggregated_status_for_carrier(environment, true)
        .await
        .unwrap();
    assert_eq!(after.error, before.error + 1);

    let cleared = engine
        .monitor
        .clear_status_manually("S1", "alice", "fixed")
        .await
        .unwrap();
    let response = ClearanceResponse::from(&cleared);

    assert_eq!(engine.current("S1").await.current.new_status, StatusState::Ok);
    assert_eq!(response.caused_by, "Manual Clearance");
    assert_eq!(response.previous_status, StatusState::Error);

    // Both transitions reach subscribers once pending deliveries are drained.
    engine.dispatcher.drain().await;
    assert_eq!(engine.dispatcher.pending_deliveries(), 0);
    let published: Vec<ChangeKind> = std::iter::from_fn(|| changes.try_recv().ok())
        .map(|message| message.change_kind)
        .collect();
    assert_eq!(published, vec![ChangeKind::EventTriggered, ChangeKind::ManualClearance]);
}

#[tokio::test]
async fn test_staleness_then_recovery() {
    let engine = TestEngine::new();
    let component = engine.carrier(CarrierKind::Component, "worker").await;

    let mut definition = StatusDefinition::new("S2", component);
    definition.ok_template = Some(EventTemplate::for_code("HEARTBEAT"));
    definition.error_template = Some(EventTemplate::for_code("CRASH"));
    definition.staleness_timeout_seconds = Some(5 * 60);
    engine.register(definition).await;

    engine.clock.advance(Duration::minutes(6));
    let report = engine.staleness.sweep().await.unwrap();
    assert_eq!(report.staled, vec!["S2".to_string()]);
    assert_eq!(engine.current("S2").await.current.new_status, StatusState::Stale);

    engine.clock.advance(Duration::seconds(1));
    engine
        .trigger
        .process_event(&engine.event(component, "HEARTBEAT", EventLevel::Info))
        .await
        .unwrap();
    assert_eq!(engine.current("S2").await.current.new_status, StatusState::Ok);

    let next = engine.staleness.sweep().await.unwrap();
    assert!(next.staled.is_empty());

    engine.clock.advance(Duration::minutes(4));
    assert!(engine.staleness.sweep().await.unwrap().staled.is_empty());
    assert!(engine.current("S2").await.is_ok());

    engine.clock.advance(Duration::minutes(2));
    assert_eq!(engine.staleness.sweep().await.unwrap().staled, vec!["S2".to_string()]);

    let kinds: Vec<ChangeKind> = engine
        .full_history("S2")
        .await
        .iter()
        .rev()
        .map(|change| change.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            ChangeKind::Initial,
            ChangeKind::Staleness,
            ChangeKind::EventTriggered,
            ChangeKind::Staleness
        ]
    );
}
