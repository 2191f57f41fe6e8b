use status_cell::*;
use super::TestEngine;

#[tokio::test]
async fn test_error_template_match_transitions_to_error() {
    let engine = TestEngine::new();
    let component = engine.carrier(CarrierKind::Component, "db").await;
    let deployment = engine.deployment(component, "db", "eu-west").await;
    engine.status("S1", component, "DB_DOWN", "DB_UP").await;

    let event = engine
        .event(deployment, "DB_DOWN", EventLevel::Error)
        .with_message("connection refused");
    let applied = engine.trigger.process_event(&event).await.unwrap();

    assert_eq!(applied.len(), 1);
    let status = engine.current("S1").await;
    assert!(status.is_error());
    assert_eq!(status.current.cause.describe(), "Event DB_DOWN: connection refused");
}

#[tokio::test]
async fn test_error_wins_when_both_templates_match() {
    let engine = TestEngine::new();
    let component = engine.carrier(CarrierKind::Component, "db").await;
    engine.status("S1", component, "DB_PING", "DB_PING").await;

    engine
        .trigger
        .process_event(&engine.event(component, "DB_PING", EventLevel::Info))
        .await
        .unwrap();

    assert!(engine.current("S1").await.is_error());
}

#[tokio::test]
async fn test_event_from_unrelated_carrier_is_ignored() {
    let engine = TestEngine::new();
    let component = engine.carrier(CarrierKind::Component, "db").await;
    let other = engine.carrier(CarrierKind::Component, "cache").await;
    engine.status("S1", component, "DB_DOWN", "DB_UP").await;

    let applied = engine
        .trigger
        .process_event(&engine.event(other, "DB_DOWN", EventLevel::Error))
        .await
        .unwrap();

    assert!(applied.is_empty());
    assert!(engine.current("S1").await.is_none());
}

#[tokio::test]
async fn test_event_reaches_status_through_hierarchy() {
    let engine = TestEngine::new();
    let environment = engine.carrier(CarrierKind::Environment, "prod").await;
    let component = engine.carrier(CarrierKind::Component, "api").await;
    engine.registry.link_sub_carrier(environment, component).await.unwrap();
    let deployment = engine.deployment(component, "api", "node-1").await;

    engine.status("ENV", environment, "API_DOWN", "API_UP").await;

    engine
        .trigger
        .process_event(&engine.event(deployment, "API_DOWN", EventLevel::Fatal))
        .await
        .unwrap();

    assert!(engine.current("ENV").await.is_error());
}

#[tokio::test]
async fn test_one_event_updates_every_matching_status_once() {
    let engine = TestEngine::new();
    let component = engine.carrier(CarrierKind::Component, "db").await;
    engine.status("S1", component, "DB_DOWN", "DB_UP").await;
    engine.status("S2", component, "DB_DOWN", "DB_UP").await;
    engine.status("S3", component, "DISK_FULL", "DISK_OK").await;

    let applied = engine
        .trigger
        .process_event(&engine.event(component, "DB_DOWN", EventLevel::Error))
        .await
        .unwrap();

    let mut codes: Vec<_> = applied.iter().map(|a| a.status.code.clone()).collect();
    codes.sort();
    assert_eq!(codes, vec!["S1", "S2"]);
    assert_eq!(engine.full_history("S1").await.len(), 2);
    assert!(engine.current("S3").await.is_none());
}

#[tokio::test]
async fn test_disabled_status_does_not_trigger() {
    let engine = TestEngine::new();
    let component = engine.carrier(CarrierKind::Component, "db").await;
    engine.status("S1", component, "DB_DOWN", "DB_UP").await;
    engine.monitor.set_enabled("S1", false).await.unwrap();

    let applied = engine
        .trigger
        .process_event(&engine.event(component, "DB_DOWN", EventLevel::Error))
        .await
        .unwrap();

    assert!(applied.is_empty());
}

#[tokio::test]
async fn test_malformed_template_does_not_block_other_statuses() {
    let engine = TestEngine::new();
    let component = engine.carrier(CarrierKind::Component, "db").await;

    let mut broken = StatusDefinition::new("BROKEN", component);
    broken.error_template = Some(EventTemplate {
        message_pattern: Some("([unclosed".to_string()),
        ..EventTemplate::for_code("DB_DOWN")
    });
    engine.register(broken).await;
    engine.status("S1", component, "DB_DOWN", "DB_UP").await;

    let applied = engine
        .trigger
        .process_event(&engine.event(component, "DB_DOWN", EventLevel::Error).with_message("down"))
        .await
        .unwrap();

    assert_eq!(applied.len(), 1);
    assert!(engine.current("S1").await.is_error());
    assert!(engine.current("BROKEN").await.is_none());
}

#[tokio::test]
async fn test_level_and_tag_criteria() {
    let engine = TestEngine::new();
    let component = engine.carrier(CarrierKind::Component, "db").await;

    let mut definition = StatusDefinition::new("S1", component);
    definition.error_template = Some(EventTemplate {
        min_level: Some(EventLevel::Error),
        tags: ["storage".to_string()].into_iter().collect(),
        ..EventTemplate::default()
    });
    engine.register(definition).await;

    let warning = engine
        .event(component, "IO", EventLevel::Warning)
        .with_tag("storage");
    assert!(engine.trigger.process_event(&warning).await.unwrap().is_empty());

    let untagged = engine.event(component, "IO", EventLevel::Error);
    assert!(engine.trigger.process_event(&untagged).await.unwrap().is_empty());

    let matching = engine
        .event(component, "IO", EventLevel::Fatal)
        .with_tag("storage")
        .with_tag("primary");
    assert_eq!(engine.trigger.process_event(&matching).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_status_without_templates_never_matches() {
    let engine = TestEngine::new();
    let component = engine.carrier(CarrierKind::Component, "db").await;

    let mut definition = StatusDefinition::new("S1", component);
    definition.ok_template = Some(EventTemplate::default());
    let status = engine.register(definition).await;

    let event = engine.event(component, "ANY", EventLevel::Info);
    assert_eq!(engine.trigger.evaluate(&status, &event), None);
}
