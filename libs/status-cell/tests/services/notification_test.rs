use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::time::timeout;

use status_cell::*;
use super::TestEngine;

/// Records every mail instead of talking to an SMTP server.
#[derive(Default)]
struct CapturingTransport {
    sent: Mutex<Vec<OutgoingMail>>,
    fail: bool,
}

impl CapturingTransport {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for CapturingTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), StatusError> {
        self.sent.lock().unwrap().push(mail.clone());
        if self.fail {
            return Err(StatusError::NotificationError("connection refused".to_string()));
        }
        Ok(())
    }
}

/// Publisher that takes a while per message.
#[derive(Default)]
struct SlowPublisher {
    seen: Mutex<Vec<u64>>,
}

#[async_trait]
impl ChangePublisher for SlowPublisher {
    async fn publish(&self, message: &StatusChangeMessage) -> Result<(), StatusError> {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.seen.lock().unwrap().push(message.sequence);
        Ok(())
    }
}

async fn failing_status(engine: &TestEngine, code: &str, contact_email: Option<&str>) -> AppliedChange {
    let carrier = engine.carrier(CarrierKind::Component, "db").await;
    let mut definition = StatusDefinition::new(code, carrier);
    definition.long_name = "Primary database".to_string();
    definition.contact = Some("DB team".to_string());
    definition.contact_email = contact_email.map(str::to_string);
    definition.error_template = Some(EventTemplate::for_code("DB_DOWN"));
    engine.register(definition).await;

    let event = engine
        .event(carrier, "DB_DOWN", EventLevel::Error)
        .with_message("connection refused");
    engine
        .state_machine
        .apply(code, ChangeDraft::event(event, StatusState::Error))
        .await
        .unwrap()
}

fn email_config() -> MonitorConfig {
    MonitorConfig {
        email_enabled: true,
        ..MonitorConfig::default()
    }
}

fn notifier_for(transport: &Arc<CapturingTransport>, folder: &std::path::Path) -> Arc<EmailNotifier> {
    Arc::new(EmailNotifier::new(
        TemplateRepository::new(folder),
        transport.clone(),
        "monitor@example.com",
    ))
}

#[tokio::test]
async fn test_applied_change_is_broadcast() {
    let engine = TestEngine::new();
    let mut receiver = engine.publisher.subscribe();

    let applied = failing_status(&engine, "S1", None).await;

    let message = timeout(std::time::Duration::from_secs(2), receiver.recv())
        .await
        .expect("no status change published")
        .unwrap();

    assert_eq!(message.status_code, "S1");
    assert_eq!(message.old_status, StatusState::None);
    assert_eq!(message.new_status, StatusState::Error);
    assert_eq!(message.change_kind, ChangeKind::EventTriggered);
    assert_eq!(message.sequence, applied.change.sequence);
    assert_eq!(message.counters, None);
}

#[tokio::test]
async fn test_message_expiry_and_counters() {
    let engine = TestEngine::new();
    let applied = failing_status(&engine, "S1", None).await;

    let dispatcher = NotificationDispatcher::new(MonitorConfig {
        notification_ttl_seconds: 120,
        publish_counters_on_change: true,
        ..MonitorConfig::default()
    });
    let message = dispatcher.message_for(&applied);

    assert_eq!(message.expires_at, applied.change.date_of_change + Duration::seconds(120));
    assert_eq!(message.counters.map(|c| c.error_counter), Some(1));
    assert!(!message.is_expired(applied.change.date_of_change + Duration::seconds(60)));
    assert!(message.is_expired(applied.change.date_of_change + Duration::seconds(121)));
}

#[tokio::test]
async fn test_huge_ttl_saturates_instead_of_overflowing() {
    let engine = TestEngine::new();
    let applied = failing_status(&engine, "S1", None).await;

    for ttl in [u64::MAX, i64::MAX as u64, 400_000 * 365 * 24 * 60 * 60] {
        let dispatcher = NotificationDispatcher::new(MonitorConfig {
            notification_ttl_seconds: ttl,
            ..MonitorConfig::default()
        });
        let message = dispatcher.message_for(&applied);

        assert_eq!(message.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!message.is_expired(Utc::now()));
    }
}

#[tokio::test]
async fn test_notify_worthy_transitions() {
    let engine = TestEngine::new();
    let carrier = engine.carrier(CarrierKind::Component, "db").await;
    engine.status("S1", carrier, "DOWN", "UP").await;
    let dispatcher = NotificationDispatcher::new(MonitorConfig::default());

    let to_ok = engine
        .state_machine
        .apply("S1", ChangeDraft::event(engine.event(carrier, "UP", EventLevel::Info), StatusState::Ok))
        .await
        .unwrap();
    assert!(!dispatcher.is_notify_worthy(&to_ok));

    let to_stale = engine.state_machine.apply("S1", ChangeDraft::staleness()).await.unwrap();
    assert!(dispatcher.is_notify_worthy(&to_stale));

    let cleared = engine
        .state_machine
        .apply("S1", ChangeDraft::manual_clearance("alice", "fixed"))
        .await
        .unwrap();
    assert!(dispatcher.is_notify_worthy(&cleared));
}

#[tokio::test]
async fn test_drain_waits_for_dispatched_deliveries() {
    let engine = TestEngine::new();
    let applied = failing_status(&engine, "S1", None).await;

    let publisher = Arc::new(SlowPublisher::default());
    let dispatcher = Arc::new(
        NotificationDispatcher::new(MonitorConfig::default()).with_publisher(publisher.clone()),
    );

    for _ in 0..3 {
        dispatcher.dispatch(applied.clone());
    }
    assert_eq!(dispatcher.pending_deliveries(), 3);

    dispatcher.drain().await;

    assert_eq!(publisher.seen.lock().unwrap().len(), 3);
    assert_eq!(dispatcher.pending_deliveries(), 0);
}

#[tokio::test]
async fn test_error_transition_sends_templated_email() {
    let engine = TestEngine::new();
    let applied = failing_status(&engine, "S1", Some("ops@example.com")).await;

    let folder = tempfile::tempdir().unwrap();
    std::fs::write(
        folder.path().join("S1.tmpl"),
        "Subject: {{status_code}} is {{new_status}}\n\n{{long_name}} went from {{old_status}} to {{new_status}}.\nCause: {{cause}}\n",
    )
    .unwrap();

    let transport = Arc::new(CapturingTransport::default());
    let dispatcher = NotificationDispatcher::new(email_config()).with_mailer(notifier_for(&transport, folder.path()));
    dispatcher.deliver(&applied).await;

    assert_eq!(
        transport.sent(),
        vec![OutgoingMail {
            from: "monitor@example.com".to_string(),
            to: "ops@example.com".to_string(),
            subject: "S1 is ERROR".to_string(),
            body: "Primary database went from NONE to ERROR.\nCause: Event DB_DOWN: connection refused\n"
                .to_string(),
        }]
    );
}

#[tokio::test]
async fn test_default_template_is_used_when_status_has_none() {
    let engine = TestEngine::new();
    let applied = failing_status(&engine, "S1", Some("ops@example.com")).await;

    let folder = tempfile::tempdir().unwrap();
    std::fs::write(folder.path().join("default.tmpl"), "Subject: ALERT {{status_code}}\n\n{{unknown}}").unwrap();

    let transport = Arc::new(CapturingTransport::default());
    let notifier = notifier_for(&transport, folder.path());
    assert!(notifier.notify(&applied).await.unwrap());

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "ALERT S1");
    assert_eq!(sent[0].body, "{{unknown}}");
}

#[tokio::test]
async fn test_builtin_template_without_folder() {
    let engine = TestEngine::new();
    let applied = failing_status(&engine, "S1", Some("ops@example.com")).await;
    let folder = tempfile::tempdir().unwrap();

    let transport = Arc::new(CapturingTransport::default());
    let notifier = notifier_for(&transport, &folder.path().join("missing"));
    assert!(notifier.notify(&applied).await.unwrap());

    let sent = transport.sent();
    assert_eq!(sent[0].subject, "[ERROR] Primary database (S1)");
    assert!(sent[0].body.contains("Contact: DB team"));
    assert!(sent[0].to_message().is_ok());
}

#[tokio::test]
async fn test_status_without_contact_is_not_emailed() {
    let engine = TestEngine::new();
    let applied = failing_status(&engine, "S1", None).await;
    let folder = tempfile::tempdir().unwrap();

    let transport = Arc::new(CapturingTransport::default());
    let notifier = notifier_for(&transport, folder.path());

    assert!(!notifier.notify(&applied).await.unwrap());
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_transport_failure_leaves_change_committed() {
    let engine = TestEngine::new();
    let applied = failing_status(&engine, "S1", Some("ops@example.com")).await;
    let folder = tempfile::tempdir().unwrap();

    let transport = Arc::new(CapturingTransport::failing());
    let notifier = notifier_for(&transport, folder.path());
    let direct = notifier.notify(&applied).await;
    assert!(matches!(direct, Err(StatusError::NotificationError(_))));

    // Through the dispatcher the failure is only logged.
    let dispatcher = NotificationDispatcher::new(email_config()).with_mailer(notifier);
    dispatcher.deliver(&applied).await;

    assert_eq!(transport.sent().len(), 2);
    assert!(engine.current("S1").await.is_error());
    assert_eq!(engine.full_history("S1").await.len(), 2);
}

#[tokio::test]
async fn test_ok_transition_is_not_emailed() {
    let engine = TestEngine::new();
    let carrier = engine.carrier(CarrierKind::Component, "db").await;
    let mut definition = StatusDefinition::new("S1", carrier);
    definition.contact_email = Some("ops@example.com".to_string());
    engine.register(definition).await;

    let applied = engine
        .state_machine
        .apply("S1", ChangeDraft::event(engine.event(carrier, "UP", EventLevel::Info), StatusState::Ok))
        .await
        .unwrap();

    let transport = Arc::new(CapturingTransport::default());
    let folder = tempfile::tempdir().unwrap();
    let dispatcher = NotificationDispatcher::new(email_config()).with_mailer(notifier_for(&transport, folder.path()));
    dispatcher.deliver(&applied).await;

    assert!(transport.sent().is_empty());
}
