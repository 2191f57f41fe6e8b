pub mod store;
pub mod state_machine;
pub mod matching;
pub mod trigger;
pub mod staleness;
pub mod aggregation;
pub mod notification;
pub mod email;
pub mod ingest;
pub mod monitor;

pub use store::{AppendOutcome, InMemoryStatusStore, StatusStore};
pub use state_machine::StatusStateMachine;
pub use matching::{FieldTemplateMatcher, TemplateMatcher};
pub use trigger::TriggerEngine;
pub use staleness::{StalenessMonitor, SweepReport};
pub use aggregation::AggregationEngine;
pub use notification::{
    BroadcastChangePublisher, ChangePublisher, NotificationDispatcher, RedisChangePublisher,
    StatusChangeReceiver,
};
pub use email::{EmailNotifier, EmailTemplate, MailTransport, OutgoingMail, SmtpMailTransport, TemplateRepository};
pub use ingest::{
    ChannelEventSink, ChannelEventSource, EventConsumerService, EventSink, EventSource, RedisEventQueue,
};
pub use monitor::StatusMonitorService;
