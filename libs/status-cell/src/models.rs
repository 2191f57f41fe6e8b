// =====================================================================================
// STATUS CELL MODELS
// =====================================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::carrier::{CarrierId, CarrierKind};
use crate::StatusError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusState {
    None,
    Ok,
    Error,
    Stale,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::None => "NONE",
            StatusState::Ok => "OK",
            StatusState::Error => "ERROR",
            StatusState::Stale => "STALE",
        }
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running occurrence counts carried from one change to the next.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounters {
    pub ok_counter: u64,
    pub error_counter: u64,
    pub stale_counter: u64,
}

impl StatusCounters {
    pub fn advanced(&self, state: StatusState) -> Self {
        let mut next = *self;
        match state {
            StatusState::Ok => next.ok_counter += 1,
            StatusState::Error => next.error_counter += 1,
            StatusState::Stale => next.stale_counter += 1,
            StatusState::None => {}
        }
        next
    }
}

// =====================================================================================
// EVENTS & TEMPLATES
// =====================================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventLevel::Trace => "TRACE",
            EventLevel::Debug => "DEBUG",
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
            EventLevel::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

/// One logged application event as delivered by the inbound feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggedEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub deployment: CarrierId,
    pub code: String,
    pub level: EventLevel,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl LoggedEvent {
    pub fn new(deployment: CarrierId, code: impl Into<String>, level: EventLevel) -> Self {
        Self {
            id: Uuid::new_v4(),
            deployment,
            code: code.into(),
            level,
            message: String::new(),
            occurred_at: Utc::now(),
            tags: BTreeSet::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }

    pub fn summary(&self) -> String {
        if self.message.is_empty() {
            format!("{} [{}]", self.code, self.level)
        } else {
            format!("{} [{}] {}", self.code, self.level, self.message)
        }
    }
}

/// Predicate over event fields. Every criterion that is set must hold; a template with
/// no criteria at all never matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventTemplate {
    pub code: Option<String>,
    pub min_level: Option<EventLevel>,
    pub max_level: Option<EventLevel>,
    /// Regular expression applied to the event message.
    pub message_pattern: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub deployment: Option<CarrierId>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl EventTemplate {
    pub fn for_code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_none()
            && self.min_level.is_none()
            && self.max_level.is_none()
            && self.message_pattern.is_none()
            && self.tags.is_empty()
            && self.deployment.is_none()
            && self.fields.is_empty()
    }
}

// =====================================================================================
// STATUS CHANGE LOG
// =====================================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Initial,
    EventTriggered,
    ManualClearance,
    Staleness,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeCause {
    Initial,
    EventTriggered { triggering_event: LoggedEvent },
    ManualClearance { clearer: String, reason: String },
    Staleness,
}

impl ChangeCause {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeCause::Initial => ChangeKind::Initial,
            ChangeCause::EventTriggered { .. } => ChangeKind::EventTriggered,
            ChangeCause::ManualClearance { .. } => ChangeKind::ManualClearance,
            ChangeCause::Staleness => ChangeKind::Staleness,
        }
    }

    /// The "caused by" text shown next to a change.
    pub fn describe(&self) -> String {
        match self {
            ChangeCause::Initial => "Initial".to_string(),
            ChangeCause::EventTriggered { triggering_event } => {
                if triggering_event.message.is_empty() {
                    format!("Event {}", triggering_event.code)
                } else {
                    format!("Event {}: {}", triggering_event.code, triggering_event.message)
                }
            }
            ChangeCause::ManualClearance { .. } => "Manual Clearance".to_string(),
            ChangeCause::Staleness => "Staleness".to_string(),
        }
    }
}

/// A transition that has not been appended yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDraft {
    pub new_status: StatusState,
    pub cause: ChangeCause,
}

impl ChangeDraft {
    pub fn event(triggering_event: LoggedEvent, new_status: StatusState) -> Self {
        Self {
            new_status,
            cause: ChangeCause::EventTriggered { triggering_event },
        }
    }

    pub fn manual_clearance(clearer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            new_status: StatusState::Ok,
            cause: ChangeCause::ManualClearance {
                clearer: clearer.into(),
                reason: reason.into(),
            },
        }
    }

    pub fn staleness() -> Self {
        Self {
            new_status: StatusState::Stale,
            cause: ChangeCause::Staleness,
        }
    }

    pub fn validate_against(&self, current: StatusState) -> Result<(), StatusError> {
        if matches!(self.cause, ChangeCause::ManualClearance { .. }) && current == StatusState::None {
            return Err(StatusError::InvalidTransition {
                from: current.to_string(),
                to: self.new_status.to_string(),
            });
        }
        Ok(())
    }
}

/// Node of a status history. Nodes are keyed by `(status code, sequence)`; `previous` and
/// `next` hold neighbouring sequence numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChange {
    pub sequence: u64,
    pub date_of_change: DateTime<Utc>,
    pub new_status: StatusState,
    #[serde(flatten)]
    pub counters: StatusCounters,
    pub previous: Option<u64>,
    pub next: Option<u64>,
    pub cause: ChangeCause,
}

impl StatusChange {
    pub fn initial(at: DateTime<Utc>) -> Self {
        Self {
            sequence: 0,
            date_of_change: at,
            new_status: StatusState::None,
            counters: StatusCounters::default(),
            previous: None,
            next: None,
            cause: ChangeCause::Initial,
        }
    }

    pub fn successor(&self, draft: ChangeDraft, at: DateTime<Utc>) -> Self {
        Self {
            sequence: self.sequence + 1,
            date_of_change: at,
            new_status: draft.new_status,
            counters: self.counters.advanced(draft.new_status),
            previous: Some(self.sequence),
            next: None,
            cause: draft.cause,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        self.cause.kind()
    }

    /// Latest evidence of life: the change itself, or the triggering event when that
    /// occurred later than the change was recorded.
    pub fn last_signal_at(&self) -> DateTime<Utc> {
        match &self.cause {
            ChangeCause::EventTriggered { triggering_event } => {
                self.date_of_change.max(triggering_event.occurred_at)
            }
            _ => self.date_of_change,
        }
    }
}

// =====================================================================================
// STATUS
// =====================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDefinition {
    pub code: String,
    pub long_name: String,
    pub description: Option<String>,
    pub contact: Option<String>,
    pub contact_email: Option<String>,
    pub context: CarrierId,
    pub ok_template: Option<EventTemplate>,
    pub error_template: Option<EventTemplate>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub staleness_timeout_seconds: Option<u64>,
    /// Template file name (without extension) overriding `<code>.tmpl`.
    pub email_template: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl StatusDefinition {
    pub fn new(code: impl Into<String>, context: CarrierId) -> Self {
        let code = code.into();
        Self {
            long_name: code.clone(),
            code,
            description: None,
            contact: None,
            contact_email: None,
            context,
            ok_template: None,
            error_template: None,
            enabled: true,
            staleness_timeout_seconds: None,
            email_template: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub id: Uuid,
    pub code: String,
    pub long_name: String,
    pub description: Option<String>,
    pub contact: Option<String>,
    pub contact_email: Option<String>,
    pub context: CarrierId,
    pub ok_template: Option<EventTemplate>,
    pub error_template: Option<EventTemplate>,
    pub enabled: bool,
    pub staleness_timeout_seconds: Option<u64>,
    pub email_template: Option<String>,
    pub current: StatusChange,
}

impl Status {
    pub fn from_definition(definition: StatusDefinition, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: definition.code,
            long_name: definition.long_name,
            description: definition.description,
            contact: definition.contact,
            contact_email: definition.contact_email,
            context: definition.context,
            ok_template: definition.ok_template,
            error_template: definition.error_template,
            enabled: definition.enabled,
            staleness_timeout_seconds: definition.staleness_timeout_seconds,
            email_template: definition.email_template,
            current: StatusChange::initial(created_at),
        }
    }

    pub fn state(&self) -> StatusState {
        self.current.new_status
    }

    pub fn is_ok(&self) -> bool {
        self.state() == StatusState::Ok
    }

    pub fn is_error(&self) -> bool {
        self.state() == StatusState::Error
    }

    pub fn is_stale(&self) -> bool {
        self.state() == StatusState::Stale
    }

    pub fn is_none(&self) -> bool {
        self.state() == StatusState::None
    }

    /// Effective timeout. A value too large to represent means the status never goes
    /// stale.
    pub fn staleness_timeout(&self, fallback_seconds: Option<u64>) -> Option<Duration> {
        self.staleness_timeout_seconds
            .or(fallback_seconds)
            .and_then(|seconds| i64::try_from(seconds).ok())
            .and_then(Duration::try_seconds)
    }
}

/// Result of a successful `apply`.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedChange {
    pub status: Status,
    pub previous_status: StatusState,
    pub change: StatusChange,
}

// =====================================================================================
// AGGREGATION
// =====================================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusHistogram {
    pub ok: u64,
    pub error: u64,
    pub stale: u64,
    pub none: u64,
}

impl StatusHistogram {
    pub fn record(&mut self, state: StatusState) {
        match state {
            StatusState::Ok => self.ok += 1,
            StatusState::Error => self.error += 1,
            StatusState::Stale => self.stale += 1,
            StatusState::None => self.none += 1,
        }
    }

    pub fn merge(&mut self, other: &StatusHistogram) {
        self.ok += other.ok;
        self.error += other.error;
        self.stale += other.stale;
        self.none += other.none;
    }

    pub fn total(&self) -> u64 {
        self.ok + self.error + self.stale + self.none
    }
}

// =====================================================================================
// NOTIFICATIONS
// =====================================================================================

/// Change signal published on the status topic. Subscribers re-query; the message is
/// not a record of the data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChangeMessage {
    pub status_code: String,
    pub old_status: StatusState,
    pub new_status: StatusState,
    pub change_kind: ChangeKind,
    pub sequence: u64,
    pub changed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<StatusCounters>,
}

impl StatusChangeMessage {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

// =====================================================================================
// CONFIGURATION
// =====================================================================================

/// Longest accepted per-status staleness timeout (ten years).
pub const MAX_STALENESS_TIMEOUT_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

const MAX_SWEEP_INTERVAL_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub staleness_sweep_interval_seconds: u64,
    pub default_staleness_timeout_seconds: Option<u64>,
    pub notification_ttl_seconds: u64,
    pub publish_counters_on_change: bool,
    pub email_enabled: bool,
    pub notify_states: Vec<StatusState>,
    pub notify_on_clearance: bool,
    pub event_workers: u32,
    pub max_append_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            staleness_sweep_interval_seconds: 60,
            default_staleness_timeout_seconds: None,
            notification_ttl_seconds: 300,
            publish_counters_on_change: false,
            email_enabled: false,
            notify_states: vec![StatusState::Error, StatusState::Stale],
            notify_on_clearance: true,
            event_workers: 4,
            max_append_attempts: 16,
        }
    }
}

impl MonitorConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            staleness_sweep_interval_seconds: config
                .staleness_sweep_interval_seconds
                .clamp(1, MAX_SWEEP_INTERVAL_SECONDS),
            default_staleness_timeout_seconds: config.default_staleness_timeout_seconds,
            notification_ttl_seconds: config.notification_ttl_seconds,
            publish_counters_on_change: config.publish_counters_on_change,
            email_enabled: config.email_enabled,
            event_workers: config.event_workers.max(1),
            ..Self::default()
        }
    }
}

// =====================================================================================
// REQUEST / RESPONSE MODELS
// =====================================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub page_size: Option<usize>,
    pub page_no: Option<usize>,
    pub anchor: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub status_code: String,
    /// Head sequence when paging started; pass it back for the following pages.
    pub anchor: u64,
    pub page_no: usize,
    pub page_size: usize,
    pub total_changes: u64,
    pub changes: Vec<StatusChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearanceRequest {
    pub clearer: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearanceResponse {
    pub status_code: String,
    pub previous_status: StatusState,
    pub new_status: StatusState,
    pub caused_by: String,
    pub sequence: u64,
    pub date_of_change: DateTime<Utc>,
}

impl From<&AppliedChange> for ClearanceResponse {
    fn from(applied: &AppliedChange) -> Self {
        Self {
            status_code: applied.status.code.clone(),
            previous_status: applied.previous_status,
            new_status: applied.change.new_status,
            caused_by: applied.change.cause.describe(),
            sequence: applied.change.sequence,
            date_of_change: applied.change.date_of_change,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub with_deployments: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnableRequest {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierRequest {
    pub kind: CarrierKind,
    pub code: String,
    /// Required for deployments.
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierLinkRequest {
    pub carrier_id: CarrierId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventAccepted {
    pub event_id: Uuid,
    pub code: String,
}
