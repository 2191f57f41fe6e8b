// =====================================================================================
// EMAIL NOTIFICATIONS
// =====================================================================================
//
// Templates are plain files in the configured folder: `<name>.tmpl`, falling back to
// `default.tmpl` and then to a built-in template. First line is `Subject: ...`, then a
// blank line, then the body. `{{placeholder}}` values are substituted; unknown
// placeholders are kept as written.
//
// Delivery goes through a `MailTransport`; `SmtpMailTransport` speaks SMTP or SMTPS.
//
// =====================================================================================

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use shared_config::AppConfig;

use crate::models::{AppliedChange, ChangeCause, Status};
use crate::StatusError;

const BUILTIN_SUBJECT: &str = "[{{new_status}}] {{long_name}} ({{status_code}})";
const BUILTIN_BODY: &str = "Status {{status_code}} ({{long_name}}) changed from {{old_status}} to {{new_status}} at {{changed_at}}.\n\nCaused by: {{cause}}\n{{event_summary}}{{reason}}\n\nContact: {{contact}}\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

impl EmailTemplate {
    pub fn parse(source: &str) -> Result<Self, StatusError> {
        let (first_line, rest) = source.split_once('\n').unwrap_or((source, ""));

        let subject = first_line
            .trim_end_matches('\r')
            .strip_prefix("Subject:")
            .ok_or_else(|| StatusError::TemplateError("template must start with a 'Subject:' line".to_string()))?
            .trim()
            .to_string();

        let body = rest
            .strip_prefix("\r\n")
            .or_else(|| rest.strip_prefix('\n'))
            .unwrap_or(rest)
            .to_string();

        Ok(Self { subject, body })
    }

    pub fn builtin() -> Self {
        Self {
            subject: BUILTIN_SUBJECT.to_string(),
            body: BUILTIN_BODY.to_string(),
        }
    }

    pub fn render(&self, variables: &BTreeMap<&str, String>) -> RenderedEmail {
        RenderedEmail {
            subject: substitute(&self.subject, variables),
            body: substitute(&self.body, variables),
        }
    }
}

fn substitute(text: &str, variables: &BTreeMap<&str, String>) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        match after_open.find("}}") {
            Some(end) => {
                let name = after_open[..end].trim();
                match variables.get(name) {
                    Some(value) => output.push_str(value),
                    None => output.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after_open[end + 2..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    output.push_str(rest);
    output
}

pub struct TemplateRepository {
    folder: PathBuf,
}

impl TemplateRepository {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self { folder: folder.into() }
    }

    pub async fn load(&self, status: &Status) -> Result<EmailTemplate, StatusError> {
        let preferred = status.email_template.as_deref().unwrap_or(&status.code);

        let mut candidates = Vec::with_capacity(2);
        if is_safe_name(preferred) {
            candidates.push(preferred);
        } else {
            warn!(status_code = %status.code, "Ignoring unsafe template name '{}'", preferred);
        }
        candidates.push("default");

        for name in candidates {
            let path = self.folder.join(format!("{}.tmpl", name));
            match tokio::fs::read_to_string(&path).await {
                Ok(source) => {
                    debug!("Using email template {}", path.display());
                    return EmailTemplate::parse(&source);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(EmailTemplate::builtin())
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.contains("..")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), StatusError>;
}

/// SMTP delivery. With `mail_use_tls` the connection is wrapped in TLS from the first
/// byte (SMTPS), otherwise it is plain SMTP.
pub struct SmtpMailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    pub fn from_config(config: &AppConfig) -> Result<Self, StatusError> {
        let builder = if config.mail_use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.mail_host)
                .map_err(|e| StatusError::NotificationError(format!("Invalid SMTP relay {}: {}", config.mail_host, e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.mail_host.clone())
        };

        let mut builder = builder
            .port(config.mail_port)
            .timeout(Some(Duration::from_secs(10)));
        if !config.mail_username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.mail_username.clone(),
                config.mail_password.clone(),
            ));
        }

        info!(
            "SMTP transport configured for {}:{} (tls: {})",
            config.mail_host, config.mail_port, config.mail_use_tls
        );
        Ok(Self {
            transport: builder.build(),
        })
    }
}

fn mailbox(address: &str) -> Result<Mailbox, StatusError> {
    address
        .parse()
        .map_err(|e| StatusError::NotificationError(format!("Invalid mail address '{}': {}", address, e)))
}

impl OutgoingMail {
    pub fn to_message(&self) -> Result<Message, StatusError> {
        Message::builder()
            .from(mailbox(&self.from)?)
            .to(mailbox(&self.to)?)
            .subject(self.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(self.body.clone())
            .map_err(|e| StatusError::NotificationError(format!("Failed to build mail: {}", e)))
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), StatusError> {
        let message = mail.to_message()?;
        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| StatusError::NotificationError(format!("SMTP delivery failed: {}", e)))?;

        debug!("SMTP server accepted message for {}: {:?}", mail.to, response.code());
        Ok(())
    }
}

pub struct EmailNotifier {
    templates: TemplateRepository,
    transport: Arc<dyn MailTransport>,
    sender: String,
}

impl EmailNotifier {
    pub fn new(templates: TemplateRepository, transport: Arc<dyn MailTransport>, sender: impl Into<String>) -> Self {
        Self {
            templates,
            transport,
            sender: sender.into(),
        }
    }

    pub fn variables(applied: &AppliedChange) -> BTreeMap<&'static str, String> {
        let status = &applied.status;
        let change = &applied.change;

        let (reason, event_summary) = match &change.cause {
            ChangeCause::ManualClearance { clearer, reason } => {
                (format!("Cleared by {}: {}", clearer, reason), String::new())
            }
            ChangeCause::EventTriggered { triggering_event } => {
                (String::new(), triggering_event.summary())
            }
            _ => (String::new(), String::new()),
        };

        BTreeMap::from([
            ("status_code", status.code.clone()),
            ("long_name", status.long_name.clone()),
            ("contact", status.contact.clone().unwrap_or_default()),
            ("old_status", applied.previous_status.to_string()),
            ("new_status", change.new_status.to_string()),
            ("cause", change.cause.describe()),
            ("reason", reason),
            ("event_summary", event_summary),
            ("changed_at", change.date_of_change.to_rfc3339()),
        ])
    }

    /// Renders and sends the notification. Returns `Ok(false)` when the status has no
    /// contact address.
    pub async fn notify(&self, applied: &AppliedChange) -> Result<bool, StatusError> {
        let Some(recipient) = applied.status.contact_email.as_deref().filter(|to| !to.is_empty()) else {
            debug!(status_code = %applied.status.code, "No contact email, skipping notification");
            return Ok(false);
        };

        let template = self.templates.load(&applied.status).await?;
        let rendered = template.render(&Self::variables(applied));

        let mail = OutgoingMail {
            from: self.sender.clone(),
            to: recipient.to_string(),
            subject: rendered.subject,
            body: rendered.body,
        };

        self.transport.send(&mail).await?;
        info!(status_code = %applied.status.code, "Sent status notification to {}", recipient);
        Ok(true)
    }
}
