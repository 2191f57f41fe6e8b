use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis_url: Option<String>,
    pub event_queue_key: String,
    pub status_topic: String,
    pub notification_ttl_seconds: u64,
    pub publish_counters_on_change: bool,
    pub staleness_sweep_interval_seconds: u64,
    pub default_staleness_timeout_seconds: Option<u64>,
    pub event_workers: u32,
    pub email_enabled: bool,
    pub mail_host: String,
    pub mail_port: u16,
    pub mail_use_tls: bool,
    pub mail_username: String,
    pub mail_password: String,
    pub mail_sender: String,
    pub template_folder: String,
    pub api_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mail_use_tls = parse_or("MAIL_USE_TLS", false);
        let config = Self {
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            event_queue_key: env::var("STATUS_EVENT_QUEUE_KEY")
                .unwrap_or_else(|_| {
                    warn!("STATUS_EVENT_QUEUE_KEY not set, using default");
                    "status_events:pending".to_string()
                }),
            status_topic: env::var("STATUS_TOPIC")
                .unwrap_or_else(|_| {
                    warn!("STATUS_TOPIC not set, using default");
                    "status_changes".to_string()
                }),
            notification_ttl_seconds: parse_or("STATUS_NOTIFICATION_TTL_SECONDS", 300),
            publish_counters_on_change: parse_or("STATUS_PUBLISH_COUNTERS", false),
            staleness_sweep_interval_seconds: parse_or("STATUS_STALENESS_INTERVAL_SECONDS", 60),
            default_staleness_timeout_seconds: env::var("STATUS_DEFAULT_STALENESS_SECONDS")
                .ok()
                .and_then(|value| value.parse().ok()),
            event_workers: parse_or("STATUS_EVENT_WORKERS", 4),
            email_enabled: parse_or("STATUS_EMAIL_ENABLED", false),
            mail_host: env::var("MAIL_HOST")
                .unwrap_or_else(|_| {
                    warn!("MAIL_HOST not set, using localhost");
                    "localhost".to_string()
                }),
            mail_port: parse_or("MAIL_PORT", Self::default_mail_port(mail_use_tls)),
            mail_use_tls,
            mail_username: env::var("MAIL_USERNAME").unwrap_or_default(),
            mail_password: env::var("MAIL_PASSWORD").unwrap_or_default(),
            mail_sender: env::var("MAIL_SENDER")
                .unwrap_or_else(|_| "status-monitor@localhost".to_string()),
            template_folder: env::var("STATUS_TEMPLATE_FOLDER")
                .unwrap_or_else(|_| "./templates".to_string()),
            api_port: parse_or("API_PORT", 3000),
        };

        if config.redis_url.is_none() {
            warn!("REDIS_URL not set, event feed and status topic stay in-process");
        }

        if config.email_enabled && !config.is_mail_configured() {
            warn!("Email notifications enabled but SMTP is not fully configured");
        }

        config
    }

    pub fn is_mail_configured(&self) -> bool {
        !self.mail_host.is_empty() && self.mail_port != 0 && !self.mail_sender.is_empty()
    }

    /// SMTP port: `MAIL_PORT` when set, otherwise 465 for SMTPS and 25 for plain SMTP.
    pub fn default_mail_port(use_tls: bool) -> u16 {
        if use_tls {
            465
        } else {
            25
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            event_queue_key: "status_events:pending".to_string(),
            status_topic: "status_changes".to_string(),
            notification_ttl_seconds: 300,
            publish_counters_on_change: false,
            staleness_sweep_interval_seconds: 60,
            default_staleness_timeout_seconds: None,
            event_workers: 4,
            email_enabled: false,
            mail_host: "localhost".to_string(),
            mail_port: 25,
            mail_use_tls: false,
            mail_username: String::new(),
            mail_password: String::new(),
            mail_sender: "status-monitor@localhost".to_string(),
            template_folder: "./templates".to_string(),
            api_port: 3000,
        }
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has an invalid value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
