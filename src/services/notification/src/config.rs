//! Configuration module for the notification engine
//!
//! This module provides configuration structures and defaults for the
//! delivery pipeline and every channel. Values are layered defaults, then
//! `NOTIFICATION__*` environment variables, then an optional file.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration structure for the notification engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    /// Pipeline-wide settings
    pub engine: EngineConfig,

    /// Log output
    pub logging: LoggingConfig,

    /// WebSocket/pub-sub channel
    pub websocket: WebSocketConfig,

    /// Email configuration
    pub email: EmailConfig,

    /// Chat webhook configuration
    pub chat: ChatConfig,

    /// SMS configuration
    pub sms: SmsConfig,

    /// Redis configuration for the shared store and pub/sub
    pub redis: RedisConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Template configuration
    pub template: TemplateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hourly cap applied when a user has no explicit preference
    pub default_frequency_limit: u32,
    pub history_capacity: usize,
    pub scheduler_interval_seconds: u64,
    /// Upper bound on a whole fan-out, on top of per-channel timeouts
    pub dispatch_timeout_seconds: Option<u64>,
    /// Zone used for quiet hours when a user has none
    pub default_timezone: String,
    pub default_max_retries: u32,
    pub bulk_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

/// WebSocket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    pub enabled: bool,
    pub user_topic_prefix: String,
    pub global_topic: Option<String>,
    pub publish_global: bool,
    pub buffer_size: usize,
    pub timeout_seconds: u64,
}

/// Email configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub enabled: bool,
    pub primary: SmtpConfig,
    pub fallback: Option<SmtpConfig>,
    pub from_email: String,
    pub from_name: String,
    pub reply_to: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub pool_size: u32,
}

/// Chat webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub enabled: bool,
    pub default_room: String,
    /// Room name to incoming-webhook URL
    pub rooms: HashMap<String, String>,
    /// Notification kind (`info`, `critical`, ...) to room name
    pub kind_rooms: HashMap<String, String>,
    /// Template name to room name
    pub template_rooms: HashMap<String, String>,
    pub timeout_seconds: u64,
    pub user_agent: String,
}

/// SMS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub enabled: bool,
    pub max_length: usize,
    pub per_user_per_minute: u32,
    pub twilio: Option<TwilioConfig>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_phone: String,
    pub base_url: String,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Unset keeps all state in process memory
    pub url: Option<String>,
    pub key_prefix: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub namespace: String,
}

/// Template configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub load_builtin: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_frequency_limit: 10,
            history_capacity: 1000,
            scheduler_interval_seconds: 30,
            dispatch_timeout_seconds: None,
            default_timezone: "UTC".to_string(),
            default_max_retries: 3,
            bulk_concurrency: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_topic_prefix: "notifications:user:".to_string(),
            global_topic: Some("notifications:global".to_string()),
            publish_global: false,
            buffer_size: 1024,
            timeout_seconds: 5,
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary: SmtpConfig::default(),
            fallback: None,
            from_email: "noreply@aicore.local".to_string(),
            from_name: "AI-CORE Platform".to_string(),
            reply_to: None,
            timeout_seconds: 30,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            username: String::new(),
            password: String::new(),
            use_tls: false,
            pool_size: 10,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_room: "general".to_string(),
            rooms: HashMap::new(),
            kind_rooms: HashMap::new(),
            template_rooms: HashMap::new(),
            timeout_seconds: 10,
            user_agent: "AI-CORE-Notification-Engine/1.0".to_string(),
        }
    }
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: false, // Disabled by default due to cost
            max_length: 160,
            per_user_per_minute: 5,
            twilio: None,
            timeout_seconds: 10,
        }
    }
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            from_phone: String::new(),
            base_url: "https://api.twilio.com".to_string(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: "notification:".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "notification_engine".to_string(),
        }
    }
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self { load_builtin: true }
    }
}

impl NotificationConfig {
    /// Load configuration from environment variables and config file
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mut cfg = config::Config::builder();

        // Start with default configuration
        cfg = cfg.add_source(config::Config::try_from(&NotificationConfig::default())?);

        // Add config file if it exists
        if let Ok(config_file) = std::env::var("NOTIFICATION_CONFIG_FILE") {
            cfg = cfg.add_source(config::File::with_name(&config_file).required(false));
        }

        // Environment wins over the file
        cfg = cfg.add_source(
            config::Environment::with_prefix("NOTIFICATION")
                .separator("__")
                .try_parsing(true),
        );

        cfg.build()?.try_deserialize()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.engine.default_frequency_limit == 0 {
            return Err("Default frequency limit must be greater than 0".to_string());
        }

        if self.engine.history_capacity == 0 {
            return Err("History capacity must be greater than 0".to_string());
        }

        if self.engine.scheduler_interval_seconds == 0 {
            return Err("Scheduler interval must be greater than 0".to_string());
        }

        if self.engine.bulk_concurrency == 0 {
            return Err("Bulk concurrency must be greater than 0".to_string());
        }

        if self.engine.default_timezone.parse::<Tz>().is_err() {
            return Err(format!(
                "Unknown default timezone: {}",
                self.engine.default_timezone
            ));
        }

        if self.email.enabled {
            if self.email.primary.host.is_empty() {
                return Err("SMTP host is required when email is enabled".to_string());
            }
            if self.email.from_email.is_empty() {
                return Err("From email is required when email is enabled".to_string());
            }
            if let Some(ref fallback) = self.email.fallback {
                if fallback.host.is_empty() {
                    return Err("Fallback SMTP host must not be empty".to_string());
                }
            }
        }

        if self.chat.enabled && !self.chat.rooms.contains_key(&self.chat.default_room) {
            return Err(format!(
                "Default chat room '{}' has no webhook URL",
                self.chat.default_room
            ));
        }

        if self.sms.enabled {
            if self.sms.max_length < 4 {
                return Err("SMS max length must be at least 4".to_string());
            }
            if self.sms.per_user_per_minute == 0 {
                return Err("SMS per-user limit must be greater than 0".to_string());
            }
            if let Some(ref twilio) = self.sms.twilio {
                if twilio.account_sid.is_empty() || twilio.auth_token.is_empty() {
                    return Err(
                        "Twilio credentials are required when a Twilio provider is configured"
                            .to_string(),
                    );
                }
            }
        }

        if self.websocket.enabled && self.websocket.buffer_size == 0 {
            return Err("WebSocket buffer size must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.engine.scheduler_interval_seconds)
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.engine.dispatch_timeout_seconds.map(Duration::from_secs)
    }

    /// Zone used for users without an explicit timezone
    pub fn default_timezone(&self) -> Tz {
        self.engine
            .default_timezone
            .parse()
            .unwrap_or(chrono_tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NotificationConfig::default();
        assert_eq!(config.engine.default_frequency_limit, 10);
        assert_eq!(config.engine.history_capacity, 1000);
        assert!(config.email.enabled);
        assert!(config.websocket.enabled);
        assert!(!config.sms.enabled);
        assert!(!config.chat.enabled);
        assert_eq!(config.sms.max_length, 160);
        assert_eq!(config.default_timezone(), chrono_tz::UTC);
    }

    #[test]
    fn test_config_validation() {
        let config = NotificationConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.engine.default_frequency_limit = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.engine.default_timezone = "Mars/Olympus".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.chat.enabled = true;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_chat_requires_default_room_url() {
        let mut config = NotificationConfig::default();
        config.chat.enabled = true;
        config
            .chat
            .rooms
            .insert("general".to_string(), "https://chat.example/hook".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_durations() {
        let mut config = NotificationConfig::default();
        assert_eq!(config.scheduler_interval(), Duration::from_secs(30));
        assert!(config.dispatch_timeout().is_none());

        config.engine.dispatch_timeout_seconds = Some(15);
        assert_eq!(config.dispatch_timeout(), Some(Duration::from_secs(15)));
    }
}
