use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// Enumerations
// =============================================================================

/// Delivery transports known to the engine.
///
/// The set is closed: every provider registered with the engine is keyed by
/// one of these tags, so fan-out over the set is exhaustive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[serde(rename = "websocket")]
    WebSocket,
    Email,
    Chat,
    Sms,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::WebSocket,
        ChannelKind::Email,
        ChannelKind::Chat,
        ChannelKind::Sms,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Email => "email",
            Self::Chat => "chat",
            Self::Sms => "sms",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown channel: {0}")]
pub struct ParseChannelError(pub String);

impl FromStr for ChannelKind {
    type Err = ParseChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "email" | "smtp" => Ok(Self::Email),
            "chat" | "slack" => Ok(Self::Chat),
            "sms" => Ok(Self::Sms),
            other => Err(ParseChannelError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
    Critical,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 5] = [
        NotificationKind::Info,
        NotificationKind::Success,
        NotificationKind::Warning,
        NotificationKind::Error,
        NotificationKind::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    #[default]
    Pending,
    Scheduled,
    Sent,
    Failed,
    Cancelled,
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// =============================================================================
// Notification
// =============================================================================

/// A logical notification addressed to one user.
///
/// Created by a caller or rendered from a template, then mutated only by the
/// engine while it is being sent (status, `scheduled_at`, `sent_at`,
/// `retry_count`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub kind: NotificationKind,
    #[serde(default)]
    pub priority: NotificationPriority,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub channels: BTreeSet<ChannelKind>,
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: NotificationStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_max_retries() -> u32 {
    Notification::DEFAULT_MAX_RETRIES
}

impl Notification {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Create a pending notification with no channels selected yet.
    pub fn new(
        user_id: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            kind: NotificationKind::default(),
            priority: NotificationPriority::default(),
            subject: subject.into(),
            body: body.into(),
            channels: BTreeSet::new(),
            template_name: None,
            variables: HashMap::new(),
            scheduled_at: None,
            sent_at: None,
            status: NotificationStatus::Pending,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_channels<I>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = ChannelKind>,
    {
        self.channels = channels.into_iter().collect();
        self
    }

    pub fn with_channel(mut self, channel: ChannelKind) -> Self {
        self.channels.insert(channel);
        self
    }

    pub fn with_kind(mut self, kind: NotificationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_template(mut self, name: impl Into<String>) -> Self {
        self.template_name = Some(name.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Sent, failed and cancelled notifications never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            NotificationStatus::Sent | NotificationStatus::Failed | NotificationStatus::Cancelled
        )
    }

    pub fn has_content(&self) -> bool {
        !self.subject.trim().is_empty() || !self.body.trim().is_empty()
    }
}

// =============================================================================
// Delivery records
// =============================================================================

/// Outcome of a single attempt on one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelAttempt {
    pub channel: ChannelKind,
    pub success: bool,
    pub error: Option<String>,
    /// Set when the attempt was issued as the Email -> WebSocket fallback.
    #[serde(default)]
    pub fallback: bool,
    pub attempted_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// A completed notification as stored in the delivery history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    /// Monotonic append order across the whole store.
    pub sequence: u64,
    pub notification: Notification,
    pub attempts: Vec<ChannelAttempt>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn user_id(&self) -> &str {
        &self.notification.user_id
    }

    pub fn succeeded_channels(&self) -> impl Iterator<Item = ChannelKind> + '_ {
        self.attempts
            .iter()
            .filter(|a| a.success)
            .map(|a| a.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_channel_kind_parsing() {
        assert_eq!("websocket".parse::<ChannelKind>(), Ok(ChannelKind::WebSocket));
        assert_eq!(" Email ".parse::<ChannelKind>(), Ok(ChannelKind::Email));
        assert_eq!("slack".parse::<ChannelKind>(), Ok(ChannelKind::Chat));
        assert!("pager".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn test_channel_kind_serde_names() {
        let json = serde_json::to_string(&ChannelKind::WebSocket).unwrap();
        assert_eq!(json, "\"websocket\"");
        let parsed: ChannelKind = serde_json::from_str("\"sms\"").unwrap();
        assert_eq!(parsed, ChannelKind::Sms);
    }

    #[test]
    fn test_builder_deduplicates_channels() {
        let notification = Notification::new("user-1", "Subject", "Body").with_channels([
            ChannelKind::Email,
            ChannelKind::Email,
            ChannelKind::WebSocket,
        ]);

        assert_eq!(notification.channels.len(), 2);
        assert_eq!(notification.status, NotificationStatus::Pending);
        assert_eq!(notification.max_retries, Notification::DEFAULT_MAX_RETRIES);
        assert!(!notification.is_terminal());
    }

    #[test]
    fn test_has_content() {
        assert!(Notification::new("u", "", "body").has_content());
        assert!(Notification::new("u", "subject", "").has_content());
        assert!(!Notification::new("u", "  ", "").has_content());
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let json = serde_json::json!({
            "id": "n-1",
            "user_id": "user-1",
            "channels": ["email"],
            "created_at": "2024-01-01T00:00:00Z"
        });

        let notification: Notification = serde_json::from_value(json).unwrap();
        assert_eq!(notification.kind, NotificationKind::Info);
        assert_eq!(notification.priority, NotificationPriority::Normal);
        assert_eq!(notification.status, NotificationStatus::Pending);
        assert_eq!(notification.max_retries, 3);
    }
}
