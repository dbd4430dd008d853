//! Chat notification channel implementation using incoming webhooks

use crate::channels::ChannelProvider;
use crate::config::ChatConfig;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use notification_shared::{ChannelKind, Notification, NotificationKind};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};

/// JSON poster used by the chat channel
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST `payload` and return the response status code.
    async fn post_json(&self, url: &str, payload: &Value) -> Result<u16>;
}

/// `reqwest` client with the channel's timeout and user agent
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| {
                NotificationError::config(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, payload: &Value) -> Result<u16> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

/// Chat channel posting formatted messages to room webhooks
pub struct ChatChannel {
    config: ChatConfig,
    transport: Box<dyn HttpTransport>,
}

impl ChatChannel {
    pub fn new(config: &ChatConfig, transport: Box<dyn HttpTransport>) -> Self {
        info!(
            "Initializing chat channel with {} rooms",
            config.rooms.len()
        );
        Self {
            config: config.clone(),
            transport,
        }
    }

    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(
            Duration::from_secs(config.timeout_seconds),
            &config.user_agent,
        )?;
        Ok(Self::new(config, Box::new(transport)))
    }

    /// Room for a notification: template mapping, then kind mapping, then the default room.
    pub fn resolve_room(&self, notification: &Notification) -> &str {
        notification
            .template_name
            .as_ref()
            .and_then(|name| self.config.template_rooms.get(name))
            .or_else(|| self.config.kind_rooms.get(notification.kind.as_str()))
            .map(String::as_str)
            .unwrap_or(&self.config.default_room)
    }

    fn room_url(&self, room: &str) -> Option<&str> {
        self.config
            .rooms
            .get(room)
            .or_else(|| self.config.rooms.get(&self.config.default_room))
            .map(String::as_str)
    }

    pub fn build_payload(notification: &Notification, room: &str) -> Value {
        json!({
            "channel": room,
            "username": "Notifications",
            "text": format!("*{}*\n{}", notification.subject, notification.body),
            "attachments": [{
                "color": kind_color(notification.kind),
                "title": notification.subject,
                "text": notification.body,
                "fields": [
                    { "title": "Kind", "value": notification.kind.as_str(), "short": true },
                    { "title": "Priority", "value": notification.priority, "short": true }
                ],
                "footer": notification.id,
                "ts": notification.created_at.timestamp()
            }]
        })
    }
}

fn kind_color(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::Info => "#439FE0",
        NotificationKind::Success => "good",
        NotificationKind::Warning => "warning",
        NotificationKind::Error | NotificationKind::Critical => "danger",
    }
}

#[async_trait]
impl ChannelProvider for ChatChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Chat
    }

    fn name(&self) -> &str {
        "chat-webhook"
    }

    fn is_available(&self) -> bool {
        self.config.enabled && !self.config.rooms.is_empty()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let room = self.resolve_room(notification);
        let url = self.room_url(room).ok_or_else(|| {
            NotificationError::channel_delivery("chat", format!("no webhook for room {}", room))
        })?;

        let payload = Self::build_payload(notification, room);
        let status = self.transport.post_json(url, &payload).await?;

        if status == 200 {
            info!(
                "Chat notification {} posted to {}",
                notification.id, room
            );
            Ok(())
        } else {
            error!(
                "Chat webhook for {} answered {} for notification {}",
                room, status, notification.id
            );
            Err(NotificationError::channel_delivery(
                "chat",
                format!("HTTP {}", status),
            ))
        }
    }
}
