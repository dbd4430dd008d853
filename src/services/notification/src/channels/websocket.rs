//! WebSocket notification channel implementation for real-time notifications
//!
//! Connected clients are fanned out by whatever owns the sockets; this channel
//! only publishes serialized events onto per-user (and optionally global)
//! topics of a pub-sub transport.

use crate::channels::ChannelProvider;
use crate::config::WebSocketConfig;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notification_shared::{ChannelKind, Notification, NotificationKind, NotificationPriority};
use redis::{aio::ConnectionManager, Client as RedisClient};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Topic publisher used by the WebSocket channel
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    fn backend(&self) -> &'static str;
}

/// In-process broadcast hub.
///
/// Publishing to a topic nobody listens on is accepted; the event is simply
/// dropped, as with any fire-and-forget pub-sub.
#[derive(Debug)]
pub struct LocalPubSub {
    buffer_size: usize,
    topics: DashMap<String, broadcast::Sender<Bytes>>,
}

impl LocalPubSub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            topics: DashMap::new(),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSubTransport for LocalPubSub {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let sender = self.topics.get(topic).map(|tx| tx.clone());
        match sender {
            Some(tx) => match tx.send(payload) {
                Ok(receivers) => debug!("Published to {} ({} receivers)", topic, receivers),
                Err(_) => debug!("No live subscribers on {}", topic),
            },
            None => debug!("No subscribers on {}", topic),
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

/// Redis `PUBLISH` transport for multi-instance deployments
#[derive(Clone)]
pub struct RedisPubSub {
    connection: ConnectionManager,
}

impl RedisPubSub {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = RedisClient::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis pub-sub");
        Ok(Self { connection })
    }
}

#[async_trait]
impl PubSubTransport for RedisPubSub {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let receivers = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(&payload[..])
            .query_async::<_, i64>(&mut self.connection.clone())
            .await?;
        debug!("Published to {} ({} receivers)", topic, receivers);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Wire event pushed to subscribers
#[derive(Debug, Serialize)]
struct NotificationEvent<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    id: &'a str,
    user_id: &'a str,
    kind: NotificationKind,
    priority: NotificationPriority,
    subject: &'a str,
    body: &'a str,
    created_at: DateTime<Utc>,
    metadata: &'a HashMap<String, serde_json::Value>,
    timestamp: DateTime<Utc>,
}

/// WebSocket channel for sending real-time notifications
#[derive(Clone)]
pub struct WebSocketChannel {
    config: WebSocketConfig,
    transport: Arc<dyn PubSubTransport>,
}

impl WebSocketChannel {
    pub fn new(config: &WebSocketConfig, transport: Arc<dyn PubSubTransport>) -> Self {
        info!(
            "Initializing WebSocket channel on {} transport",
            transport.backend()
        );
        Self {
            config: config.clone(),
            transport,
        }
    }

    pub fn user_topic(&self, user_id: &str) -> String {
        format!("{}{}", self.config.user_topic_prefix, user_id)
    }

    fn encode(notification: &Notification) -> Result<Bytes> {
        let event = NotificationEvent {
            event_type: "notification",
            id: &notification.id,
            user_id: &notification.user_id,
            kind: notification.kind,
            priority: notification.priority,
            subject: &notification.subject,
            body: &notification.body,
            created_at: notification.created_at,
            metadata: &notification.metadata,
            timestamp: Utc::now(),
        };
        Ok(Bytes::from(serde_json::to_vec(&event)?))
    }
}

#[async_trait]
impl ChannelProvider for WebSocketChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::WebSocket
    }

    fn name(&self) -> &str {
        self.transport.backend()
    }

    fn is_available(&self) -> bool {
        self.config.enabled
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let payload = Self::encode(notification)?;

        let topic = self.user_topic(&notification.user_id);
        self.transport
            .publish(&topic, payload.clone())
            .await
            .map_err(|e| NotificationError::channel_delivery("websocket", e.to_string()))?;

        if self.config.publish_global {
            if let Some(ref global) = self.config.global_topic {
                if let Err(e) = self.transport.publish(global, payload).await {
                    warn!("Global publish for notification {} failed: {}", notification.id, e);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn create_test_config() -> WebSocketConfig {
        WebSocketConfig {
            enabled: true,
            user_topic_prefix: "notifications:user:".to_string(),
            global_topic: Some("notifications:global".to_string()),
            publish_global: true,
            buffer_size: 16,
            timeout_seconds: 5,
        }
    }

    /// Accepts user topics, rejects the global one
    #[derive(Default)]
    struct FlakyGlobal {
        topics: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PubSubTransport for FlakyGlobal {
        async fn publish(&self, topic: &str, _payload: Bytes) -> Result<()> {
            self.topics.lock().push(topic.to_string());
            if topic.ends_with("global") {
                Err(NotificationError::store("connection reset"))
            } else {
                Ok(())
            }
        }

        fn backend(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_publishes_to_user_topic() {
        let hub = Arc::new(LocalPubSub::new(8));
        let mut rx = hub.subscribe("notifications:user:user-1");
        let channel = WebSocketChannel::new(&create_test_config(), hub.clone());

        let notification = Notification::new("user-1", "Deploy", "Done");
        channel.send(&notification).await.unwrap();

        let payload = rx.recv().await.unwrap();
        let event: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(event["type"], "notification");
        assert_eq!(event["id"], notification.id.as_str());
        assert_eq!(event["subject"], "Deploy");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let hub = Arc::new(LocalPubSub::new(8));
        let channel = WebSocketChannel::new(&create_test_config(), hub.clone());

        channel
            .send(&Notification::new("nobody", "s", "b"))
            .await
            .unwrap();
        assert_eq!(hub.subscriber_count("notifications:user:nobody"), 0);
    }

    #[tokio::test]
    async fn test_global_failure_does_not_fail_delivery() {
        let transport = Arc::new(FlakyGlobal::default());
        let channel = WebSocketChannel::new(&create_test_config(), transport.clone());

        channel
            .send(&Notification::new("user-1", "s", "b"))
            .await
            .unwrap();
        assert_eq!(
            transport.topics.lock().clone(),
            vec![
                "notifications:user:user-1".to_string(),
                "notifications:global".to_string()
            ]
        );
    }

    #[test]
    fn test_availability_follows_config() {
        let mut config = create_test_config();
        config.enabled = false;
        let channel = WebSocketChannel::new(&config, Arc::new(LocalPubSub::new(1)));
        assert!(!channel.is_available());
        assert_eq!(channel.user_topic("u"), "notifications:user:u");
    }
}
