//! # Notification Engine
//!
//! Multi-channel notification delivery engine for the AI-CORE platform providing:
//! - Real-time WebSocket notifications over pub-sub topics
//! - Email notifications via SMTP with a fallback relay
//! - Chat notifications via room webhooks
//! - SMS notifications through a provider chain
//! - Template management and personalization
//! - Per-user rate limiting, preferences and quiet hours
//!
//! ## Features
//!
//! - **Concurrent fan-out**: one task per channel, each with its own timeout
//! - **Fallback**: a failed email is retried once over WebSocket
//! - **Rate limiting**: sliding one-hour window per user, or a shared Redis counter
//! - **Quiet hours**: timezone-aware deferral with a background scheduler
//! - **Template engine**: Handlebars-based, versioned templates
//! - **History and metrics**: bounded delivery history and Prometheus counters
//!
//! ## Usage
//!
//! ```rust,no_run
//! use notification_engine::{NotificationConfig, NotificationService};
//! use notification_shared::{ChannelKind, Notification};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NotificationConfig::from_env()?;
//!     let service = NotificationService::from_config(config).await?;
//!
//!     let notification = Notification::new("user123", "Workflow Complete", "Your run finished.")
//!         .with_channels([ChannelKind::WebSocket, ChannelKind::Email]);
//!
//!     let dispatch = service.send(notification).await?;
//!     println!("Notification {} is {}", dispatch.notification.id, dispatch.status());
//!
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

pub mod channels;
pub mod clock;
pub mod config;
pub mod error;
pub mod history;
pub mod manager;
pub mod metrics;
pub mod preferences;
pub mod quiet_hours;
pub mod rate_limiter;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod templates;

pub use channels::{ChannelProvider, ChannelRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::NotificationConfig;
pub use error::{NotificationError, Result};
pub use manager::{Dispatch, ManagerBuilder, NotificationManager};
pub use metrics::{MetricsRecorder, MetricsSink, MetricsSnapshot, PrometheusSink};
pub use preferences::{MemoryPreferenceStore, PreferenceStore};
pub use rate_limiter::{RateDecision, RateLimiter, SlidingWindowLimiter, StoreBackedLimiter};
pub use store::{KvStore, MemoryKvStore, RedisKvStore};
pub use templates::TemplateRegistry;

// Re-export shared types for convenience
pub use notification_shared::{
    ChannelAttempt, ChannelKind, HistoryEntry, Notification, NotificationKind,
    NotificationPreferences, NotificationPriority, NotificationStatus, NotificationTemplate,
    QuietHours,
};

use channels::{
    ChatChannel, ContactDirectory, EmailChannel, HttpTransport, InMemoryDirectory, LocalPubSub,
    MailTransport, PubSubTransport, RedisPubSub, SmsChannel, SmsProvider,
    SmtpMailer, WebSocketChannel,
};

/// Main notification service struct that coordinates all notification operations
#[derive(Clone)]
pub struct NotificationService {
    manager: Arc<NotificationManager>,
    prometheus: Option<PrometheusSink>,
    local_pubsub: Option<Arc<LocalPubSub>>,
}

impl NotificationService {
    /// Build every enabled channel from configuration
    pub async fn from_config(config: NotificationConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Builder for embedders that supply their own transports or stores
    pub fn builder(config: NotificationConfig) -> NotificationServiceBuilder {
        NotificationServiceBuilder::new(config)
    }

    pub fn manager(&self) -> &NotificationManager {
        &self.manager
    }

    /// Send a single notification
    pub async fn send(&self, notification: Notification) -> Result<Dispatch> {
        self.manager.send(notification).await
    }

    /// `true` when delivered on some channel or deferred by quiet hours
    pub async fn notify(&self, notification: Notification) -> bool {
        self.manager.notify(notification).await
    }

    /// Send multiple notifications in a batch
    pub async fn send_bulk(&self, notifications: Vec<Notification>) -> Vec<Result<Dispatch>> {
        self.manager.send_bulk(notifications).await
    }

    pub async fn render_and_send(
        &self,
        template_name: &str,
        user_id: &str,
        variables: &HashMap<String, String>,
    ) -> Result<Dispatch> {
        self.manager
            .render_and_send(template_name, user_id, variables)
            .await
    }

    pub fn register_template(&self, template: NotificationTemplate) -> Result<NotificationTemplate> {
        self.manager.register_template(template)
    }

    pub fn render_template(
        &self,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<Notification> {
        self.manager.templates().render(name, variables)
    }

    pub async fn preferences(&self, user_id: &str) -> Result<NotificationPreferences> {
        self.manager.preferences(user_id).await
    }

    pub async fn update_preferences(&self, preferences: NotificationPreferences) -> Result<()> {
        self.manager.update_preferences(preferences).await
    }

    pub fn cancel_scheduled(&self, notification_id: &str) -> Option<Notification> {
        self.manager.cancel_scheduled(notification_id)
    }

    pub fn history(&self, user_id: &str, limit: usize) -> Vec<HistoryEntry> {
        self.manager.history(user_id, limit)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.manager.metrics_snapshot()
    }

    /// Prometheus text exposition, when the exporter is enabled
    pub fn render_metrics(&self) -> Option<Result<String>> {
        self.prometheus.as_ref().map(|sink| sink.render())
    }

    /// Listen on a WebSocket topic of the in-process hub.
    ///
    /// `None` when events go to an external pub-sub instead.
    pub fn subscribe(&self, topic: &str) -> Option<broadcast::Receiver<bytes::Bytes>> {
        self.local_pubsub.as_ref().map(|hub| hub.subscribe(topic))
    }

    pub async fn health_check(&self) -> serde_json::Value {
        self.manager.health_check().await
    }

    pub fn start_scheduler(&self) {
        self.manager.start_scheduler()
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await
    }
}

/// Wires configuration, injected transports and stores into a service
pub struct NotificationServiceBuilder {
    config: NotificationConfig,
    clock: Option<Arc<dyn Clock>>,
    directory: Option<Arc<dyn ContactDirectory>>,
    pubsub: Option<Arc<dyn PubSubTransport>>,
    mailer: Option<Arc<dyn MailTransport>>,
    fallback_mailer: Option<Arc<dyn MailTransport>>,
    http: Option<Box<dyn HttpTransport>>,
    sms_providers: Option<Vec<Arc<dyn SmsProvider>>>,
    store: Option<Arc<dyn KvStore>>,
    preferences: Option<Arc<dyn PreferenceStore>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    providers: Vec<Arc<dyn ChannelProvider>>,
}

impl NotificationServiceBuilder {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            config,
            clock: None,
            directory: None,
            pubsub: None,
            mailer: None,
            fallback_mailer: None,
            http: None,
            sms_providers: None,
            store: None,
            preferences: None,
            metrics_sink: None,
            providers: Vec::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Email and phone lookup; defaults to an empty in-memory directory
    pub fn directory(mut self, directory: Arc<dyn ContactDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn pubsub(mut self, pubsub: Arc<dyn PubSubTransport>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn mailer(mut self, mailer: Arc<dyn MailTransport>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn fallback_mailer(mut self, mailer: Arc<dyn MailTransport>) -> Self {
        self.fallback_mailer = Some(mailer);
        self
    }

    pub fn http(mut self, http: Box<dyn HttpTransport>) -> Self {
        self.http = Some(http);
        self
    }

    /// SMS gateways in priority order; the simulated provider is always appended
    pub fn sms_providers(mut self, providers: Vec<Arc<dyn SmsProvider>>) -> Self {
        self.sms_providers = Some(providers);
        self
    }

    /// Shared store; switches rate limiting to the store-backed limiter
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn preferences(mut self, preferences: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    /// Register a provider directly, replacing the configured one for its channel
    pub fn provider(mut self, provider: Arc<dyn ChannelProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub async fn build(self) -> Result<NotificationService> {
        let config = self.config;
        config.validate().map_err(NotificationError::config)?;
        info!("Initializing notification service");

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let templates = Arc::new(TemplateRegistry::from_config(&config.template)?);
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(InMemoryDirectory::new()));

        let store: Option<Arc<dyn KvStore>> = match (self.store, config.redis.url.as_deref()) {
            (Some(store), _) => Some(store),
            (None, Some(url)) => Some(Arc::new(
                RedisKvStore::connect(url, config.redis.key_prefix.clone()).await?,
            )),
            (None, None) => None,
        };
        let rate_limiter: Arc<dyn RateLimiter> = match store {
            Some(ref store) => Arc::new(StoreBackedLimiter::new(store.clone())),
            None => Arc::new(SlidingWindowLimiter::new()),
        };

        let mut prometheus = None;
        let sink = match self.metrics_sink {
            Some(sink) => Some(sink),
            None if config.metrics.enabled => {
                let exporter = PrometheusSink::new(&config.metrics)?;
                prometheus = Some(exporter.clone());
                Some(Arc::new(exporter) as Arc<dyn MetricsSink>)
            }
            None => None,
        };
        let metrics = match sink {
            Some(sink) => MetricsRecorder::with_sink(sink),
            None => MetricsRecorder::new(),
        };

        let mut manager = ManagerBuilder::new(config.clone())
            .clock(clock)
            .templates(templates.clone())
            .rate_limiter(rate_limiter)
            .metrics(Arc::new(metrics));
        if let Some(store) = store {
            manager = manager.store(store);
        }
        if let Some(preferences) = self.preferences {
            manager = manager.preferences(preferences);
        }

        let mut local_pubsub = None;
        if config.websocket.enabled {
            let transport: Arc<dyn PubSubTransport> =
                match (self.pubsub, config.redis.url.as_deref()) {
                    (Some(pubsub), _) => pubsub,
                    (None, Some(url)) => Arc::new(RedisPubSub::connect(url).await?),
                    (None, None) => {
                        let hub = Arc::new(LocalPubSub::new(config.websocket.buffer_size));
                        local_pubsub = Some(hub.clone());
                        hub
                    }
                };
            manager = manager.provider(Arc::new(WebSocketChannel::new(
                &config.websocket,
                transport,
            )));
        }

        if config.email.enabled {
            let primary: Arc<dyn MailTransport> = match self.mailer {
                Some(mailer) => mailer,
                None => Arc::new(SmtpMailer::new(&config.email.primary, &config.email)?),
            };
            let fallback: Option<Arc<dyn MailTransport>> =
                match (self.fallback_mailer, &config.email.fallback) {
                    (Some(mailer), _) => Some(mailer),
                    (None, Some(smtp)) => Some(Arc::new(SmtpMailer::new(smtp, &config.email)?)),
                    (None, None) => None,
                };

            let mut email =
                EmailChannel::new(&config.email, directory.clone(), templates, primary);
            if let Some(fallback) = fallback {
                email = email.with_fallback(fallback);
            }
            manager = manager.provider(Arc::new(email));
        }

        if config.chat.enabled {
            let chat = match self.http {
                Some(http) => ChatChannel::new(&config.chat, http),
                None => ChatChannel::from_config(&config.chat)?,
            };
            manager = manager.provider(Arc::new(chat));
        }

        if config.sms.enabled {
            let sms = match self.sms_providers {
                Some(providers) => SmsChannel::new(&config.sms, directory, providers),
                None => SmsChannel::from_config(&config.sms, directory)?,
            };
            manager = manager.provider(Arc::new(sms));
        }

        for provider in self.providers {
            manager = manager.provider(provider);
        }

        let manager = manager.build()?;
        info!("Notification service initialized successfully");

        Ok(NotificationService {
            manager: Arc::new(manager),
            prometheus,
            local_pubsub,
        })
    }
}
