//! Notification Manager
//!
//! The core component that coordinates every send:
//! - Validation and per-user hourly rate limiting
//! - Quiet-hours deferral into the scheduled store
//! - Channel resolution against preferences and provider availability
//! - Concurrent fan-out with a single Email to WebSocket fallback
//! - History and metrics bookkeeping

use crate::channels::{ChannelProvider, ChannelRegistry};
use crate::clock::{Clock, SystemClock};
use crate::config::NotificationConfig;
use crate::error::{NotificationError, Result};
use crate::history::HistoryStore;
use crate::metrics::{
    MetricsRecorder, MetricsSnapshot, FALLBACK_ATTEMPTED, NO_AVAILABLE_CHANNEL, RATE_LIMITED,
    VALIDATION_FAILED,
};
use crate::preferences::{MemoryPreferenceStore, PreferenceStore};
use crate::quiet_hours::{QuietDecision, QuietHoursGate};
use crate::rate_limiter::{RateDecision, RateLimiter, SlidingWindowLimiter};
use crate::scheduler::{ScheduledStore, SchedulerHandle};
use crate::store::KvStore;
use crate::templates::TemplateRegistry;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use notification_shared::{
    ChannelAttempt, ChannelKind, HistoryEntry, Notification, NotificationPreferences,
    NotificationStatus, NotificationTemplate,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Result of a send that was not rejected up front
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dispatch {
    /// The notification in its final (or scheduled) state
    pub notification: Notification,
    /// Every channel attempt made, fallback included
    pub attempts: Vec<ChannelAttempt>,
}

impl Dispatch {
    /// Delivered on at least one channel, or deferred for later delivery.
    pub fn accepted(&self) -> bool {
        matches!(
            self.notification.status,
            NotificationStatus::Sent | NotificationStatus::Scheduled
        )
    }

    pub fn status(&self) -> NotificationStatus {
        self.notification.status
    }

    pub fn is_scheduled(&self) -> bool {
        self.notification.status == NotificationStatus::Scheduled
    }

    pub fn succeeded(&self) -> impl Iterator<Item = ChannelKind> + '_ {
        self.attempts.iter().filter(|a| a.success).map(|a| a.channel)
    }
}

/// Main notification manager that coordinates all notification operations
#[derive(Clone)]
pub struct NotificationManager {
    config: Arc<NotificationConfig>,
    clock: Arc<dyn Clock>,
    preferences: Arc<dyn PreferenceStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    quiet_hours: QuietHoursGate,
    templates: Arc<TemplateRegistry>,
    channels: Arc<ChannelRegistry>,
    history: Arc<HistoryStore>,
    metrics: Arc<MetricsRecorder>,
    scheduled: Arc<ScheduledStore>,
    store: Option<Arc<dyn KvStore>>,
    scheduler: Arc<Mutex<Option<SchedulerHandle>>>,
}

/// Assembles a [`NotificationManager`]; anything not set gets the in-memory default.
pub struct ManagerBuilder {
    config: NotificationConfig,
    clock: Option<Arc<dyn Clock>>,
    preferences: Option<Arc<dyn PreferenceStore>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    templates: Option<Arc<TemplateRegistry>>,
    metrics: Option<Arc<MetricsRecorder>>,
    store: Option<Arc<dyn KvStore>>,
    providers: Vec<Arc<dyn ChannelProvider>>,
}

impl ManagerBuilder {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            config,
            clock: None,
            preferences: None,
            rate_limiter: None,
            templates: None,
            metrics: None,
            store: None,
            providers: Vec::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn preferences(mut self, preferences: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn templates(mut self, templates: Arc<TemplateRegistry>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Shared store reported by the health check
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ChannelProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn build(self) -> Result<NotificationManager> {
        self.config.validate().map_err(NotificationError::config)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let templates = match self.templates {
            Some(templates) => templates,
            None => Arc::new(TemplateRegistry::from_config(&self.config.template)?),
        };

        let mut channels = ChannelRegistry::new(clock.clone());
        for provider in self.providers {
            channels.register(provider);
        }

        let config = self.config;
        let manager = NotificationManager {
            preferences: self.preferences.unwrap_or_else(|| {
                Arc::new(MemoryPreferenceStore::new(
                    config.engine.default_frequency_limit,
                ))
            }),
            rate_limiter: self
                .rate_limiter
                .unwrap_or_else(|| Arc::new(SlidingWindowLimiter::new())),
            quiet_hours: QuietHoursGate::new(config.default_timezone()),
            history: Arc::new(HistoryStore::new(config.engine.history_capacity)),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(MetricsRecorder::new())),
            scheduled: Arc::new(ScheduledStore::new()),
            store: self.store,
            scheduler: Arc::new(Mutex::new(None)),
            channels: Arc::new(channels),
            templates,
            clock,
            config: Arc::new(config),
        };

        info!(
            "Notification manager ready with channels {:?}, rate limiter {}",
            manager.channels.kinds(),
            manager.rate_limiter.backend()
        );
        Ok(manager)
    }
}

/// Reject notifications that cannot be dispatched at all.
pub fn validate_notification(notification: &Notification) -> Result<()> {
    if notification.user_id.trim().is_empty() {
        return Err(NotificationError::validation("user_id", "cannot be empty"));
    }
    if !notification.has_content() {
        return Err(NotificationError::validation(
            "content",
            "subject or body is required",
        ));
    }
    if notification.channels.is_empty() {
        return Err(NotificationError::validation(
            "channels",
            "at least one channel is required",
        ));
    }
    if notification.is_terminal() {
        return Err(NotificationError::validation(
            "status",
            format!("notification is already {}", notification.status),
        ));
    }
    if notification.retry_count > notification.max_retries {
        return Err(NotificationError::validation(
            "retry_count",
            "exceeds max_retries",
        ));
    }
    Ok(())
}

impl NotificationManager {
    pub fn builder(config: NotificationConfig) -> ManagerBuilder {
        ManagerBuilder::new(config)
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Send a notification.
    ///
    /// Validation, rate-limit and no-channel rejections come back as `Err`
    /// with no history written. Anything that reaches dispatch comes back as
    /// `Ok`, whether it was sent, failed on every channel, or deferred.
    pub async fn send(&self, notification: Notification) -> Result<Dispatch> {
        if let Err(e) = validate_notification(&notification) {
            self.metrics.incr(VALIDATION_FAILED);
            warn!("Rejected notification {}: {}", notification.id, e);
            return Err(e);
        }

        self.dispatch(notification).await
    }

    /// Boolean form of [`send`](Self::send).
    pub async fn notify(&self, notification: Notification) -> bool {
        self.send(notification)
            .await
            .map(|dispatch| dispatch.accepted())
            .unwrap_or(false)
    }

    /// Send many notifications with bounded concurrency; results keep input order.
    pub async fn send_bulk(&self, notifications: Vec<Notification>) -> Vec<Result<Dispatch>> {
        info!(
            "Processing bulk send of {} notifications",
            notifications.len()
        );

        let semaphore = Arc::new(Semaphore::new(self.config.engine.bulk_concurrency.max(1)));
        let mut handles = Vec::with_capacity(notifications.len());

        for notification in notifications {
            let manager = self.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    NotificationError::internal(format!("Failed to acquire semaphore: {}", e))
                })?;
                manager.send(notification).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(NotificationError::internal(format!(
                    "Bulk send task failed: {}",
                    e
                ))),
            });
        }

        let accepted = results
            .iter()
            .filter(|r| r.as_ref().map(|d| d.accepted()).unwrap_or(false))
            .count();
        info!(
            "Bulk send finished: {} accepted, {} not",
            accepted,
            results.len() - accepted
        );
        results
    }

    /// Render a registered template for `user_id` and send it.
    pub async fn render_and_send(
        &self,
        template_name: &str,
        user_id: &str,
        variables: &HashMap<String, String>,
    ) -> Result<Dispatch> {
        let mut notification = self.templates.render(template_name, variables)?;
        notification.user_id = user_id.to_string();
        notification.created_at = self.clock.now();
        notification.max_retries = self.config.engine.default_max_retries;
        self.send(notification).await
    }

    pub fn register_template(&self, template: NotificationTemplate) -> Result<NotificationTemplate> {
        self.templates.register(template)
    }

    pub async fn preferences(&self, user_id: &str) -> Result<NotificationPreferences> {
        self.preferences.get_or_default(user_id).await
    }

    pub async fn update_preferences(&self, preferences: NotificationPreferences) -> Result<()> {
        self.preferences.upsert(preferences).await
    }

    /// Re-dispatch every scheduled notification due at `now`.
    ///
    /// Deferred notifications go through rate limiting and quiet hours again.
    /// One that is now rejected is recorded as failed, since its caller has
    /// already been told it was accepted. Releases run concurrently, up to
    /// the bulk concurrency, and results come back in completion order.
    pub async fn process_due(&self, now: DateTime<Utc>) -> Vec<Dispatch> {
        let due = self.scheduled.take_due(now);
        if due.is_empty() {
            return Vec::new();
        }
        info!("Processing {} due scheduled notifications", due.len());

        stream::iter(due)
            .map(|notification| self.release(notification))
            .buffer_unordered(self.config.engine.bulk_concurrency.max(1))
            .filter_map(|dispatch| async move { dispatch })
            .collect()
            .await
    }

    async fn release(&self, notification: Notification) -> Option<Dispatch> {
        match self.dispatch(notification.clone()).await {
            Ok(dispatch) => Some(dispatch),
            Err(e) if e.is_rejection() => {
                warn!(
                    "Scheduled notification {} rejected on release: {}",
                    notification.id, e
                );
                let mut failed = notification;
                failed.status = NotificationStatus::Failed;
                Some(self.finalize(failed, Vec::new()))
            }
            Err(e) => {
                error!(
                    "Scheduled notification {} could not be processed, keeping it: {}",
                    notification.id, e
                );
                if let Err(e) = self.scheduled.insert(notification) {
                    error!("Failed to re-queue scheduled notification: {}", e);
                }
                None
            }
        }
    }

    /// Drop idle per-user limiter state in the engine and its channels.
    ///
    /// Runs on every scheduler tick. Returns how many users the engine-wide
    /// rate limiter forgot.
    pub async fn housekeeping(&self, now: DateTime<Utc>) -> usize {
        let purged = self.rate_limiter.purge(now).await;
        self.channels.housekeeping();
        purged
    }

    /// Cancel a scheduled notification; it is recorded in history as cancelled.
    pub fn cancel_scheduled(&self, notification_id: &str) -> Option<Notification> {
        let mut notification = self.scheduled.remove(notification_id)?;
        notification.status = NotificationStatus::Cancelled;
        info!("Cancelled scheduled notification: {}", notification_id);
        Some(self.finalize(notification, Vec::new()).notification)
    }

    pub fn scheduled_for(&self, user_id: &str) -> Vec<Notification> {
        self.scheduled.for_user(user_id)
    }

    pub fn history(&self, user_id: &str, limit: usize) -> Vec<HistoryEntry> {
        self.history.query(user_id, limit)
    }

    pub fn history_entry(&self, notification_id: &str) -> Option<HistoryEntry> {
        self.history.get(notification_id)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Start the background tick that releases due scheduled notifications.
    pub fn start_scheduler(&self) {
        let mut slot = self.scheduler.lock();
        if slot.as_ref().map(|h| h.is_running()).unwrap_or(false) {
            return;
        }

        let manager = self.clone();
        let token = self.channels.shutdown_token().child_token();
        *slot = Some(SchedulerHandle::spawn(
            self.config.scheduler_interval(),
            token,
            move || {
                let manager = manager.clone();
                async move {
                    let now = manager.clock.now();
                    manager.process_due(now).await;
                    manager.housekeeping(now).await;
                }
            },
        ));
    }

    pub async fn stop_scheduler(&self) {
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub fn scheduler_running(&self) -> bool {
        self.scheduler
            .lock()
            .as_ref()
            .map(|h| h.is_running())
            .unwrap_or(false)
    }

    /// Stop the scheduler and fail any channel attempt still in flight.
    pub async fn shutdown(&self) {
        info!("Shutting down notification manager");
        self.stop_scheduler().await;
        self.channels.shutdown();
    }

    pub async fn health_check(&self) -> serde_json::Value {
        let now = self.clock.now();
        let channels: serde_json::Map<String, serde_json::Value> = self
            .channels
            .availability()
            .into_iter()
            .map(|(kind, available)| (kind.to_string(), json!(available)))
            .collect();
        let any_channel = channels.values().any(|v| v.as_bool().unwrap_or(false));

        let store = match self.store {
            Some(ref store) => match store.ping().await {
                Ok(()) => json!({ "backend": store.backend(), "healthy": true }),
                Err(e) => json!({ "backend": store.backend(), "healthy": false, "error": e.to_string() }),
            },
            None => serde_json::Value::Null,
        };
        let store_ok = store
            .get("healthy")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        json!({
            "status": if any_channel && store_ok { "healthy" } else { "degraded" },
            "channels": channels,
            "rate_limiter": self.rate_limiter.backend(),
            "store": store,
            "history": {
                "entries": self.history.len(),
                "capacity": self.history.capacity(),
            },
            "scheduled": self.scheduled.stats(now),
            "scheduler_running": self.scheduler_running(),
            "templates": self.templates.len(),
            "timestamp": now,
        })
    }

    /// Steps from rate limiting onwards; shared by fresh and released sends.
    async fn dispatch(&self, mut notification: Notification) -> Result<Dispatch> {
        let now = self.clock.now();
        let user_id = notification.user_id.clone();
        let prefs = self.preferences.get_or_default(&user_id).await?;

        match self
            .rate_limiter
            .check(&user_id, prefs.frequency_limit, now)
            .await?
        {
            RateDecision::Allowed { .. } => {}
            RateDecision::Rejected { retry_at } => {
                self.metrics.incr(RATE_LIMITED);
                warn!(
                    "Rate limit exceeded for user {} (limit {}/h, retry at {:?})",
                    user_id, prefs.frequency_limit, retry_at
                );
                return Err(NotificationError::rate_limit(user_id, prefs.frequency_limit));
            }
        }

        if let QuietDecision::Deferred { until } = self.quiet_hours.check(&prefs, now)? {
            notification.status = NotificationStatus::Scheduled;
            notification.scheduled_at = Some(until);
            self.scheduled.insert(notification.clone())?;
            self.metrics.incr("notifications.scheduled");
            info!(
                "Notification {} deferred by quiet hours until {}",
                notification.id, until
            );
            return Ok(Dispatch {
                notification,
                attempts: Vec::new(),
            });
        }

        let resolved = self.resolve_channels(&notification, &prefs);
        if resolved.is_empty() {
            self.metrics.incr(NO_AVAILABLE_CHANNEL);
            warn!(
                "No available channel for notification {} to user {}",
                notification.id, user_id
            );
            return Err(NotificationError::no_available_channel(user_id));
        }

        let mut attempts = self.fan_out(&notification, &resolved).await;

        if self.fallback_due(&notification, &attempts) {
            notification.retry_count += 1;
            self.metrics.incr(FALLBACK_ATTEMPTED);
            info!(
                "Email failed for notification {}, falling back to WebSocket",
                notification.id
            );
            let shared = Arc::new(notification.clone());
            attempts.push(
                self.channels
                    .attempt(ChannelKind::WebSocket, shared, true)
                    .await,
            );
        }

        for attempt in &attempts {
            self.metrics
                .record(notification.kind, attempt.channel, attempt.success);
        }

        notification.status = if attempts.iter().any(|a| a.success) {
            NotificationStatus::Sent
        } else {
            NotificationStatus::Failed
        };
        Ok(self.finalize(notification, attempts))
    }

    /// Requested channels that the user allows and whose provider is up.
    fn resolve_channels(
        &self,
        notification: &Notification,
        prefs: &NotificationPreferences,
    ) -> Vec<ChannelKind> {
        if !prefs.kind_enabled(notification.kind) {
            return Vec::new();
        }
        notification
            .channels
            .iter()
            .copied()
            .filter(|c| prefs.channel_enabled(*c) && self.channels.is_available(*c))
            .collect()
    }

    /// One attempt per resolved channel, all in flight together.
    ///
    /// With a dispatch timeout, attempts still running at the deadline are
    /// cancelled and recorded as timed out; finished ones keep their outcome.
    async fn fan_out(
        &self,
        notification: &Notification,
        resolved: &[ChannelKind],
    ) -> Vec<ChannelAttempt> {
        let shared = Arc::new(notification.clone());
        let deadline = self.channels.shutdown_token().child_token();
        let attempts = join_all(resolved.iter().map(|kind| {
            self.channels
                .attempt_until(*kind, shared.clone(), false, deadline.clone())
        }));

        let Some(limit) = self.config.dispatch_timeout() else {
            return attempts.await;
        };

        tokio::pin!(attempts);
        tokio::select! {
            finished = &mut attempts => finished,
            _ = tokio::time::sleep(limit) => {
                error!(
                    "Fan-out for notification {} exceeded {}s, cancelling unfinished channels",
                    notification.id,
                    limit.as_secs()
                );
                deadline.cancel();
                attempts.await
            }
        }
    }

    /// Email failed, WebSocket has not already delivered, and a retry is left.
    fn fallback_due(&self, notification: &Notification, attempts: &[ChannelAttempt]) -> bool {
        let email_failed = attempts
            .iter()
            .any(|a| a.channel == ChannelKind::Email && !a.success);
        let websocket_delivered = attempts
            .iter()
            .any(|a| a.channel == ChannelKind::WebSocket && a.success);

        email_failed
            && !websocket_delivered
            && notification.retry_count < notification.max_retries
            && self.channels.is_available(ChannelKind::WebSocket)
    }

    /// Stamp, record and report a notification that reached a terminal state.
    fn finalize(&self, mut notification: Notification, attempts: Vec<ChannelAttempt>) -> Dispatch {
        let now = self.clock.now();
        if notification.status == NotificationStatus::Sent {
            notification.sent_at = Some(now.max(notification.created_at));
        }

        self.history
            .append(notification.clone(), attempts.clone(), now);
        self.metrics
            .record_outcome(notification.kind, notification.status);

        info!(
            "Notification {} for user {} finished as {} after {} attempts",
            notification.id,
            notification.user_id,
            notification.status,
            attempts.len()
        );

        Dispatch {
            notification,
            attempts,
        }
    }
}
