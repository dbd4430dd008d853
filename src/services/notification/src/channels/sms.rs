//! SMS notification channel implementation
//!
//! Providers are tried in priority order; a simulated provider that always
//! accepts sits at the end of the chain. The channel also applies its own
//! per-user, per-minute cap on top of the engine's hourly limit.

use crate::channels::{ChannelProvider, ContactDirectory};
use crate::config::{SmsConfig, TwilioConfig};
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter as Governor,
};
use notification_shared::{ChannelKind, Notification};
use parking_lot::Mutex;
use reqwest::Client;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A single SMS gateway
#[async_trait]
pub trait SmsProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send_sms(&self, to: &str, body: &str) -> Result<()>;
}

/// Twilio Messages API
#[derive(Clone)]
pub struct TwilioSmsProvider {
    client: Client,
    config: TwilioConfig,
}

impl TwilioSmsProvider {
    pub fn new(config: &TwilioConfig, timeout: Duration) -> Result<Self> {
        if config.account_sid.is_empty() || config.auth_token.is_empty() {
            return Err(NotificationError::config("Twilio credentials are missing"));
        }

        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            NotificationError::config(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl SmsProvider for TwilioSmsProvider {
    fn name(&self) -> &str {
        "twilio"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[
                ("To", to),
                ("From", self.config.from_phone.as_str()),
                ("Body", body),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotificationError::channel_delivery(
                "sms",
                format!(
                    "Twilio HTTP {} - {}",
                    status,
                    response.text().await.unwrap_or_default()
                ),
            ))
        }
    }
}

/// Message accepted by [`SimulatedSmsProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSms {
    pub to: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// In-process provider that always accepts and keeps what it was given.
#[derive(Debug, Default)]
pub struct SimulatedSmsProvider {
    outbox: Mutex<Vec<SentSms>>,
}

impl SimulatedSmsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbox(&self) -> Vec<SentSms> {
        self.outbox.lock().clone()
    }
}

#[async_trait]
impl SmsProvider for SimulatedSmsProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        info!("Simulated SMS to {} ({} chars)", to, body.chars().count());
        self.outbox.lock().push(SentSms {
            to: to.to_string(),
            body: body.to_string(),
            sent_at: Utc::now(),
        });
        Ok(())
    }
}

/// SMS channel for sending notifications through a provider chain
pub struct SmsChannel {
    config: SmsConfig,
    directory: Arc<dyn ContactDirectory>,
    providers: Vec<Arc<dyn SmsProvider>>,
    simulated: Arc<SimulatedSmsProvider>,
    per_user: Governor<String, DefaultKeyedStateStore<String>, DefaultClock>,
}

impl SmsChannel {
    /// Channel with the given providers, highest priority first.
    pub fn new(
        config: &SmsConfig,
        directory: Arc<dyn ContactDirectory>,
        providers: Vec<Arc<dyn SmsProvider>>,
    ) -> Self {
        let per_minute = NonZeroU32::new(config.per_user_per_minute).unwrap_or(NonZeroU32::MIN);
        info!(
            "Initializing SMS channel with {} providers, {} per user per minute",
            providers.len(),
            per_minute
        );

        Self {
            config: config.clone(),
            directory,
            providers,
            simulated: Arc::new(SimulatedSmsProvider::new()),
            per_user: Governor::keyed(Quota::per_minute(per_minute)),
        }
    }

    /// Twilio first when configured, then the simulated provider.
    pub fn from_config(config: &SmsConfig, directory: Arc<dyn ContactDirectory>) -> Result<Self> {
        let mut providers: Vec<Arc<dyn SmsProvider>> = Vec::new();
        if let Some(ref twilio) = config.twilio {
            providers.push(Arc::new(TwilioSmsProvider::new(
                twilio,
                Duration::from_secs(config.timeout_seconds),
            )?));
        }
        Ok(Self::new(config, directory, providers))
    }

    /// The last-resort provider, exposed so embedders can inspect its outbox
    pub fn simulated(&self) -> Arc<SimulatedSmsProvider> {
        self.simulated.clone()
    }

    /// `subject: body`, cut to the configured length on a character boundary.
    pub fn format_content(&self, notification: &Notification) -> String {
        let content = if notification.subject.is_empty() {
            notification.body.clone()
        } else if notification.body.is_empty() {
            notification.subject.clone()
        } else {
            format!("{}: {}", notification.subject, notification.body)
        };
        truncate(&content, self.config.max_length)
    }

    /// Users currently held by the per-minute limiter
    pub fn tracked_users(&self) -> usize {
        self.per_user.len()
    }

    fn chain(&self) -> impl Iterator<Item = Arc<dyn SmsProvider>> + '_ {
        let simulated: Arc<dyn SmsProvider> = self.simulated.clone();
        self.providers
            .iter()
            .cloned()
            .chain(std::iter::once(simulated))
    }
}

fn truncate(content: &str, max_length: usize) -> String {
    if content.chars().count() <= max_length {
        return content.to_string();
    }
    if max_length <= 3 {
        return content.chars().take(max_length).collect();
    }
    let mut cut: String = content.chars().take(max_length - 3).collect();
    cut.push_str("...");
    cut
}

#[async_trait]
impl ChannelProvider for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    fn name(&self) -> &str {
        self.providers
            .first()
            .map(|p| p.name())
            .unwrap_or("simulated")
    }

    fn is_available(&self) -> bool {
        self.config.enabled
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let phone = self
            .directory
            .user_phone(&notification.user_id)
            .await
            .ok_or_else(|| {
                NotificationError::channel_delivery(
                    "sms",
                    format!("no phone number for user {}", notification.user_id),
                )
            })?;

        if self.per_user.check_key(&notification.user_id).is_err() {
            warn!(
                "SMS per-minute limit reached for user {}",
                notification.user_id
            );
            return Err(NotificationError::channel_delivery(
                "sms",
                format!(
                    "more than {} messages per minute for user {}",
                    self.config.per_user_per_minute, notification.user_id
                ),
            ));
        }

        let content = self.format_content(notification);
        let mut failures = Vec::new();
        for provider in self.chain() {
            match provider.send_sms(&phone, &content).await {
                Ok(()) => {
                    info!(
                        "SMS for notification {} sent via {}",
                        notification.id,
                        provider.name()
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("SMS provider {} failed: {}", provider.name(), e);
                    failures.push(format!("{}: {}", provider.name(), e));
                }
            }
        }

        Err(NotificationError::channel_delivery(
            "sms",
            format!("All SMS providers failed: {}", failures.join("; ")),
        ))
    }

    fn housekeeping(&self) {
        self.per_user.retain_recent();
        self.per_user.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::InMemoryDirectory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenGateway {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SmsProvider for BrokenGateway {
        fn name(&self) -> &str {
            "broken"
        }

        async fn send_sms(&self, _to: &str, _body: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(NotificationError::channel_delivery("sms", "gateway down"))
        }
    }

    fn create_test_config() -> SmsConfig {
        SmsConfig {
            enabled: true,
            max_length: 20,
            per_user_per_minute: 2,
            twilio: None,
            timeout_seconds: 5,
        }
    }

    fn directory() -> Arc<InMemoryDirectory> {
        Arc::new(InMemoryDirectory::new().with_phone("user-1", "+15550001111"))
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly ten", 11), "exactly ten");
        assert_eq!(truncate("héllo wörld, again", 10), "héllo w...");
        assert_eq!(truncate("abcdef", 2), "ab");
    }

    #[tokio::test]
    async fn test_falls_through_to_simulated_provider() {
        let broken = Arc::new(BrokenGateway {
            calls: AtomicUsize::new(0),
        });
        let providers = vec![broken.clone() as Arc<dyn SmsProvider>];
        let channel = SmsChannel::new(&create_test_config(), directory(), providers);

        channel
            .send(&Notification::new("user-1", "Alert", "CPU at 95 percent on db-1"))
            .await
            .unwrap();

        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        let outbox = channel.simulated().outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].to, "+15550001111");
        assert_eq!(outbox[0].body, "Alert: CPU at 95 ...");
        assert_eq!(outbox[0].body.chars().count(), 20);
    }

    #[tokio::test]
    async fn test_per_user_minute_limit() {
        let channel = SmsChannel::new(&create_test_config(), directory(), Vec::new());
        let note = Notification::new("user-1", "s", "b");

        channel.send(&note).await.unwrap();
        channel.send(&note).await.unwrap();
        let err = channel.send(&note).await.unwrap_err();
        assert!(err.to_string().contains("per minute"));
        assert_eq!(channel.simulated().outbox().len(), 2);
    }

    #[tokio::test]
    async fn test_housekeeping_keeps_limited_users() {
        let channel = SmsChannel::new(&create_test_config(), directory(), Vec::new());
        let note = Notification::new("user-1", "s", "b");
        channel.send(&note).await.unwrap();
        channel.send(&note).await.unwrap();
        assert_eq!(channel.tracked_users(), 1);

        // Still inside the minute, so the user's budget must survive.
        channel.housekeeping();
        assert_eq!(channel.tracked_users(), 1);
        assert!(channel.send(&note).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_phone() {
        let channel = SmsChannel::new(&create_test_config(), directory(), Vec::new());
        assert!(channel
            .send(&Notification::new("user-2", "s", "b"))
            .await
            .is_err());
    }

    #[test]
    fn test_twilio_requires_credentials() {
        assert!(TwilioSmsProvider::new(&TwilioConfig::default(), Duration::from_secs(1)).is_err());

        let provider = TwilioSmsProvider::new(
            &TwilioConfig {
                account_sid: "AC123".to_string(),
                auth_token: "secret".to_string(),
                from_phone: "+15550000000".to_string(),
                base_url: "https://api.twilio.com/".to_string(),
            },
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            provider.messages_url(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }
}
