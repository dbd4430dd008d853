//! Shared fixtures for the engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use notification_engine::channels::{
    HttpTransport, InMemoryDirectory, LocalPubSub, MailTransport, SmsProvider,
};
use notification_engine::{
    ChannelKind, Clock, ManualClock, Notification, NotificationConfig, NotificationError,
    NotificationService, Result,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const USER: &str = "user-1";

/// Mail relay that records recipients and fails on demand
#[derive(Default)]
pub struct FakeMailer {
    pub fail: AtomicBool,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl FakeMailer {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, s)| s.clone()).collect()
    }
}

#[async_trait]
impl MailTransport for FakeMailer {
    async fn send_mail(&self, to: &str, subject: &str, _html: &str, _text: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::channel_delivery("email", "relay unreachable"));
        }
        self.sent.lock().push((to.to_string(), subject.to_string()));
        Ok(())
    }

    fn name(&self) -> &str {
        "fake-smtp"
    }
}

/// Chat endpoint that always answers 200
#[derive(Clone, Default)]
pub struct FakeHttp {
    pub posts: Arc<Mutex<Vec<(String, Value)>>>,
}

#[async_trait]
impl HttpTransport for FakeHttp {
    async fn post_json(&self, url: &str, payload: &Value) -> Result<u16> {
        self.posts.lock().push((url.to_string(), payload.clone()));
        Ok(200)
    }
}

#[derive(Default)]
pub struct FakeSms {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SmsProvider for FakeSms {
    fn name(&self) -> &str {
        "fake-sms"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        self.sent.lock().push((to.to_string(), body.to_string()));
        Ok(())
    }
}

pub fn create_test_config() -> NotificationConfig {
    let mut config = NotificationConfig::default();
    config.template.load_builtin = false;

    config.chat.enabled = true;
    config
        .chat
        .rooms
        .insert("general".to_string(), "https://chat.local/hooks/general".to_string());
    config
        .chat
        .rooms
        .insert("alerts".to_string(), "https://chat.local/hooks/alerts".to_string());
    config
        .chat
        .kind_rooms
        .insert("critical".to_string(), "alerts".to_string());

    config.sms.enabled = true;
    config
}

/// Monday 2024-06-03, noon UTC
pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
}

pub struct Harness {
    pub service: NotificationService,
    pub clock: Arc<ManualClock>,
    pub mailer: Arc<FakeMailer>,
    pub hub: Arc<LocalPubSub>,
    pub http: FakeHttp,
    pub sms: Arc<FakeSms>,
    pub directory: Arc<InMemoryDirectory>,
}

impl Harness {
    pub async fn new(config: NotificationConfig, now: DateTime<Utc>) -> Self {
        Self::with_builder(config, now, |b| b).await
    }

    /// Build with extra builder customisation, e.g. a replacement provider.
    pub async fn with_builder<F>(config: NotificationConfig, now: DateTime<Utc>, customise: F) -> Self
    where
        F: FnOnce(
            notification_engine::NotificationServiceBuilder,
        ) -> notification_engine::NotificationServiceBuilder,
    {
        let clock = Arc::new(ManualClock::new(now));
        let mailer = Arc::new(FakeMailer::default());
        let hub = Arc::new(LocalPubSub::new(64));
        let http = FakeHttp::default();
        let sms = Arc::new(FakeSms::default());
        let directory = Arc::new(
            InMemoryDirectory::new()
                .with_email(USER, "ana@example.com")
                .with_phone(USER, "+15550001111"),
        );

        let builder = NotificationService::builder(config)
            .clock(clock.clone())
            .directory(directory.clone())
            .pubsub(hub.clone())
            .mailer(mailer.clone())
            .http(Box::new(http.clone()))
            .sms_providers(vec![sms.clone() as Arc<dyn SmsProvider>]);

        let service = customise(builder).build().await.unwrap();

        Self {
            service,
            clock,
            mailer,
            hub,
            http,
            sms,
            directory,
        }
    }

    /// Opt `user_id` into channels that are off by default (Chat, SMS).
    pub async fn enable_channels(&self, user_id: &str, channels: &[ChannelKind]) {
        let mut prefs = self.service.preferences(user_id).await.unwrap();
        for channel in channels {
            prefs.set_channel(*channel, true);
        }
        self.service.update_preferences(prefs).await.unwrap();
    }

    /// A notification created "now" on the harness clock.
    pub fn note(&self, user_id: &str, channels: &[ChannelKind]) -> Notification {
        Notification::new(user_id, "Build finished", "Pipeline #42 passed")
            .with_channels(channels.iter().copied())
            .with_created_at(self.clock.now())
    }
}
