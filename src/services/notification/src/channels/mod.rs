//! Notification channels module
//!
//! This module contains the delivery channels and the registry that runs them:
//! - WebSocket channel (pub-sub topics)
//! - Email channel (SMTP, primary and fallback relay)
//! - Chat channel (incoming-webhook rooms)
//! - SMS channel (provider chain with a simulated last resort)
//!
//! Every attempt runs in its own task under the provider's timeout, so a slow
//! or panicking channel only ever fails itself.

use crate::clock::Clock;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use notification_shared::{ChannelAttempt, ChannelKind, Notification};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod chat;
pub mod directory;
pub mod email;
pub mod sms;
pub mod websocket;

pub use chat::{ChatChannel, HttpTransport, ReqwestTransport};
pub use directory::{ContactDirectory, InMemoryDirectory};
pub use email::{EmailChannel, MailTransport, SmtpMailer};
pub use sms::{SentSms, SimulatedSmsProvider, SmsChannel, SmsProvider, TwilioSmsProvider};
pub use websocket::{LocalPubSub, PubSubTransport, RedisPubSub, WebSocketChannel};

/// Trait that all notification channels must implement
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Human-readable provider name used in logs
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Upper bound for a single attempt
    fn timeout(&self) -> Duration;

    /// Attempt delivery once; an `Err` is a failed attempt.
    async fn send(&self, notification: &Notification) -> Result<()>;

    /// Drop per-user state that no longer affects delivery.
    fn housekeeping(&self) {}
}

/// Fixed map from channel tag to provider
pub struct ChannelRegistry {
    providers: BTreeMap<ChannelKind, Arc<dyn ChannelProvider>>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl ChannelRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            providers: BTreeMap::new(),
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    /// Install a provider under its own tag, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn ChannelProvider>) {
        let kind = provider.kind();
        info!("Registering {} channel provider: {}", kind, provider.name());
        if self.providers.insert(kind, provider).is_some() {
            warn!("Replaced existing {} channel provider", kind);
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn ChannelProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn is_available(&self, kind: ChannelKind) -> bool {
        self.providers
            .get(&kind)
            .map(|p| p.is_available())
            .unwrap_or(false)
    }

    pub fn kinds(&self) -> Vec<ChannelKind> {
        self.providers.keys().copied().collect()
    }

    /// Availability of every known channel tag
    pub fn availability(&self) -> BTreeMap<ChannelKind, bool> {
        ChannelKind::ALL
            .iter()
            .map(|kind| (*kind, self.is_available(*kind)))
            .collect()
    }

    pub fn housekeeping(&self) {
        for provider in self.providers.values() {
            provider.housekeeping();
        }
    }

    /// Token cancelled on engine shutdown; in-flight attempts fail fast.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run one delivery attempt on its own task.
    ///
    /// Never returns an error: missing providers, provider errors, timeouts
    /// and panics are all folded into a failed [`ChannelAttempt`].
    pub async fn attempt(
        &self,
        kind: ChannelKind,
        notification: Arc<Notification>,
        fallback: bool,
    ) -> ChannelAttempt {
        self.attempt_until(kind, notification, fallback, self.shutdown.child_token())
            .await
    }

    /// Like [`attempt`](Self::attempt), but also fails the attempt as timed
    /// out once `deadline` is cancelled. `deadline` should be a child of
    /// [`shutdown_token`](Self::shutdown_token) so shutdown still reaches it.
    pub async fn attempt_until(
        &self,
        kind: ChannelKind,
        notification: Arc<Notification>,
        fallback: bool,
        deadline: CancellationToken,
    ) -> ChannelAttempt {
        let attempted_at = self.clock.now();
        let started = Instant::now();

        let outcome = match self.get(kind) {
            Some(provider) => {
                self.spawn_attempt(provider, notification.clone(), deadline)
                    .await
            }
            None => Err(NotificationError::channel_delivery(
                kind.as_str(),
                "no provider registered",
            )),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                info!(
                    "Delivered notification {} via {} in {}ms",
                    notification.id, kind, duration_ms
                );
                ChannelAttempt {
                    channel: kind,
                    success: true,
                    error: None,
                    fallback,
                    attempted_at,
                    duration_ms,
                }
            }
            Err(e) => {
                error!(
                    "Failed to deliver notification {} via {}: {}",
                    notification.id, kind, e
                );
                ChannelAttempt {
                    channel: kind,
                    success: false,
                    error: Some(e.to_string()),
                    fallback,
                    attempted_at,
                    duration_ms,
                }
            }
        }
    }

    async fn spawn_attempt(
        &self,
        provider: Arc<dyn ChannelProvider>,
        notification: Arc<Notification>,
        token: CancellationToken,
    ) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let limit = provider.timeout();
        let name = provider.kind().as_str();

        let handle = tokio::spawn(async move {
            tokio::select! {
                // A send that already finished wins over a late cancellation.
                biased;
                result = tokio::time::timeout(limit, provider.send(&notification)) => match result {
                    Ok(sent) => sent,
                    Err(_) => Err(NotificationError::timeout(format!(
                        "{} delivery after {}ms",
                        provider.kind(),
                        limit.as_millis()
                    ))),
                },
                _ = token.cancelled() => {
                    if shutdown.is_cancelled() {
                        Err(NotificationError::internal("engine is shutting down"))
                    } else {
                        Err(NotificationError::timeout(format!(
                            "{} delivery past the dispatch deadline",
                            provider.kind()
                        )))
                    }
                }
            }
        });

        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(NotificationError::channel_delivery(
                name,
                "provider panicked",
            )),
            Err(e) => Err(NotificationError::internal(format!(
                "{} attempt was aborted: {}",
                name, e
            ))),
        }
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("providers", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubChannel {
        kind: ChannelKind,
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Hang,
        Panic,
    }

    impl StubChannel {
        fn new(kind: ChannelKind, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                kind,
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChannelProvider for StubChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        fn name(&self) -> &str {
            "stub"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        async fn send(&self, _notification: &Notification) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(NotificationError::channel_delivery("stub", "boom")),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                Behaviour::Panic => panic!("stub channel panicked"),
            }
        }
    }

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(Arc::new(SystemClock))
    }

    fn note() -> Arc<Notification> {
        Arc::new(Notification::new("user-1", "Subject", "Body"))
    }

    #[tokio::test]
    async fn test_successful_attempt() {
        let stub = StubChannel::new(ChannelKind::Email, Behaviour::Succeed);
        let registry = registry().with_provider(stub.clone());

        let attempt = registry.attempt(ChannelKind::Email, note(), false).await;
        assert!(attempt.success);
        assert!(attempt.error.is_none());
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_captured() {
        let registry = registry().with_provider(StubChannel::new(ChannelKind::Chat, Behaviour::Fail));

        let attempt = registry.attempt(ChannelKind::Chat, note(), false).await;
        assert!(!attempt.success);
        assert!(attempt.error.unwrap().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_failed_attempt() {
        let registry = registry().with_provider(StubChannel::new(ChannelKind::Sms, Behaviour::Hang));

        let attempt = registry.attempt(ChannelKind::Sms, note(), false).await;
        assert!(!attempt.success);
        assert!(attempt.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panic_is_a_failed_attempt() {
        let registry =
            registry().with_provider(StubChannel::new(ChannelKind::WebSocket, Behaviour::Panic));

        let attempt = registry.attempt(ChannelKind::WebSocket, note(), true).await;
        assert!(!attempt.success);
        assert!(attempt.fallback);
    }

    #[tokio::test]
    async fn test_missing_provider() {
        let registry = registry();
        assert!(!registry.is_available(ChannelKind::Email));

        let attempt = registry.attempt(ChannelKind::Email, note(), false).await;
        assert!(!attempt.success);
        assert_eq!(registry.availability().len(), ChannelKind::ALL.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_in_flight_attempts() {
        let registry = registry().with_provider(StubChannel::new(ChannelKind::Sms, Behaviour::Hang));
        registry.shutdown();

        let attempt = registry.attempt(ChannelKind::Sms, note(), false).await;
        assert!(!attempt.success);
        assert!(attempt.error.unwrap().contains("shutting down"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_only_its_own_attempts() {
        let registry = registry().with_provider(StubChannel::new(ChannelKind::Sms, Behaviour::Hang));
        let deadline = registry.shutdown_token().child_token();
        deadline.cancel();

        let cancelled = registry
            .attempt_until(ChannelKind::Sms, note(), false, deadline)
            .await;
        assert!(!cancelled.success);
        assert!(cancelled.error.unwrap().contains("dispatch deadline"));
        assert!(!registry.shutdown_token().is_cancelled());
    }
}
