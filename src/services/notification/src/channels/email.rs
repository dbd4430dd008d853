//! Email notification channel implementation using SMTP

use crate::channels::{ChannelProvider, ContactDirectory};
use crate::config::{EmailConfig, SmtpConfig};
use crate::error::{NotificationError, Result};
use crate::templates::TemplateRegistry;
use async_trait::async_trait;
use handlebars::html_escape;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use notification_shared::{ChannelKind, Notification};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outgoing mail relay
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_mail(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        text_body: &str,
    ) -> Result<()>;

    fn name(&self) -> &str;
}

/// SMTP relay backed by a pooled `lettre` transport
#[derive(Clone)]
pub struct SmtpMailer {
    name: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_mailbox: Mailbox,
    reply_to: Option<Mailbox>,
}

impl SmtpMailer {
    pub fn new(smtp: &SmtpConfig, email: &EmailConfig) -> Result<Self> {
        info!("Initializing SMTP relay {}:{}", smtp.host, smtp.port);

        let from_mailbox = format!("{} <{}>", email.from_name, email.from_email)
            .parse::<Mailbox>()
            .map_err(|e| NotificationError::config(format!("Invalid from email address: {}", e)))?;

        let reply_to = email
            .reply_to
            .as_deref()
            .map(|addr| {
                addr.parse::<Mailbox>().map_err(|e| {
                    NotificationError::config(format!("Invalid reply-to email: {}", e))
                })
            })
            .transpose()?;

        let mut transport_builder = if smtp.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host).map_err(|e| {
                NotificationError::config(format!("Failed to create SMTP relay: {}", e))
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
        };

        transport_builder = transport_builder.port(smtp.port);

        if !smtp.username.is_empty() && !smtp.password.is_empty() {
            let creds = Credentials::new(smtp.username.clone(), smtp.password.clone());
            transport_builder = transport_builder.credentials(creds);
        }

        transport_builder =
            transport_builder.pool_config(PoolConfig::new().max_size(smtp.pool_size.max(1)));
        transport_builder =
            transport_builder.timeout(Some(Duration::from_secs(email.timeout_seconds)));

        Ok(Self {
            name: format!("smtp://{}:{}", smtp.host, smtp.port),
            transport: transport_builder.build(),
            from_mailbox,
            reply_to,
        })
    }

    fn build_message(&self, to: &str, subject: &str, html: &str, text: &str) -> Result<Message> {
        let to_mailbox = to.parse::<Mailbox>()?;

        let mut message_builder = Message::builder()
            .from(self.from_mailbox.clone())
            .to(to_mailbox)
            .subject(subject);

        if let Some(ref reply_to) = self.reply_to {
            message_builder = message_builder.reply_to(reply_to.clone());
        }

        let message = message_builder
            .multipart(MultiPart::alternative_plain_html(
                text.to_string(),
                html.to_string(),
            ))?;
        Ok(message)
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send_mail(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        text_body: &str,
    ) -> Result<()> {
        let message = self.build_message(to, subject, html_body, text_body)?;
        self.transport.send(message).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Email channel for sending notifications via SMTP
#[derive(Clone)]
pub struct EmailChannel {
    enabled: bool,
    timeout: Duration,
    directory: Arc<dyn ContactDirectory>,
    templates: Arc<TemplateRegistry>,
    primary: Arc<dyn MailTransport>,
    fallback: Option<Arc<dyn MailTransport>>,
}

impl EmailChannel {
    pub fn new(
        config: &EmailConfig,
        directory: Arc<dyn ContactDirectory>,
        templates: Arc<TemplateRegistry>,
        primary: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            timeout: Duration::from_secs(config.timeout_seconds),
            directory,
            templates,
            primary,
            fallback: None,
        }
    }

    /// Build SMTP relays for the primary and optional fallback settings.
    pub fn from_config(
        config: &EmailConfig,
        directory: Arc<dyn ContactDirectory>,
        templates: Arc<TemplateRegistry>,
    ) -> Result<Self> {
        let primary = Arc::new(SmtpMailer::new(&config.primary, config)?);
        let mut channel = Self::new(config, directory, templates, primary);
        if let Some(ref smtp) = config.fallback {
            channel = channel.with_fallback(Arc::new(SmtpMailer::new(smtp, config)?));
        }
        info!("Email channel initialized successfully");
        Ok(channel)
    }

    /// Secondary relay tried when the primary one fails
    pub fn with_fallback(mut self, fallback: Arc<dyn MailTransport>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Subject and plain-text body, rendered from the template when one is named.
    fn content(&self, notification: &Notification) -> (String, String) {
        if let Some(ref name) = notification.template_name {
            match self.templates.render_parts(name, &notification.variables) {
                Ok(parts) => return parts,
                Err(e) => warn!(
                    "Using raw content for notification {}: {}",
                    notification.id, e
                ),
            }
        }
        (notification.subject.clone(), notification.body.clone())
    }
}

fn html_body(subject: &str, text: &str) -> String {
    format!(
        "<html><body><h2>{}</h2><p>{}</p></body></html>",
        html_escape(subject),
        html_escape(text).replace('\n', "<br>")
    )
}

#[async_trait]
impl ChannelProvider for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn name(&self) -> &str {
        self.primary.name()
    }

    fn is_available(&self) -> bool {
        self.enabled
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let recipient = self
            .directory
            .user_email(&notification.user_id)
            .await
            .ok_or_else(|| {
                NotificationError::channel_delivery(
                    "email",
                    format!("no email address for user {}", notification.user_id),
                )
            })?;

        let (subject, text) = self.content(notification);
        let html = html_body(&subject, &text);

        let primary_error = match self
            .primary
            .send_mail(&recipient, &subject, &html, &text)
            .await
        {
            Ok(()) => {
                info!(
                    "Email sent successfully: {} to {}",
                    notification.id, recipient
                );
                return Ok(());
            }
            Err(e) => e,
        };

        let Some(ref fallback) = self.fallback else {
            return Err(NotificationError::channel_delivery(
                "email",
                primary_error.to_string(),
            ));
        };

        warn!(
            "Primary relay {} failed for {}: {}; trying {}",
            self.primary.name(),
            notification.id,
            primary_error,
            fallback.name()
        );

        match fallback.send_mail(&recipient, &subject, &html, &text).await {
            Ok(()) => {
                info!(
                    "Email sent via fallback relay: {} to {}",
                    notification.id, recipient
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email {}: {}", notification.id, e);
                Err(NotificationError::channel_delivery(
                    "email",
                    format!("primary: {}; fallback: {}", primary_error, e),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::InMemoryDirectory;
    use crate::config::NotificationConfig;
    use notification_shared::NotificationTemplate;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq)]
    struct Sent {
        to: String,
        subject: String,
        html: String,
        text: String,
    }

    struct RecordingMailer {
        name: &'static str,
        fail: bool,
        sent: Mutex<Vec<Sent>>,
    }

    impl RecordingMailer {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MailTransport for RecordingMailer {
        async fn send_mail(&self, to: &str, subject: &str, html: &str, text: &str) -> Result<()> {
            self.sent.lock().push(Sent {
                to: to.to_string(),
                subject: subject.to_string(),
                html: html.to_string(),
                text: text.to_string(),
            });
            if self.fail {
                Err(NotificationError::channel_delivery("email", "relay refused"))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    fn create_test_config() -> EmailConfig {
        NotificationConfig::default().email
    }

    fn directory() -> Arc<InMemoryDirectory> {
        Arc::new(InMemoryDirectory::new().with_email("user-1", "ana@example.com"))
    }

    #[tokio::test]
    async fn test_sends_raw_content() {
        let mailer = RecordingMailer::new("primary", false);
        let channel = EmailChannel::new(
            &create_test_config(),
            directory(),
            Arc::new(TemplateRegistry::new()),
            mailer.clone(),
        );

        channel
            .send(&Notification::new("user-1", "Report <ready>", "Line 1\nLine 2"))
            .await
            .unwrap();

        let sent = mailer.sent.lock()[0].clone();
        assert_eq!(sent.to, "ana@example.com");
        assert_eq!(sent.subject, "Report <ready>");
        assert_eq!(sent.text, "Line 1\nLine 2");
        assert!(sent.html.contains("Report &lt;ready&gt;"));
        assert!(sent.html.contains("Line 1<br>Line 2"));
    }

    #[tokio::test]
    async fn test_renders_named_template() {
        let templates = Arc::new(TemplateRegistry::new());
        templates
            .register(NotificationTemplate::new(
                "welcome",
                "Hi {{name}}",
                "Welcome, {{name}}",
                ChannelKind::Email,
            ))
            .unwrap();

        let mailer = RecordingMailer::new("primary", false);
        let channel =
            EmailChannel::new(&create_test_config(), directory(), templates, mailer.clone());

        let notification = Notification::new("user-1", "raw", "raw")
            .with_template("welcome")
            .with_variable("name", "Ana");
        channel.send(&notification).await.unwrap();

        let sent = mailer.sent.lock()[0].clone();
        assert_eq!(sent.subject, "Hi Ana");
        assert_eq!(sent.text, "Welcome, Ana");
    }

    #[tokio::test]
    async fn test_unknown_template_falls_back_to_raw_content() {
        let mailer = RecordingMailer::new("primary", false);
        let channel = EmailChannel::new(
            &create_test_config(),
            directory(),
            Arc::new(TemplateRegistry::new()),
            mailer.clone(),
        );

        let notification = Notification::new("user-1", "raw subject", "raw body").with_template("gone");
        channel.send(&notification).await.unwrap();
        assert_eq!(mailer.sent.lock()[0].subject, "raw subject");
    }

    #[tokio::test]
    async fn test_fallback_relay_is_tried() {
        let primary = RecordingMailer::new("primary", true);
        let secondary = RecordingMailer::new("secondary", false);
        let channel = EmailChannel::new(
            &create_test_config(),
            directory(),
            Arc::new(TemplateRegistry::new()),
            primary.clone(),
        )
        .with_fallback(secondary.clone());

        channel
            .send(&Notification::new("user-1", "s", "b"))
            .await
            .unwrap();
        assert_eq!(primary.sent.lock().len(), 1);
        assert_eq!(secondary.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_both_relays_failing() {
        let channel = EmailChannel::new(
            &create_test_config(),
            directory(),
            Arc::new(TemplateRegistry::new()),
            RecordingMailer::new("primary", true),
        )
        .with_fallback(RecordingMailer::new("secondary", true));

        let err = channel
            .send(&Notification::new("user-1", "s", "b"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fallback"));
    }

    #[tokio::test]
    async fn test_unknown_recipient() {
        let mailer = RecordingMailer::new("primary", false);
        let channel = EmailChannel::new(
            &create_test_config(),
            directory(),
            Arc::new(TemplateRegistry::new()),
            mailer.clone(),
        );

        let err = channel
            .send(&Notification::new("user-2", "s", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::ChannelDelivery { .. }));
        assert!(mailer.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_smtp_mailer_builds_from_config() {
        let config = create_test_config();
        let mailer = SmtpMailer::new(&config.primary, &config).unwrap();
        assert_eq!(mailer.name(), "smtp://localhost:587");

        let message = mailer
            .build_message("ana@example.com", "Hi", "<p>Hi</p>", "Hi")
            .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Hi"));
        assert!(raw.contains("multipart/alternative"));
    }
}
