//! Template management module for the notification engine
//!
//! This module provides named, versioned templates rendered with Handlebars:
//! - Registration with syntax validation
//! - Literal placeholder substitution (no HTML escaping)
//! - Missing variables render as empty strings
//! - A small set of built-in templates

use crate::config::TemplateConfig;
use crate::error::{NotificationError, Result};
use notification_shared::{ChannelKind, Notification, NotificationKind, NotificationTemplate};

use chrono::Utc;
use dashmap::DashMap;
use handlebars::{handlebars_helper, Handlebars, Template};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{info, warn};

handlebars_helper!(uppercase: |value: str| value.to_uppercase());

handlebars_helper!(date: |value: str, format: str| {
    match chrono::DateTime::parse_from_rfc3339(value) {
        Ok(datetime) => {
            use std::fmt::Write as _;
            let mut out = String::new();
            if write!(out, "{}", datetime.format(format)).is_ok() {
                out
            } else {
                value.to_string()
            }
        }
        Err(_) => value.to_string(),
    }
});

/// Registry of notification templates
pub struct TemplateRegistry {
    handlebars: RwLock<Handlebars<'static>>,
    templates: DashMap<String, NotificationTemplate>,
}

impl TemplateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        // Configure Handlebars
        handlebars.set_strict_mode(false);
        handlebars.register_escape_fn(handlebars::no_escape);

        // Register built-in helpers
        handlebars.register_helper("uppercase", Box::new(uppercase));
        handlebars.register_helper("date", Box::new(date));

        Self {
            handlebars: RwLock::new(handlebars),
            templates: DashMap::new(),
        }
    }

    /// Create a registry according to configuration
    pub fn from_config(config: &TemplateConfig) -> Result<Self> {
        let registry = Self::new();
        if config.load_builtin {
            registry.load_builtin_templates()?;
        }
        Ok(registry)
    }

    /// Register or replace a template, returning the stored version.
    pub fn register(&self, template: NotificationTemplate) -> Result<NotificationTemplate> {
        if template.name.trim().is_empty() {
            return Err(NotificationError::validation("name", "cannot be empty"));
        }

        let (subject, body) = Self::compile(&template.subject, &template.body)?;

        // Registrations are serialized on the handlebars lock so versions stay gapless.
        let mut handlebars = self.handlebars.write();

        let now = Utc::now();
        let mut stored = template;
        match self.templates.get(&stored.name) {
            Some(existing) => {
                stored.version = existing.version + 1;
                stored.created_at = existing.created_at;
            }
            None => {
                stored.version = 1;
                stored.created_at = now;
            }
        }
        stored.updated_at = now;

        handlebars.register_template(&subject_key(&stored.name), subject);
        handlebars.register_template(&body_key(&stored.name), body);
        self.templates.insert(stored.name.clone(), stored.clone());
        drop(handlebars);

        info!(
            "Registered template {} (version {})",
            stored.name, stored.version
        );
        Ok(stored)
    }

    pub fn get(&self, name: &str) -> Option<NotificationTemplate> {
        self.templates.get(name).map(|t| t.clone())
    }

    /// All templates, ordered by name
    pub fn list(&self) -> Vec<NotificationTemplate> {
        let mut templates: Vec<_> = self.templates.iter().map(|t| t.clone()).collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut handlebars = self.handlebars.write();
        let removed = self.templates.remove(name).is_some();
        if removed {
            handlebars.unregister_template(&subject_key(name));
            handlebars.unregister_template(&body_key(name));
            info!("Removed template {}", name);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Render a template's subject and body.
    pub fn render_parts(
        &self,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<(String, String)> {
        let handlebars = self.handlebars.read();
        if !self.templates.contains_key(name) {
            return Err(NotificationError::template_not_found(name));
        }
        Self::render_with(&handlebars, name, variables)
    }

    /// Render a template into a pending notification.
    ///
    /// The result has no recipient yet; callers set `user_id` before sending.
    /// Its channel set is the template's preferred channel.
    pub fn render(&self, name: &str, variables: &HashMap<String, String>) -> Result<Notification> {
        // Metadata and compiled text only change together under the write lock.
        let handlebars = self.handlebars.read();
        let template = self
            .get(name)
            .ok_or_else(|| NotificationError::template_not_found(name))?;
        let (subject, body) = Self::render_with(&handlebars, name, variables)?;
        drop(handlebars);

        let mut notification = Notification::new("", subject, body)
            .with_kind(template.kind)
            .with_channel(template.preferred_channel)
            .with_template(name);
        notification.variables = variables.clone();
        Ok(notification)
    }

    fn render_with(
        handlebars: &Handlebars<'static>,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<(String, String)> {
        let subject = handlebars
            .render(&subject_key(name), variables)
            .map_err(|e| NotificationError::template_render(format!("subject of {}: {}", name, e)))?;
        let body = handlebars
            .render(&body_key(name), variables)
            .map_err(|e| NotificationError::template_render(format!("body of {}: {}", name, e)))?;
        Ok((subject, body))
    }

    fn compile(subject: &str, body: &str) -> Result<(Template, Template)> {
        let subject = Template::compile(subject).map_err(|e| {
            NotificationError::template_render(format!("Subject template syntax error: {}", e))
        })?;
        let body = Template::compile(body).map_err(|e| {
            NotificationError::template_render(format!("Body template syntax error: {}", e))
        })?;
        Ok((subject, body))
    }

    fn load_builtin_templates(&self) -> Result<()> {
        info!("Loading built-in notification templates");

        let builtin = [
            (
                "welcome",
                "Hi {{name}}",
                "Welcome aboard, {{name}}! Your account is ready.",
                ChannelKind::Email,
                NotificationKind::Success,
                &["name"][..],
            ),
            (
                "password_reset",
                "Reset your password",
                "Use code {{code}} to reset your password. It expires in {{minutes}} minutes.",
                ChannelKind::Email,
                NotificationKind::Warning,
                &["code", "minutes"][..],
            ),
            (
                "system_alert",
                "System Alert: {{alert_title}}",
                "{{alert_message}}",
                ChannelKind::WebSocket,
                NotificationKind::Critical,
                &["alert_title", "alert_message"][..],
            ),
        ];

        for (name, subject, body, channel, kind, variables) in builtin {
            let template = NotificationTemplate::new(name, subject, body, channel)
                .with_kind(kind)
                .with_variables(variables.iter().copied())
                .with_description(format!("Built-in {} template", name));

            if let Err(e) = self.register(template) {
                warn!("Failed to register built-in template {}: {}", name, e);
                return Err(e);
            }
        }

        Ok(())
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn subject_key(name: &str) -> String {
    format!("subject_{}", name)
}

fn body_key(name: &str) -> String {
    format!("body_{}", name)
}
