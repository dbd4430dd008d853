use super::notification::{ChannelKind, NotificationKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named, versioned subject/body pattern.
///
/// Placeholders use `{{variable}}` syntax. `version` starts at 1 and is bumped
/// by the registry each time the same name is registered again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub subject: String,
    pub body: String,
    /// Declared placeholder names. Informational; undeclared names still render.
    #[serde(default)]
    pub variables: Vec<String>,
    pub preferred_channel: ChannelKind,
    #[serde(default)]
    pub kind: NotificationKind,
    #[serde(default = "initial_version")]
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn initial_version() -> u32 {
    1
}

impl NotificationTemplate {
    pub fn new(
        name: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        preferred_channel: ChannelKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: None,
            subject: subject.into(),
            body: body.into(),
            variables: Vec::new(),
            preferred_channel,
            kind: NotificationKind::default(),
            version: initial_version(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_variables<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables = variables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_kind(mut self, kind: NotificationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
