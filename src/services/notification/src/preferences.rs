//! Per-user preference storage
//!
//! Unknown users get system defaults on first lookup. Entries are sharded
//! by user id so concurrent sends for different users never contend.

use crate::error::{NotificationError, Result};
use crate::quiet_hours::QuietWindow;
use async_trait::async_trait;
use chrono_tz::Tz;
use dashmap::DashMap;
use notification_shared::NotificationPreferences;
use tracing::debug;

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Fetch a user's preferences, creating defaults for unknown users.
    async fn get_or_default(&self, user_id: &str) -> Result<NotificationPreferences>;

    async fn upsert(&self, preferences: NotificationPreferences) -> Result<()>;
}

/// Reject preferences the engine could not act on.
pub fn validate_preferences(preferences: &NotificationPreferences) -> Result<()> {
    if preferences.user_id.trim().is_empty() {
        return Err(NotificationError::validation("user_id", "cannot be empty"));
    }
    if preferences.frequency_limit == 0 {
        return Err(NotificationError::validation(
            "frequency_limit",
            "must be greater than 0",
        ));
    }
    if let Some(ref tz) = preferences.timezone {
        tz.parse::<Tz>().map_err(|_| {
            NotificationError::validation("timezone", format!("unknown timezone '{}'", tz))
        })?;
    }
    if let Some(ref hours) = preferences.quiet_hours {
        QuietWindow::parse(hours)?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct MemoryPreferenceStore {
    entries: DashMap<String, NotificationPreferences>,
    default_frequency_limit: u32,
}

impl MemoryPreferenceStore {
    pub fn new(default_frequency_limit: u32) -> Self {
        Self {
            entries: DashMap::new(),
            default_frequency_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn get_or_default(&self, user_id: &str) -> Result<NotificationPreferences> {
        let entry = self.entries.entry(user_id.to_string()).or_insert_with(|| {
            debug!("Creating default preferences for user {}", user_id);
            NotificationPreferences::defaults_for(user_id, self.default_frequency_limit)
        });
        Ok(entry.clone())
    }

    async fn upsert(&self, preferences: NotificationPreferences) -> Result<()> {
        validate_preferences(&preferences)?;
        self.entries
            .insert(preferences.user_id.clone(), preferences);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notification_shared::{ChannelKind, QuietHours};

    #[tokio::test]
    async fn test_unknown_user_gets_defaults() {
        let store = MemoryPreferenceStore::new(25);
        assert!(store.is_empty());

        let prefs = store.get_or_default("user-1").await.unwrap();
        assert_eq!(prefs.user_id, "user-1");
        assert_eq!(prefs.frequency_limit, 25);
        assert!(prefs.channel_enabled(ChannelKind::Email));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let store = MemoryPreferenceStore::new(10);
        let mut prefs = NotificationPreferences::defaults_for("user-1", 3);
        prefs.set_channel(ChannelKind::Sms, true);
        store.upsert(prefs.clone()).await.unwrap();

        assert_eq!(store.get_or_default("user-1").await.unwrap(), prefs);
    }

    #[tokio::test]
    async fn test_upsert_validates() {
        let store = MemoryPreferenceStore::new(10);

        let zero = NotificationPreferences::defaults_for("user-1", 0);
        assert!(store.upsert(zero).await.is_err());

        let mut bad_window = NotificationPreferences::defaults_for("user-1", 10);
        bad_window.quiet_hours = Some(QuietHours::new("late", "08:00"));
        assert!(store.upsert(bad_window).await.is_err());

        let mut bad_tz = NotificationPreferences::defaults_for("user-1", 10);
        bad_tz.timezone = Some("Atlantis/Capital".to_string());
        assert!(store.upsert(bad_tz).await.is_err());

        assert!(store.is_empty());
    }
}
