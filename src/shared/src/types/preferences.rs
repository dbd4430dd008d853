use super::notification::{ChannelKind, NotificationKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-user delivery preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPreferences {
    pub user_id: String,
    /// Channels absent from the map are treated as disabled.
    #[serde(default)]
    pub channels: HashMap<ChannelKind, bool>,
    /// Kinds absent from the map are treated as enabled.
    #[serde(default)]
    pub kinds: HashMap<NotificationKind, bool>,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    /// IANA timezone name the quiet-hours window is expressed in.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Maximum sends per rolling hour.
    pub frequency_limit: u32,
}

/// Daily silent window, `HH:MM` wall-clock values.
///
/// `start > end` means the window spans midnight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuietHours {
    pub start: String,
    pub end: String,
}

impl QuietHours {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

impl NotificationPreferences {
    /// System defaults: WebSocket and Email on, Chat and SMS off, every kind on.
    pub fn defaults_for(user_id: impl Into<String>, frequency_limit: u32) -> Self {
        let channels = HashMap::from([
            (ChannelKind::WebSocket, true),
            (ChannelKind::Email, true),
            (ChannelKind::Chat, false),
            (ChannelKind::Sms, false),
        ]);
        let kinds = NotificationKind::ALL.iter().map(|k| (*k, true)).collect();

        Self {
            user_id: user_id.into(),
            channels,
            kinds,
            quiet_hours: None,
            timezone: None,
            frequency_limit,
        }
    }

    pub fn channel_enabled(&self, channel: ChannelKind) -> bool {
        self.channels.get(&channel).copied().unwrap_or(false)
    }

    pub fn kind_enabled(&self, kind: NotificationKind) -> bool {
        self.kinds.get(&kind).copied().unwrap_or(true)
    }

    pub fn set_channel(&mut self, channel: ChannelKind, enabled: bool) -> &mut Self {
        self.channels.insert(channel, enabled);
        self
    }

    pub fn set_kind(&mut self, kind: NotificationKind, enabled: bool) -> &mut Self {
        self.kinds.insert(kind, enabled);
        self
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = ChannelKind> + '_ {
        ChannelKind::ALL
            .into_iter()
            .filter(move |c| self.channel_enabled(*c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let prefs = NotificationPreferences::defaults_for("user-1", 10);

        assert!(prefs.channel_enabled(ChannelKind::WebSocket));
        assert!(prefs.channel_enabled(ChannelKind::Email));
        assert!(!prefs.channel_enabled(ChannelKind::Chat));
        assert!(!prefs.channel_enabled(ChannelKind::Sms));
        assert!(NotificationKind::ALL.iter().all(|k| prefs.kind_enabled(*k)));
        assert_eq!(prefs.frequency_limit, 10);
        assert!(prefs.quiet_hours.is_none());
    }

    #[test]
    fn test_missing_entries() {
        let mut prefs = NotificationPreferences::defaults_for("user-1", 10);
        prefs.channels.clear();
        prefs.kinds.clear();

        assert!(!prefs.channel_enabled(ChannelKind::Email));
        assert!(prefs.kind_enabled(NotificationKind::Critical));
    }

    #[test]
    fn test_round_trips_through_json() {
        let mut prefs = NotificationPreferences::defaults_for("user-1", 5);
        prefs.set_channel(ChannelKind::Sms, true);
        prefs.quiet_hours = Some(QuietHours::new("22:00", "08:00"));

        let json = serde_json::to_string(&prefs).unwrap();
        let parsed: NotificationPreferences = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, prefs);
    }
}
