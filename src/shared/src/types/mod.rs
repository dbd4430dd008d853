//! Shared type definitions for the notification engine
//!
//! These types are the contract between the delivery engine and whatever
//! embeds it (API layer, schedulers, exporters). Everything here is plain
//! serde data; behaviour lives in the engine crate.

pub mod notification;
pub mod preferences;
pub mod template;

pub use notification::{
    ChannelAttempt, ChannelKind, HistoryEntry, Notification, NotificationKind,
    NotificationPriority, NotificationStatus, ParseChannelError,
};
pub use preferences::{NotificationPreferences, QuietHours};
pub use template::NotificationTemplate;
