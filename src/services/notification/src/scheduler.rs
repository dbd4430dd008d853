//! Notification scheduler module
//!
//! This module holds notifications deferred by quiet hours and runs the
//! background tick that hands due entries back to the manager:
//! - In-memory scheduled store keyed by notification id
//! - Atomic claim of due entries so a notification is re-dispatched once
//! - Interval task stopped through a cancellation token

use crate::error::{NotificationError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notification_shared::{Notification, NotificationStatus};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deferred notifications waiting for their `scheduled_at`
#[derive(Debug, Default)]
pub struct ScheduledStore {
    entries: DashMap<String, Notification>,
}

impl ScheduledStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a notification; it must be in `Scheduled` state with a due time.
    pub fn insert(&self, notification: Notification) -> Result<()> {
        let scheduled_at = notification.scheduled_at.ok_or_else(|| {
            NotificationError::validation("scheduled_at", "Required for scheduled notifications")
        })?;
        if notification.status != NotificationStatus::Scheduled {
            return Err(NotificationError::validation(
                "status",
                format!("expected scheduled, got {}", notification.status),
            ));
        }

        info!(
            "Notification scheduled for delivery at {}: {}",
            scheduled_at, notification.id
        );
        if self
            .entries
            .insert(notification.id.clone(), notification)
            .is_some()
        {
            warn!("Replaced an already scheduled notification");
        }
        Ok(())
    }

    pub fn get(&self, notification_id: &str) -> Option<Notification> {
        self.entries.get(notification_id).map(|n| n.clone())
    }

    pub fn remove(&self, notification_id: &str) -> Option<Notification> {
        self.entries.remove(notification_id).map(|(_, n)| n)
    }

    /// Remove and return every entry due at `now`, earliest first.
    ///
    /// Concurrent callers never receive the same notification.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Notification> {
        let due_ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.scheduled_at.map(|at| at <= now).unwrap_or(true))
            .map(|e| e.key().clone())
            .collect();

        let mut due: Vec<Notification> = due_ids
            .iter()
            .filter_map(|id| self.remove(id))
            .collect();
        due.sort_by_key(|n| n.scheduled_at);
        due
    }

    /// Scheduled notifications for one user, earliest first
    pub fn for_user(&self, user_id: &str) -> Vec<Notification> {
        let mut pending: Vec<Notification> = self
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        pending.sort_by_key(|n| n.scheduled_at);
        pending
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> serde_json::Value {
        let ready = self
            .entries
            .iter()
            .filter(|e| e.scheduled_at.map(|at| at <= now).unwrap_or(true))
            .count();

        json!({
            "total_scheduled": self.entries.len(),
            "pending": self.entries.len().saturating_sub(ready),
            "ready_for_delivery": ready,
        })
    }
}

/// Background interval task
#[derive(Debug)]
pub struct SchedulerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Run `tick` every `period` until `token` is cancelled.
    pub fn spawn<F, Fut>(period: Duration, token: CancellationToken, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Notification scheduler started ({}ms tick)", period.as_millis());

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        info!("Notification scheduler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        debug!("Scheduler tick");
                        tick().await;
                    }
                }
            }
        });

        Self { token, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the loop and wait for the current tick to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn scheduled(user: &str, at: DateTime<Utc>) -> Notification {
        let mut n = Notification::new(user, "s", "b");
        n.status = NotificationStatus::Scheduled;
        n.scheduled_at = Some(at);
        n
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_insert_requires_schedule() {
        let store = ScheduledStore::new();
        assert!(store.insert(Notification::new("u", "s", "b")).is_err());

        let mut pending = Notification::new("u", "s", "b");
        pending.scheduled_at = Some(at(8));
        assert!(store.insert(pending).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_take_due_claims_in_order() {
        let store = ScheduledStore::new();
        let late = scheduled("u", at(9));
        let early = scheduled("u", at(8));
        let future = scheduled("u", at(20));
        let (late_id, early_id) = (late.id.clone(), early.id.clone());
        store.insert(late).unwrap();
        store.insert(early).unwrap();
        store.insert(future).unwrap();

        let due: Vec<_> = store.take_due(at(10)).into_iter().map(|n| n.id).collect();
        assert_eq!(due, vec![early_id, late_id]);
        assert_eq!(store.len(), 1);
        assert!(store.take_due(at(10)).is_empty());
    }

    #[test]
    fn test_remove_and_stats() {
        let store = ScheduledStore::new();
        let n = scheduled("u", at(8));
        let id = n.id.clone();
        store.insert(n).unwrap();
        store.insert(scheduled("other", at(12))).unwrap();

        let stats = store.stats(at(9));
        assert_eq!(stats["total_scheduled"], 2);
        assert_eq!(stats["ready_for_delivery"], 1);
        assert_eq!(store.for_user("u").len(), 1);

        assert!(store.remove(&id).is_some());
        assert!(store.get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = SchedulerHandle::spawn(
            Duration::from_secs(10),
            CancellationToken::new(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(handle.is_running());
        handle.stop().await;

        // Immediate first tick plus ticks at 10s and 20s
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
