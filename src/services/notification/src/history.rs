//! Bounded delivery history

use chrono::{DateTime, Utc};
use notification_shared::{ChannelAttempt, HistoryEntry, Notification};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// FIFO ring of completed notifications.
///
/// The lock is only held for O(1) pushes and short scans, never across an
/// await point.
#[derive(Debug)]
pub struct HistoryStore {
    capacity: usize,
    inner: Mutex<Ring>,
}

#[derive(Debug, Default)]
struct Ring {
    entries: VecDeque<HistoryEntry>,
    next_sequence: u64,
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                next_sequence: 0,
            }),
        }
    }

    /// Append a terminal notification, evicting the oldest entry when full.
    pub fn append(
        &self,
        notification: Notification,
        attempts: Vec<ChannelAttempt>,
        recorded_at: DateTime<Utc>,
    ) -> u64 {
        let mut ring = self.inner.lock();
        let sequence = ring.next_sequence;
        ring.next_sequence += 1;

        while ring.entries.len() >= self.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(HistoryEntry {
            sequence,
            notification,
            attempts,
            recorded_at,
        });
        sequence
    }

    /// Up to `limit` most recent entries for `user_id`, oldest first.
    pub fn query(&self, user_id: &str, limit: usize) -> Vec<HistoryEntry> {
        if limit == 0 {
            return Vec::new();
        }
        let ring = self.inner.lock();
        let mut recent: Vec<HistoryEntry> = ring
            .entries
            .iter()
            .rev()
            .filter(|e| e.notification.user_id == user_id)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    /// Most recent entry for a notification id.
    pub fn get(&self, notification_id: &str) -> Option<HistoryEntry> {
        let ring = self.inner.lock();
        ring.entries
            .iter()
            .rev()
            .find(|e| e.notification.id == notification_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
