//! Metrics collection module for the notification engine
//!
//! This module keeps monotonic in-process counters for:
//! - Notification outcomes (sent, failed, scheduled, cancelled)
//! - Channel-level attempt success and failure
//! - Notification kinds
//! - Rejections (validation, rate limit, no channel)
//!
//! Every increment is mirrored to an optional [`MetricsSink`], such as the
//! Prometheus exporter below.

use crate::config::MetricsConfig;
use crate::error::{NotificationError, Result};
use notification_shared::{ChannelKind, NotificationKind, NotificationStatus};

use dashmap::DashMap;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub const RATE_LIMITED: &str = "rate_limited";
pub const VALIDATION_FAILED: &str = "validation_failed";
pub const NO_AVAILABLE_CHANNEL: &str = "no_available_channel";
pub const FALLBACK_ATTEMPTED: &str = "fallback.attempted";

/// External counter sink.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, counter: &str);
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn get(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    pub fn channel_success(&self, channel: ChannelKind) -> u64 {
        self.get(&channel_counter(channel, true))
    }

    pub fn channel_failure(&self, channel: ChannelKind) -> u64 {
        self.get(&channel_counter(channel, false))
    }

    pub fn kind_total(&self, kind: NotificationKind) -> u64 {
        self.get(&format!("kind.{}.total", kind))
    }

    pub fn total(&self) -> u64 {
        self.get("notifications.total")
    }

    pub fn with_status(&self, status: NotificationStatus) -> u64 {
        self.get(&format!("notifications.{}", status))
    }
}

fn channel_counter(channel: ChannelKind, success: bool) -> String {
    format!(
        "channel.{}.{}",
        channel,
        if success { "success" } else { "failure" }
    )
}

/// Counter registry for the engine
#[derive(Default)]
pub struct MetricsRecorder {
    counters: DashMap<String, u64>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            counters: DashMap::new(),
            sink: Some(sink),
        }
    }

    pub fn incr(&self, counter: &str) {
        *self.counters.entry(counter.to_string()).or_insert(0) += 1;
        if let Some(ref sink) = self.sink {
            sink.incr(counter);
        }
    }

    /// Count one channel attempt.
    pub fn record(&self, kind: NotificationKind, channel: ChannelKind, success: bool) {
        self.incr(&channel_counter(channel, success));
        self.incr(&format!("kind.{}.attempts", kind));
    }

    /// Count the final state of one notification.
    pub fn record_outcome(&self, kind: NotificationKind, status: NotificationStatus) {
        self.incr("notifications.total");
        self.incr(&format!("notifications.{}", status));
        self.incr(&format!("kind.{}.total", kind));
        self.incr(&format!("kind.{}.{}", kind, status));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

/// Prometheus exporter; every engine counter becomes an `event` label value.
#[derive(Clone)]
pub struct PrometheusSink {
    registry: Registry,
    events: IntCounterVec,
}

impl PrometheusSink {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        info!("Initializing notification metrics exporter");

        let registry = Registry::new();
        let events = IntCounterVec::new(
            Opts::new(
                "events_total",
                "Notification engine events by counter name",
            )
            .namespace(config.namespace.clone()),
            &["event"],
        )
        .map_err(|e| {
            NotificationError::internal(format!("Failed to create events counter: {}", e))
        })?;

        registry.register(Box::new(events.clone())).map_err(|e| {
            NotificationError::internal(format!("Failed to register events counter: {}", e))
        })?;

        Ok(Self { registry, events })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| NotificationError::internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| NotificationError::internal(format!("Metrics are not UTF-8: {}", e)))
    }
}

impl MetricsSink for PrometheusSink {
    fn incr(&self, counter: &str) {
        self.events.with_label_values(&[counter]).inc();
    }
}
