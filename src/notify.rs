//! Notification event types.
//!
//! Delivery (Slack, webhooks, e-mail) lives behind an mpsc sender; the
//! engine only decides whether an event should be enqueued at all.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The kind of a state-transition or alerting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Down,
    Recovered,
    Degraded,
    DegradedRecovered,
    FlappingStarted,
    FlappingStopped,
    SslExpiry,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Down => "down",
            EventKind::Recovered => "recovered",
            EventKind::Degraded => "degraded",
            EventKind::DegradedRecovered => "degraded_recovered",
            EventKind::FlappingStarted => "flapping_started",
            EventKind::FlappingStopped => "flapping_stopped",
            EventKind::SslExpiry => "ssl_expiry",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification handed to the external notifier.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub monitor_id: i64,
    pub monitor_name: String,
    pub monitor_url: String,
    pub kind: EventKind,
    pub message: String,
    pub time: DateTime<Utc>,
}
