//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted monitor configuration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub id: i64,
    pub group_id: i64,
    pub name: String,
    pub url: String,
    pub interval_secs: i64,
    pub active: bool,
    pub confirmation_threshold: u32,
    pub cooldown_minutes: i64,
    pub flap_detection_enabled: bool,
    pub flap_window_checks: usize,
    pub flap_threshold_percent: f64,
    pub created_at: DateTime<Utc>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            id: 0,
            group_id: 0,
            name: String::new(),
            url: String::new(),
            interval_secs: 60,
            active: true,
            confirmation_threshold: 1,
            cooldown_minutes: 0,
            flap_detection_enabled: false,
            flap_window_checks: 20,
            flap_threshold_percent: 50.0,
            created_at: Utc::now(),
        }
    }
}

/// A single persisted probe check.
#[derive(Debug, Clone)]
pub struct CheckRow {
    pub monitor_id: i64,
    pub time: DateTime<Utc>,
    pub is_up: bool,
    pub latency_ms: f64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub is_degraded: bool,
}

/// An open/close interval record of a confirmed down or degraded period.
#[derive(Debug, Clone, Serialize)]
pub struct Outage {
    pub id: i64,
    pub monitor_id: i64,
    pub kind: String,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// An append-only log entry for a state transition.
#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub id: i64,
    pub monitor_id: i64,
    pub kind: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// A persisted incident; maintenance windows are incidents of type
/// "maintenance" whose status is not completed/resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub title: String,
    pub incident_type: String,
    pub status: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub group_ids: Vec<i64>,
}

impl Default for Incident {
    fn default() -> Self {
        Self {
            id: 0,
            title: String::new(),
            incident_type: "incident".to_string(),
            status: "open".to_string(),
            starts_at: Utc::now(),
            ends_at: None,
            group_ids: Vec::new(),
        }
    }
}

/// Snapshot of one maintenance entry, consulted per result to suppress
/// notifications.
#[derive(Debug, Clone)]
pub struct MaintenanceWindow {
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub group_ids: Vec<i64>,
}

impl MaintenanceWindow {
    /// Whether this window is active for the given group at `now`.
    ///
    /// An empty group list means the window covers every group. An absent
    /// end time means the window is open-ended.
    pub fn is_active_for(&self, group_id: i64, now: DateTime<Utc>) -> bool {
        if now < self.starts_at {
            return false;
        }
        if let Some(end) = self.ends_at {
            if now >= end {
                return false;
            }
        }
        self.group_ids.is_empty() || self.group_ids.contains(&group_id)
    }
}
