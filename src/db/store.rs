//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Monitors ---

    /// Add a new monitor and return its ID.
    pub fn add_monitor(&self, monitor: &mut MonitorConfig) -> Result<i64, DbError> {
        if monitor.interval_secs <= 0 {
            monitor.interval_secs = 60;
        }
        if monitor.confirmation_threshold == 0 {
            monitor.confirmation_threshold = 1;
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO monitors (group_id, name, url, interval_secs, active, confirmation_threshold, cooldown_minutes, flap_detection_enabled, flap_window_checks, flap_threshold_percent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                monitor.group_id,
                monitor.name,
                monitor.url,
                monitor.interval_secs,
                monitor.active,
                monitor.confirmation_threshold,
                monitor.cooldown_minutes,
                monitor.flap_detection_enabled,
                monitor.flap_window_checks as i64,
                monitor.flap_threshold_percent,
                monitor.created_at.format(TIME_FORMAT).to_string(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        monitor.id = id;
        Ok(id)
    }

    /// Update an existing monitor.
    pub fn update_monitor(&self, monitor: &MonitorConfig) -> Result<(), DbError> {
        let interval_secs = if monitor.interval_secs <= 0 { 60 } else { monitor.interval_secs };
        let threshold = monitor.confirmation_threshold.max(1);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE monitors SET group_id=?1, name=?2, url=?3, interval_secs=?4, active=?5, confirmation_threshold=?6, cooldown_minutes=?7, flap_detection_enabled=?8, flap_window_checks=?9, flap_threshold_percent=?10 WHERE id=?11",
            params![
                monitor.group_id,
                monitor.name,
                monitor.url,
                interval_secs,
                monitor.active,
                threshold,
                monitor.cooldown_minutes,
                monitor.flap_detection_enabled,
                monitor.flap_window_checks as i64,
                monitor.flap_threshold_percent,
                monitor.id,
            ],
        )?;
        Ok(())
    }

    /// List all monitors.
    pub fn list_monitors(&self) -> Result<Vec<MonitorConfig>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, group_id, name, url, interval_secs, active, confirmation_threshold, cooldown_minutes, flap_detection_enabled, flap_window_checks, flap_threshold_percent, created_at FROM monitors"
        )?;

        let monitors = stmt
            .query_map([], |row| {
                let created_str: String = row.get(11)?;
                Ok(MonitorConfig {
                    id: row.get(0)?,
                    group_id: row.get(1)?,
                    name: row.get(2)?,
                    url: row.get(3)?,
                    interval_secs: row.get(4)?,
                    active: row.get(5)?,
                    confirmation_threshold: row.get(6)?,
                    cooldown_minutes: row.get(7)?,
                    flap_detection_enabled: row.get(8)?,
                    flap_window_checks: row.get::<_, i64>(9)? as usize,
                    flap_threshold_percent: row.get(10)?,
                    created_at: parse_db_time(&created_str).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(monitors)
    }

    /// Get a monitor by ID.
    pub fn get_monitor(&self, id: i64) -> Result<MonitorConfig, DbError> {
        self.list_monitors()?
            .into_iter()
            .find(|m| m.id == id)
            .ok_or(DbError::NotFound)
    }

    /// Delete a monitor and everything recorded for it.
    pub fn delete_monitor(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM checks WHERE monitor_id = ?1", params![id])?;
        conn.execute("DELETE FROM outages WHERE monitor_id = ?1", params![id])?;
        conn.execute("DELETE FROM events WHERE monitor_id = ?1", params![id])?;
        conn.execute("DELETE FROM monitors WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Checks ---

    /// Append check rows in batch.
    pub fn batch_append_checks(&self, rows: &[CheckRow]) -> Result<(), DbError> {
        if rows.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO checks (monitor_id, time, is_up, latency_ms, status_code, error, is_degraded)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for r in rows {
                stmt.execute(params![
                    r.monitor_id,
                    r.time.format(TIME_FORMAT).to_string(),
                    r.is_up,
                    r.latency_ms,
                    r.status_code,
                    r.error,
                    r.is_degraded,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Load the most recent checks for a monitor, oldest first.
    pub fn load_recent_checks(&self, monitor_id: i64, limit: usize) -> Result<Vec<CheckRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT monitor_id, time, is_up, latency_ms, status_code, error, is_degraded
             FROM checks WHERE monitor_id = ?1 ORDER BY time DESC, id DESC LIMIT ?2",
        )?;

        let mut rows = stmt
            .query_map(params![monitor_id, limit as i64], |row| {
                let time_str: String = row.get(1)?;
                Ok(CheckRow {
                    monitor_id: row.get(0)?,
                    time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                    is_up: row.get(2)?,
                    latency_ms: row.get(3)?,
                    status_code: row.get(4)?,
                    error: row.get(5)?,
                    is_degraded: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.reverse();
        Ok(rows)
    }

    /// Delete checks older than the given number of days. Returns the number
    /// of rows removed.
    pub fn prune_checks_older_than(&self, days: i64) -> Result<usize, DbError> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM checks WHERE time < ?1",
            params![cutoff.format(TIME_FORMAT).to_string()],
        )?;
        Ok(deleted)
    }

    // --- Outages ---

    /// Open an outage record for a monitor.
    pub fn open_outage(&self, monitor_id: i64, kind: &str, message: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO outages (monitor_id, kind, message, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                monitor_id,
                kind,
                message,
                Utc::now().format(TIME_FORMAT).to_string()
            ],
        )?;
        Ok(())
    }

    /// Close any open outage records for a monitor.
    pub fn close_outage(&self, monitor_id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE outages SET ended_at = ?1 WHERE monitor_id = ?2 AND ended_at IS NULL",
            params![Utc::now().format(TIME_FORMAT).to_string(), monitor_id],
        )?;
        Ok(())
    }

    /// List outages for a monitor, newest first.
    pub fn list_outages(&self, monitor_id: i64) -> Result<Vec<Outage>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, monitor_id, kind, message, started_at, ended_at
             FROM outages WHERE monitor_id = ?1 ORDER BY started_at DESC, id DESC",
        )?;

        let outages = stmt
            .query_map(params![monitor_id], |row| {
                let started_str: String = row.get(4)?;
                let ended_str: Option<String> = row.get(5)?;
                Ok(Outage {
                    id: row.get(0)?,
                    monitor_id: row.get(1)?,
                    kind: row.get(2)?,
                    message: row.get(3)?,
                    started_at: parse_db_time(&started_str).unwrap_or_else(Utc::now),
                    ended_at: ended_str.and_then(|s| parse_db_time(&s)),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(outages)
    }

    // --- Events ---

    /// Append an event record.
    pub fn append_event(&self, monitor_id: i64, kind: &str, message: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (monitor_id, kind, message, time) VALUES (?1, ?2, ?3, ?4)",
            params![
                monitor_id,
                kind,
                message,
                Utc::now().format(TIME_FORMAT).to_string()
            ],
        )?;
        Ok(())
    }

    /// Load the most recent events for a monitor, newest first.
    pub fn recent_events(&self, monitor_id: i64, limit: usize) -> Result<Vec<EventRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, monitor_id, kind, message, time
             FROM events WHERE monitor_id = ?1 ORDER BY time DESC, id DESC LIMIT ?2",
        )?;

        let events = stmt
            .query_map(params![monitor_id, limit as i64], |row| {
                let time_str: String = row.get(4)?;
                Ok(EventRow {
                    id: row.get(0)?,
                    monitor_id: row.get(1)?,
                    kind: row.get(2)?,
                    message: row.get(3)?,
                    time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(events)
    }

    // --- Incidents / maintenance windows ---

    /// Add an incident and return its ID.
    pub fn add_incident(&self, incident: &mut Incident) -> Result<i64, DbError> {
        let group_ids =
            serde_json::to_string(&incident.group_ids).unwrap_or_else(|_| "[]".to_string());

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO incidents (title, incident_type, status, starts_at, ends_at, group_ids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                incident.title,
                incident.incident_type,
                incident.status,
                incident.starts_at.format(TIME_FORMAT).to_string(),
                incident.ends_at.map(|t| t.format(TIME_FORMAT).to_string()),
                group_ids,
            ],
        )?;
        let id = conn.last_insert_rowid();
        incident.id = id;
        Ok(id)
    }

    /// Update an incident's status.
    pub fn set_incident_status(&self, id: i64, status: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE incidents SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    }

    /// List maintenance windows that have not been completed or resolved.
    pub fn list_active_maintenance_windows(&self) -> Result<Vec<MaintenanceWindow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT starts_at, ends_at, group_ids FROM incidents
             WHERE incident_type = 'maintenance' AND status NOT IN ('completed', 'resolved')",
        )?;

        let windows = stmt
            .query_map([], |row| {
                let starts_str: String = row.get(0)?;
                let ends_str: Option<String> = row.get(1)?;
                let group_ids_str: String = row.get(2)?;
                Ok(MaintenanceWindow {
                    starts_at: parse_db_time(&starts_str).unwrap_or_else(Utc::now),
                    ends_at: ends_str.and_then(|s| parse_db_time(&s)),
                    group_ids: serde_json::from_str(&group_ids_str).unwrap_or_default(),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(windows)
    }

    // --- Settings ---

    /// Get a setting value by key.
    pub fn get_setting(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a setting value.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try various formats
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_monitor_crud() {
        let (_tmp, store) = open_store();

        let mut monitor = MonitorConfig {
            name: "Test".to_string(),
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        let id = store.add_monitor(&mut monitor).unwrap();
        assert!(id > 0);

        let fetched = store.get_monitor(id).unwrap();
        assert_eq!(fetched.name, "Test");
        assert!(fetched.active);

        let mut updated = fetched;
        updated.active = false;
        updated.confirmation_threshold = 3;
        store.update_monitor(&updated).unwrap();

        let fetched2 = store.get_monitor(id).unwrap();
        assert!(!fetched2.active);
        assert_eq!(fetched2.confirmation_threshold, 3);

        store.delete_monitor(id).unwrap();
        assert!(store.get_monitor(id).is_err());
    }

    #[test]
    fn test_checks_roundtrip_and_prune() {
        let (_tmp, store) = open_store();

        let now = Utc::now();
        let rows: Vec<CheckRow> = (0..5i64)
            .map(|i| CheckRow {
                monitor_id: 1,
                time: now - ChronoDuration::seconds(10 - i),
                is_up: i % 2 == 0,
                latency_ms: 12.5 + i as f64,
                status_code: Some(200),
                error: None,
                is_degraded: false,
            })
            .collect();
        store.batch_append_checks(&rows).unwrap();

        let loaded = store.load_recent_checks(1, 3).unwrap();
        assert_eq!(loaded.len(), 3);
        // Oldest first, so the last loaded row is the newest written one.
        assert!(loaded[0].time < loaded[2].time);
        assert_eq!(loaded[2].latency_ms, 16.5);

        let old = vec![CheckRow {
            monitor_id: 1,
            time: now - ChronoDuration::days(120),
            is_up: true,
            latency_ms: 5.0,
            status_code: Some(200),
            error: None,
            is_degraded: false,
        }];
        store.batch_append_checks(&old).unwrap();

        let deleted = store.prune_checks_older_than(90).unwrap();
        assert_eq!(deleted, 1);
    }

    #[test]
    fn test_outage_open_close() {
        let (_tmp, store) = open_store();

        store.open_outage(7, "down", "connection refused").unwrap();
        let open = store.list_outages(7).unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].ended_at.is_none());

        store.close_outage(7).unwrap();
        let closed = store.list_outages(7).unwrap();
        assert!(closed[0].ended_at.is_some());
    }

    #[test]
    fn test_maintenance_window_filtering() {
        let (_tmp, store) = open_store();

        let now = Utc::now();
        let mut maintenance = Incident {
            title: "planned work".to_string(),
            incident_type: "maintenance".to_string(),
            status: "scheduled".to_string(),
            starts_at: now,
            ends_at: Some(now + ChronoDuration::hours(1)),
            group_ids: vec![1, 2],
            ..Default::default()
        };
        store.add_incident(&mut maintenance).unwrap();

        let mut outage_incident = Incident {
            title: "unrelated".to_string(),
            incident_type: "incident".to_string(),
            ..Default::default()
        };
        store.add_incident(&mut outage_incident).unwrap();

        let windows = store.list_active_maintenance_windows().unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].group_ids, vec![1, 2]);

        store
            .set_incident_status(maintenance.id, "completed")
            .unwrap();
        assert!(store.list_active_maintenance_windows().unwrap().is_empty());
    }

    #[test]
    fn test_settings() {
        let (_tmp, store) = open_store();

        assert!(store.get_setting("latency_threshold_ms").unwrap().is_none());
        store.set_setting("latency_threshold_ms", "1500").unwrap();
        assert_eq!(
            store.get_setting("latency_threshold_ms").unwrap().as_deref(),
            Some("1500")
        );
        store.set_setting("latency_threshold_ms", "2000").unwrap();
        assert_eq!(
            store.get_setting("latency_threshold_ms").unwrap().as_deref(),
            Some("2000")
        );
    }
}
