//! Per-target state: history, confirmation counters, cooldowns, flap
//! detection.
//!
//! Every mutating method here is called from the result processor only, so
//! fields never see concurrent writers; the inner lock exists for the
//! HTTP-facing read accessors.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::broadcast;

use super::ssl::SslLadder;
use crate::db::CheckRow;
use crate::notify::EventKind;

/// Maximum number of history entries kept per target.
pub const HISTORY_CAP: usize = 50;

/// One recorded probe observation.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint {
    pub time: DateTime<Utc>,
    pub is_up: bool,
    pub latency_ms: f64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub is_degraded: bool,
}

impl From<CheckRow> for HistoryPoint {
    fn from(row: CheckRow) -> Self {
        Self {
            time: row.time,
            is_up: row.is_up,
            latency_ms: row.latency_ms,
            status_code: row.status_code,
            error: row.error,
            is_degraded: row.is_degraded,
        }
    }
}

/// The most recent recorded status of a target.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LastStatus {
    pub is_up: bool,
    pub latency_ms: f64,
    pub is_degraded: bool,
}

/// Per-target tunables, swapped as one value on reconfiguration.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub confirmation_threshold: u32,
    pub cooldown_minutes: i64,
    pub flap_detection_enabled: bool,
    pub flap_window_checks: usize,
    pub flap_threshold_percent: f64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            confirmation_threshold: 1,
            cooldown_minutes: 0,
            flap_detection_enabled: false,
            flap_window_checks: 20,
            flap_threshold_percent: 50.0,
        }
    }
}

#[derive(Debug, Default)]
struct Runtime {
    name: String,
    group_id: i64,
    history: VecDeque<HistoryPoint>,
    down_count: u32,
    down_confirmed: bool,
    degraded_count: u32,
    degraded_confirmed: bool,
    last_notified: HashMap<EventKind, DateTime<Utc>>,
    is_flapping: bool,
    config: TargetConfig,
    ssl: SslLadder,
}

/// In-memory state for one monitored endpoint.
pub struct TargetState {
    id: i64,
    url: String,
    interval: Duration,
    created_at: DateTime<Utc>,
    stop_tx: broadcast::Sender<()>,
    inner: RwLock<Runtime>,
}

impl TargetState {
    pub fn new(
        id: i64,
        group_id: i64,
        name: &str,
        url: &str,
        interval: Duration,
        created_at: DateTime<Utc>,
        config: TargetConfig,
    ) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            id,
            url: url.to_string(),
            interval,
            created_at,
            stop_tx,
            inner: RwLock::new(Runtime {
                name: name.to_string(),
                group_id,
                config,
                ..Default::default()
            }),
        }
    }

    // --- Identity accessors ---

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn name(&self) -> String {
        self.inner.read().unwrap().name.clone()
    }

    pub fn group_id(&self) -> i64 {
        self.inner.read().unwrap().group_id
    }

    /// Name and group may change without recreating the target.
    pub(crate) fn set_identity(&self, name: &str, group_id: i64) {
        let mut rt = self.inner.write().unwrap();
        rt.name = name.to_string();
        rt.group_id = group_id;
    }

    // --- Timer control ---

    pub(crate) fn subscribe_stop(&self) -> broadcast::Receiver<()> {
        self.stop_tx.subscribe()
    }

    /// Signal this target's probe timer to exit.
    pub(crate) fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    // --- History ---

    /// Append a history point, evicting the oldest past the cap.
    pub fn push_history(&self, point: HistoryPoint) {
        let mut rt = self.inner.write().unwrap();
        rt.history.push_back(point);
        while rt.history.len() > HISTORY_CAP {
            rt.history.pop_front();
        }
    }

    /// Snapshot of the recorded history, oldest first.
    pub fn history(&self) -> Vec<HistoryPoint> {
        self.inner.read().unwrap().history.iter().cloned().collect()
    }

    /// The most recent recorded status, if any probe has been recorded.
    pub fn last_status(&self) -> Option<LastStatus> {
        let rt = self.inner.read().unwrap();
        rt.history.back().map(|p| LastStatus {
            is_up: p.is_up,
            latency_ms: p.latency_ms,
            is_degraded: p.is_degraded,
        })
    }

    /// Replace history from persisted checks (oldest first) and rebuild the
    /// confirmation counters from the trailing run.
    pub fn hydrate(&self, points: Vec<HistoryPoint>) {
        {
            let mut rt = self.inner.write().unwrap();
            rt.history = points.into_iter().collect();
            while rt.history.len() > HISTORY_CAP {
                rt.history.pop_front();
            }
        }
        self.hydrate_confirmation_state();
    }

    /// Reconstruct counters from the trailing run of same-outcome entries.
    ///
    /// A trailing run of failures seeds the down counter; a trailing run of
    /// degraded-while-up entries seeds the degraded counter. A down run wins
    /// over a degraded one, and a healthy most-recent entry leaves both at
    /// zero.
    pub fn hydrate_confirmation_state(&self) {
        let mut rt = self.inner.write().unwrap();
        rt.down_count = 0;
        rt.down_confirmed = false;
        rt.degraded_count = 0;
        rt.degraded_confirmed = false;

        let (last_up, last_degraded) = match rt.history.back() {
            Some(p) => (p.is_up, p.is_degraded),
            None => return,
        };

        if !last_up {
            let run = rt.history.iter().rev().take_while(|p| !p.is_up).count() as u32;
            rt.down_count = run;
            rt.down_confirmed = run >= rt.config.confirmation_threshold;
        } else if last_degraded {
            let run = rt
                .history
                .iter()
                .rev()
                .take_while(|p| p.is_up && p.is_degraded)
                .count() as u32;
            rt.degraded_count = run;
            rt.degraded_confirmed = run >= rt.config.confirmation_threshold;
        }
    }

    // --- Confirmation debounce ---

    /// Count a failing probe. Returns `true` exactly once, on the tick the
    /// counter first reaches the confirmation threshold.
    pub fn increment_down(&self) -> bool {
        let mut rt = self.inner.write().unwrap();
        rt.down_count = rt.down_count.saturating_add(1);
        if !rt.down_confirmed && rt.down_count >= rt.config.confirmation_threshold {
            rt.down_confirmed = true;
            return true;
        }
        false
    }

    /// Clear the down counter. Returns whether the down state had been
    /// confirmed; only then is the down cooldown stamp cleared.
    pub fn reset_down(&self) -> bool {
        let mut rt = self.inner.write().unwrap();
        let was_confirmed = rt.down_confirmed;
        rt.down_count = 0;
        rt.down_confirmed = false;
        if was_confirmed {
            rt.last_notified.remove(&EventKind::Down);
        }
        was_confirmed
    }

    /// Count a degraded probe. Same exactly-once contract as
    /// [`increment_down`](Self::increment_down).
    pub fn increment_degraded(&self) -> bool {
        let mut rt = self.inner.write().unwrap();
        rt.degraded_count = rt.degraded_count.saturating_add(1);
        if !rt.degraded_confirmed && rt.degraded_count >= rt.config.confirmation_threshold {
            rt.degraded_confirmed = true;
            return true;
        }
        false
    }

    /// Clear the degraded counter. Returns whether the degraded state had
    /// been confirmed.
    pub fn reset_degraded(&self) -> bool {
        let mut rt = self.inner.write().unwrap();
        let was_confirmed = rt.degraded_confirmed;
        rt.degraded_count = 0;
        rt.degraded_confirmed = false;
        if was_confirmed {
            rt.last_notified.remove(&EventKind::Degraded);
        }
        was_confirmed
    }

    // --- Cooldown ---

    /// Whether a notification of this kind is allowed at `now`.
    pub fn should_notify(&self, kind: EventKind, now: DateTime<Utc>) -> bool {
        let rt = self.inner.read().unwrap();
        if rt.config.cooldown_minutes <= 0 {
            return true;
        }
        match rt.last_notified.get(&kind) {
            Some(last) => now - *last >= ChronoDuration::minutes(rt.config.cooldown_minutes),
            None => true,
        }
    }

    /// Stamp the time a notification of this kind was sent.
    pub fn mark_notified(&self, kind: EventKind, now: DateTime<Utc>) {
        self.inner.write().unwrap().last_notified.insert(kind, now);
    }

    // --- Flap detection ---

    /// Re-evaluate the flap flag over the recent history window.
    ///
    /// Returns `(is_flapping, changed)`; `changed` is true only on the tick
    /// the flag actually flips. Exiting flapping requires dropping to 80% of
    /// the start threshold, so the flag itself cannot oscillate around the
    /// boundary.
    pub fn compute_flapping(&self) -> (bool, bool) {
        let mut rt = self.inner.write().unwrap();
        if !rt.config.flap_detection_enabled {
            return (rt.is_flapping, false);
        }

        let window = rt.config.flap_window_checks.min(rt.history.len());
        if window < 3 {
            return (rt.is_flapping, false);
        }

        let start = rt.history.len() - window;
        let mut transitions = 0usize;
        let mut prev: Option<bool> = None;
        for point in rt.history.iter().skip(start) {
            if let Some(p) = prev {
                if p != point.is_up {
                    transitions += 1;
                }
            }
            prev = Some(point.is_up);
        }

        let percent = transitions as f64 / (window - 1) as f64 * 100.0;
        let threshold = rt.config.flap_threshold_percent;
        let was_flapping = rt.is_flapping;
        let now_flapping = if was_flapping {
            percent > threshold * 0.8
        } else {
            percent >= threshold
        };

        rt.is_flapping = now_flapping;
        (now_flapping, now_flapping != was_flapping)
    }

    pub fn is_flapping(&self) -> bool {
        self.inner.read().unwrap().is_flapping
    }

    // --- Configuration ---

    /// Swap in a new configuration. Returns `true` if disabling flap
    /// detection cleared an active flapping flag.
    pub fn apply_config(&self, config: TargetConfig) -> bool {
        let mut rt = self.inner.write().unwrap();
        let clears_flap = !config.flap_detection_enabled && rt.is_flapping;
        rt.config = config;
        if clears_flap {
            rt.is_flapping = false;
        }
        clears_flap
    }

    pub fn config(&self) -> TargetConfig {
        self.inner.read().unwrap().config.clone()
    }

    // --- SSL expiry ladder ---

    /// Record an observed certificate expiry; returns the day threshold to
    /// notify for, if a new rung was crossed.
    pub fn observe_cert_expiry(
        &self,
        expiry: DateTime<Utc>,
        now: DateTime<Utc>,
        thresholds: &[i64],
    ) -> Option<i64> {
        self.inner
            .write()
            .unwrap()
            .ssl
            .observe(expiry, now, thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_with(config: TargetConfig) -> TargetState {
        TargetState::new(
            1,
            0,
            "api",
            "https://api.example.com/health",
            Duration::from_secs(60),
            Utc::now(),
            config,
        )
    }

    fn point(is_up: bool, is_degraded: bool) -> HistoryPoint {
        HistoryPoint {
            time: Utc::now(),
            is_up,
            latency_ms: 10.0,
            status_code: if is_up { Some(200) } else { Some(500) },
            error: None,
            is_degraded,
        }
    }

    fn force_flapping(target: &TargetState) {
        target.inner.write().unwrap().is_flapping = true;
    }

    #[test]
    fn test_history_capped_fifo() {
        let target = target_with(TargetConfig::default());
        for i in 0..(HISTORY_CAP + 1) {
            let mut p = point(true, false);
            p.latency_ms = i as f64;
            target.push_history(p);
        }

        let history = target.history();
        assert_eq!(history.len(), HISTORY_CAP);
        // The oldest entry (latency 0) was evicted.
        assert_eq!(history[0].latency_ms, 1.0);
        assert_eq!(history[HISTORY_CAP - 1].latency_ms, HISTORY_CAP as f64);
    }

    #[test]
    fn test_last_status_tracks_newest_entry() {
        let target = target_with(TargetConfig::default());
        assert!(target.last_status().is_none());

        target.push_history(point(true, false));
        target.push_history(point(false, false));

        let status = target.last_status().unwrap();
        assert!(!status.is_up);
        assert!(!status.is_degraded);
    }

    #[test]
    fn test_increment_down_confirms_exactly_once() {
        let target = target_with(TargetConfig {
            confirmation_threshold: 3,
            ..Default::default()
        });

        assert!(!target.increment_down());
        assert!(!target.increment_down());
        assert!(target.increment_down());
        assert!(!target.increment_down());
        assert!(!target.increment_down());

        assert!(target.reset_down());
        // Counter cleared, threshold reachable again.
        assert!(!target.increment_down());
        assert!(!target.increment_down());
        assert!(target.increment_down());
    }

    #[test]
    fn test_threshold_one_confirms_immediately() {
        let target = target_with(TargetConfig::default());
        assert!(target.increment_down());
        assert!(!target.increment_down());
    }

    #[test]
    fn test_reset_down_reports_confirmation() {
        let target = target_with(TargetConfig {
            confirmation_threshold: 2,
            ..Default::default()
        });

        target.increment_down();
        assert!(!target.reset_down());

        target.increment_down();
        target.increment_down();
        assert!(target.reset_down());
        assert!(!target.reset_down());
    }

    #[test]
    fn test_unconfirmed_reset_leaves_cooldown() {
        let now = Utc::now();
        let target = target_with(TargetConfig {
            confirmation_threshold: 2,
            cooldown_minutes: 10,
            ..Default::default()
        });

        target.mark_notified(EventKind::Down, now);
        target.increment_down();
        assert!(!target.reset_down());
        // Stamp survives an unconfirmed reset.
        assert!(!target.should_notify(EventKind::Down, now + ChronoDuration::minutes(5)));

        target.increment_down();
        target.increment_down();
        assert!(target.reset_down());
        // A confirmed reset re-arms the kind.
        assert!(target.should_notify(EventKind::Down, now + ChronoDuration::minutes(5)));
    }

    #[test]
    fn test_cooldown_zero_always_notifies() {
        let now = Utc::now();
        let target = target_with(TargetConfig::default());

        target.mark_notified(EventKind::Down, now);
        assert!(target.should_notify(EventKind::Down, now));
    }

    #[test]
    fn test_cooldown_elapses() {
        let now = Utc::now();
        let target = target_with(TargetConfig {
            cooldown_minutes: 15,
            ..Default::default()
        });

        assert!(target.should_notify(EventKind::Down, now));
        target.mark_notified(EventKind::Down, now);
        assert!(!target.should_notify(EventKind::Down, now + ChronoDuration::minutes(14)));
        assert!(target.should_notify(EventKind::Down, now + ChronoDuration::minutes(15)));
    }

    #[test]
    fn test_cooldown_kinds_are_independent() {
        let now = Utc::now();
        let target = target_with(TargetConfig {
            cooldown_minutes: 30,
            ..Default::default()
        });

        target.mark_notified(EventKind::Down, now);
        assert!(!target.should_notify(EventKind::Down, now));
        assert!(target.should_notify(EventKind::Degraded, now));
        assert!(target.should_notify(EventKind::Recovered, now));
    }

    #[test]
    fn test_flap_alternating_window_flags() {
        let target = target_with(TargetConfig {
            flap_detection_enabled: true,
            flap_window_checks: 20,
            flap_threshold_percent: 25.0,
            ..Default::default()
        });
        for i in 0..20 {
            target.push_history(point(i % 2 == 0, false));
        }

        let (flapping, changed) = target.compute_flapping();
        assert!(flapping);
        assert!(changed);

        // Re-evaluating the same window flips nothing.
        let (flapping, changed) = target.compute_flapping();
        assert!(flapping);
        assert!(!changed);
    }

    #[test]
    fn test_flap_hysteresis_band_preserves_flag() {
        // 21-entry window, 20 pairs: each transition is worth 5%. Nine
        // transitions put the percent at 45, strictly between the stop
        // boundary (40) and the start threshold (50).
        let config = TargetConfig {
            flap_detection_enabled: true,
            flap_window_checks: 21,
            flap_threshold_percent: 50.0,
            ..Default::default()
        };

        let mut sequence = Vec::new();
        for i in 0..10 {
            sequence.push(i % 2 == 0);
        }
        sequence.extend(std::iter::repeat(false).take(11));
        assert_eq!(sequence.len(), 21);

        let calm = target_with(config.clone());
        for up in &sequence {
            calm.push_history(point(*up, false));
        }
        let (flapping, changed) = calm.compute_flapping();
        assert!(!flapping);
        assert!(!changed);

        let agitated = target_with(config);
        for up in &sequence {
            agitated.push_history(point(*up, false));
        }
        force_flapping(&agitated);
        let (flapping, changed) = agitated.compute_flapping();
        assert!(flapping);
        assert!(!changed);
    }

    #[test]
    fn test_flap_stop_boundary_exits_with_single_change() {
        // 11-entry window, 10 pairs: four transitions = 40%, exactly the
        // stop boundary for a 50% start threshold.
        let target = target_with(TargetConfig {
            flap_detection_enabled: true,
            flap_window_checks: 11,
            flap_threshold_percent: 50.0,
            ..Default::default()
        });
        let sequence = [
            true, false, true, false, true, true, true, true, true, true, true,
        ];
        for up in sequence {
            target.push_history(point(up, false));
        }
        force_flapping(&target);

        let (flapping, changed) = target.compute_flapping();
        assert!(!flapping);
        assert!(changed);

        // Already out; a second evaluation is quiet.
        let (flapping, changed) = target.compute_flapping();
        assert!(!flapping);
        assert!(!changed);
    }

    #[test]
    fn test_flap_needs_three_entries() {
        let target = target_with(TargetConfig {
            flap_detection_enabled: true,
            flap_window_checks: 20,
            flap_threshold_percent: 25.0,
            ..Default::default()
        });
        target.push_history(point(true, false));
        target.push_history(point(false, false));

        let (flapping, changed) = target.compute_flapping();
        assert!(!flapping);
        assert!(!changed);
    }

    #[test]
    fn test_disabling_flap_detection_clears_flag() {
        let target = target_with(TargetConfig {
            flap_detection_enabled: true,
            flap_window_checks: 20,
            flap_threshold_percent: 25.0,
            ..Default::default()
        });
        for i in 0..20 {
            target.push_history(point(i % 2 == 0, false));
        }
        target.compute_flapping();
        assert!(target.is_flapping());

        let cleared = target.apply_config(TargetConfig::default());
        assert!(cleared);
        assert!(!target.is_flapping());

        // Applying a config without an active flag reports nothing.
        assert!(!target.apply_config(TargetConfig::default()));
    }

    #[test]
    fn test_hydrate_trailing_failures() {
        let target = target_with(TargetConfig {
            confirmation_threshold: 3,
            ..Default::default()
        });

        target.hydrate(vec![
            point(true, false),
            point(false, false),
            point(false, false),
            point(false, false),
        ]);

        // Three trailing failures at threshold 3: already confirmed, so the
        // next failure must not re-fire.
        assert!(!target.increment_down());
        assert!(target.reset_down());
    }

    #[test]
    fn test_hydrate_trailing_degraded_run() {
        let target = target_with(TargetConfig {
            confirmation_threshold: 2,
            ..Default::default()
        });

        target.hydrate(vec![
            point(false, false),
            point(true, true),
            point(true, true),
        ]);

        assert!(!target.increment_degraded());
        assert!(target.reset_degraded());
        // The down run was interrupted, so no down confirmation.
        assert!(!target.reset_down());
    }

    #[test]
    fn test_hydrate_healthy_tail_zeroes_counters() {
        let target = target_with(TargetConfig::default());

        target.hydrate(vec![point(false, false), point(true, false)]);

        assert!(!target.reset_down());
        assert!(!target.reset_degraded());
    }

    #[test]
    fn test_hydrate_caps_history() {
        let target = target_with(TargetConfig::default());
        let points: Vec<HistoryPoint> = (0..80).map(|_| point(true, false)).collect();
        target.hydrate(points);
        assert_eq!(target.history().len(), HISTORY_CAP);
    }

    #[test]
    fn test_threshold_change_applies_to_accumulated_counter() {
        let target = target_with(TargetConfig {
            confirmation_threshold: 5,
            ..Default::default()
        });

        target.increment_down();
        target.increment_down();

        target.apply_config(TargetConfig {
            confirmation_threshold: 3,
            ..Default::default()
        });

        // Counter is at 2; the next increment reaches the new threshold.
        assert!(target.increment_down());
    }
}
