//! Result processor: the single serialized consumer of probe results.
//!
//! All state transitions are decided here, on one task, which is what lets
//! per-target counters and cooldowns live without their own locks. Outage,
//! event, and check writes happen inline on this task, so the durable
//! record for a target is written in decision order; write failures are
//! logged and monitoring continues on in-memory state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use super::{Engine, HistoryPoint, ProbeResult, TargetState};
use crate::db::CheckRow;
use crate::notify::{EventKind, NotificationEvent};

/// Pending check rows are flushed at this size...
const CHECK_BATCH_SIZE: usize = 50;
/// ...and at least this often.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) async fn run_result_processor(
    engine: Arc<Engine>,
    mut result_rx: mpsc::Receiver<ProbeResult>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut pending: Vec<CheckRow> = Vec::with_capacity(CHECK_BATCH_SIZE);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                flush_pending(&engine, &mut pending);
                break;
            }
            result = result_rx.recv() => {
                match result {
                    Some(r) => {
                        process_result(&engine, r, &mut pending).await;
                        if pending.len() >= CHECK_BATCH_SIZE {
                            flush_pending(&engine, &mut pending);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_pending(&engine, &mut pending);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_pending(&engine, &mut pending);
            }
        }
    }
}

/// Apply one probe result to its target: transition decisions, outage and
/// event records, notification gating, SSL ladder, history, check batching.
pub(crate) async fn process_result(
    engine: &Arc<Engine>,
    result: ProbeResult,
    pending: &mut Vec<CheckRow>,
) {
    let target = match engine.get_target(result.monitor_id).await {
        Some(t) => t,
        // Raced a removal; nothing to record against.
        None => return,
    };

    let threshold_ms = engine.latency_threshold_ms() as f64;
    let is_degraded = result.is_up && result.latency_ms > threshold_ms;
    let now = result.time;
    let in_maintenance = engine.is_group_in_maintenance(target.group_id()).await;

    target.push_history(HistoryPoint {
        time: now,
        is_up: result.is_up,
        latency_ms: result.latency_ms,
        status_code: result.status_code,
        error: result.error.clone(),
        is_degraded,
    });

    let (flapping, flap_changed) = target.compute_flapping();
    if flap_changed {
        let kind = if flapping {
            EventKind::FlappingStarted
        } else {
            EventKind::FlappingStopped
        };
        let message = if flapping {
            format!("{} is flapping", target.name())
        } else {
            format!("{} stopped flapping", target.name())
        };
        append_event(engine, target.id(), kind, &message);
        if !in_maintenance && target.should_notify(kind, now) {
            enqueue_notification(engine, &target, kind, message, now).await;
        }
    }

    if !result.is_up {
        // A failing probe ends any degraded period quietly; the down
        // transition supersedes it.
        if target.reset_degraded() {
            close_outage(engine, target.id());
        }

        if target.increment_down() {
            let detail = result.error.as_deref().unwrap_or("check failed");
            let message = format!("{} is down: {}", target.name(), detail);
            open_outage(engine, target.id(), EventKind::Down, &message);
            append_event(engine, target.id(), EventKind::Down, &message);
            if !in_maintenance && !flapping && target.should_notify(EventKind::Down, now) {
                enqueue_notification(engine, &target, EventKind::Down, message, now).await;
            }
        }
    } else {
        if target.reset_down() {
            let message = format!("{} recovered", target.name());
            close_outage(engine, target.id());
            append_event(engine, target.id(), EventKind::Recovered, &message);
            if !in_maintenance && !flapping && target.should_notify(EventKind::Recovered, now) {
                enqueue_notification(engine, &target, EventKind::Recovered, message, now).await;
            }
        }

        if is_degraded {
            if target.increment_degraded() {
                let message = format!(
                    "{} is degraded: {:.0}ms latency exceeds {:.0}ms",
                    target.name(),
                    result.latency_ms,
                    threshold_ms
                );
                open_outage(engine, target.id(), EventKind::Degraded, &message);
                append_event(engine, target.id(), EventKind::Degraded, &message);
                if !in_maintenance && !flapping && target.should_notify(EventKind::Degraded, now)
                {
                    enqueue_notification(engine, &target, EventKind::Degraded, message, now)
                        .await;
                }
            }
        } else if target.reset_degraded() {
            let message = format!("{} latency back to normal", target.name());
            close_outage(engine, target.id());
            append_event(engine, target.id(), EventKind::DegradedRecovered, &message);
            if !in_maintenance
                && !flapping
                && target.should_notify(EventKind::DegradedRecovered, now)
            {
                enqueue_notification(engine, &target, EventKind::DegradedRecovered, message, now)
                    .await;
            }
        }

        // Certificate expiry: deduped by the per-certificate ladder, not by
        // cooldown.
        if let Some(expiry) = result.cert_expires_at {
            let thresholds = engine.ssl_expiry_thresholds();
            if let Some(days) = target.observe_cert_expiry(expiry, now, &thresholds) {
                let message = format!(
                    "certificate for {} expires within {} days (on {})",
                    target.name(),
                    days,
                    expiry.format("%Y-%m-%d")
                );
                if !in_maintenance {
                    enqueue_notification(engine, &target, EventKind::SslExpiry, message, now)
                        .await;
                }
            }
        }
    }

    pending.push(CheckRow {
        monitor_id: target.id(),
        time: now,
        is_up: result.is_up,
        latency_ms: result.latency_ms,
        status_code: result.status_code,
        error: result.error,
        is_degraded,
    });
}

async fn enqueue_notification(
    engine: &Arc<Engine>,
    target: &Arc<TargetState>,
    kind: EventKind,
    message: String,
    now: chrono::DateTime<chrono::Utc>,
) {
    let event = NotificationEvent {
        monitor_id: target.id(),
        monitor_name: target.name(),
        monitor_url: target.url().to_string(),
        kind,
        message,
        time: now,
    };
    if engine.notify_tx().send(event).await.is_err() {
        tracing::error!("Notifier queue closed, dropping {} notification", kind);
        return;
    }
    target.mark_notified(kind, now);
}

fn open_outage(engine: &Engine, monitor_id: i64, kind: EventKind, message: &str) {
    if let Err(e) = engine.store().open_outage(monitor_id, kind.as_str(), message) {
        tracing::error!("Failed to open outage for {}: {}", monitor_id, e);
    }
}

fn close_outage(engine: &Engine, monitor_id: i64) {
    if let Err(e) = engine.store().close_outage(monitor_id) {
        tracing::error!("Failed to close outage for {}: {}", monitor_id, e);
    }
}

fn append_event(engine: &Engine, monitor_id: i64, kind: EventKind, message: &str) {
    if let Err(e) = engine.store().append_event(monitor_id, kind.as_str(), message) {
        tracing::error!("Failed to append {} event for {}: {}", kind, monitor_id, e);
    }
}

fn flush_pending(engine: &Engine, pending: &mut Vec<CheckRow>) {
    if pending.is_empty() {
        return;
    }

    if let Err(e) = engine.store().batch_append_checks(pending) {
        tracing::error!("Failed to flush check rows: {}", e);
    }

    pending.clear();
}
