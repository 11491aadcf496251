//! Monitoring engine: target scheduling, worker pool, and reconciliation.

mod processor;
mod ssl;
mod target;

pub use ssl::*;
pub use target::*;

use crate::config::Config;
use crate::db::{DbError, MaintenanceWindow, MonitorConfig, Store};
use crate::notify::NotificationEvent;
use crate::probe;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, RwLock};

/// Capacity of the job and result queues.
const QUEUE_CAP: usize = 1000;

/// How often persisted configuration is re-read without an explicit signal.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// How often old check rows are pruned.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

const LATENCY_THRESHOLD_KEY: &str = "latency_threshold_ms";
const SSL_THRESHOLDS_KEY: &str = "ssl_expiry_thresholds";
const RETENTION_DAYS_KEY: &str = "check_retention_days";

const DEFAULT_LATENCY_THRESHOLD_MS: u64 = 1000;
const DEFAULT_RETENTION_DAYS: i64 = 90;

/// A queued probe request.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub monitor_id: i64,
    pub url: String,
}

/// One completed probe, headed for the result processor.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub monitor_id: i64,
    pub time: DateTime<Utc>,
    pub is_up: bool,
    pub latency_ms: f64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub cert_expires_at: Option<DateTime<Utc>>,
}

/// The monitoring engine: owns the target set, the probe worker pool, the
/// result processor, and the maintenance-window cache.
pub struct Engine {
    store: Arc<Store>,
    targets: RwLock<HashMap<i64, Arc<TargetState>>>,
    maintenance: RwLock<Vec<MaintenanceWindow>>,
    job_tx: mpsc::Sender<Job>,
    job_rx: std::sync::Mutex<Option<mpsc::Receiver<Job>>>,
    result_tx: mpsc::Sender<ProbeResult>,
    result_rx: std::sync::Mutex<Option<mpsc::Receiver<ProbeResult>>>,
    notify_tx: mpsc::Sender<NotificationEvent>,
    latency_threshold_ms: AtomicU64,
    ssl_thresholds: std::sync::RwLock<Vec<i64>>,
    worker_count: usize,
    probe_timeout: Duration,
    shutdown: broadcast::Sender<()>,
}

impl Engine {
    /// Create a new engine. Process-wide tunables are loaded from the
    /// settings table once, here; afterwards only the public setters touch
    /// them.
    pub fn new(
        store: Arc<Store>,
        notify_tx: mpsc::Sender<NotificationEvent>,
        config: &Config,
    ) -> Result<Self, DbError> {
        let (job_tx, job_rx) = mpsc::channel(QUEUE_CAP);
        let (result_tx, result_rx) = mpsc::channel(QUEUE_CAP);
        let (shutdown, _) = broadcast::channel(1);

        let latency_threshold_ms = store
            .get_setting(LATENCY_THRESHOLD_KEY)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LATENCY_THRESHOLD_MS);
        let ssl_thresholds = store
            .get_setting(SSL_THRESHOLDS_KEY)?
            .map(|v| parse_thresholds(&v))
            .unwrap_or_else(|| DEFAULT_SSL_THRESHOLDS.to_vec());

        Ok(Self {
            store,
            targets: RwLock::new(HashMap::new()),
            maintenance: RwLock::new(Vec::new()),
            job_tx,
            job_rx: std::sync::Mutex::new(Some(job_rx)),
            result_tx,
            result_rx: std::sync::Mutex::new(Some(result_rx)),
            notify_tx,
            latency_threshold_ms: AtomicU64::new(latency_threshold_ms),
            ssl_thresholds: std::sync::RwLock::new(ssl_thresholds),
            worker_count: config.worker_count,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            shutdown,
        })
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn notify_tx(&self) -> &mpsc::Sender<NotificationEvent> {
        &self.notify_tx
    }

    /// Start the worker pool, result processor, retention sweep, and the
    /// periodic reconciliation tick.
    pub async fn start(
        self: &Arc<Self>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.reconcile().await;

        let job_rx = match self.job_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                tracing::warn!("Engine already started");
                return Ok(());
            }
        };
        let result_rx = match self.result_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return Ok(()),
        };

        let client = reqwest::Client::builder()
            .timeout(self.probe_timeout)
            .tls_info(true)
            .build()?;

        tracing::info!(
            "Starting engine: {} workers, {:?} probe timeout",
            self.worker_count,
            self.probe_timeout
        );

        let job_rx = Arc::new(AsyncMutex::new(job_rx));
        for _ in 0..self.worker_count {
            tokio::spawn(run_worker(
                job_rx.clone(),
                client.clone(),
                self.probe_timeout,
                self.result_tx.clone(),
                self.shutdown.subscribe(),
            ));
        }

        tokio::spawn(processor::run_result_processor(
            self.clone(),
            result_rx,
            self.shutdown.subscribe(),
        ));

        tokio::spawn(run_retention_loop(self.clone(), self.shutdown.subscribe()));

        let engine = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + RECONCILE_INTERVAL;
            let mut interval = tokio::time::interval_at(start, RECONCILE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => engine.reconcile().await,
                }
            }
        });

        Ok(())
    }

    /// Signal every loop and target timer to exit. In-flight probe and
    /// processor work is not awaited.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let targets = self.targets.read().await;
        for target in targets.values() {
            target.stop();
        }
        tracing::info!("Engine stopped");
    }

    /// Stop and clear every target. Used before a destructive full-data
    /// wipe so nothing holds stale identifiers.
    pub async fn reset(&self) {
        let mut targets = self.targets.write().await;
        for target in targets.values() {
            target.stop();
        }
        targets.clear();
        self.maintenance.write().await.clear();
        tracing::info!("Engine reset: all targets cleared");
    }

    /// Reconcile the in-memory target set against persisted configuration.
    ///
    /// Safe to call concurrently with itself and with the read accessors;
    /// a configuration-store failure leaves the current target set running
    /// on stale-but-valid configuration.
    pub async fn reconcile(self: &Arc<Self>) {
        let monitors = match self.store.list_monitors() {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("Reconcile: failed to list monitors: {}", e);
                return;
            }
        };

        match self.store.list_active_maintenance_windows() {
            Ok(windows) => *self.maintenance.write().await = windows,
            Err(e) => tracing::error!("Reconcile: failed to load maintenance windows: {}", e),
        }

        let mut targets = self.targets.write().await;
        let mut seen = HashSet::new();

        for monitor in monitors.iter().filter(|m| m.active) {
            seen.insert(monitor.id);
            let interval = Duration::from_secs(monitor.interval_secs.max(1) as u64);

            if let Some(existing) = targets.get(&monitor.id) {
                if existing.url() == monitor.url && existing.interval() == interval {
                    existing.set_identity(&monitor.name, monitor.group_id);
                    if existing.apply_config(target_config_from(monitor)) {
                        tracing::info!(
                            "Flap detection disabled for {}, flag cleared",
                            monitor.name
                        );
                    }
                    continue;
                }
                existing.stop();
                targets.remove(&monitor.id);
                tracing::info!("Engine: Replacing target {}", monitor.name);
            } else {
                tracing::info!("Engine: Adding target {}", monitor.name);
            }

            let target = self.build_target(monitor, interval);
            self.spawn_probe_timer(&target);
            targets.insert(monitor.id, target);
        }

        let stale: Vec<i64> = targets
            .keys()
            .filter(|id| !seen.contains(id))
            .copied()
            .collect();
        for id in stale {
            if let Some(target) = targets.remove(&id) {
                target.stop();
                tracing::info!("Engine: Removed target {}", target.name());
            }
        }
    }

    /// Build a target from persisted configuration, rehydrating history and
    /// confirmation counters from the most recent persisted checks.
    fn build_target(&self, monitor: &MonitorConfig, interval: Duration) -> Arc<TargetState> {
        let target = Arc::new(TargetState::new(
            monitor.id,
            monitor.group_id,
            &monitor.name,
            &monitor.url,
            interval,
            monitor.created_at,
            target_config_from(monitor),
        ));

        match self.store.load_recent_checks(monitor.id, HISTORY_CAP) {
            Ok(rows) => target.hydrate(rows.into_iter().map(Into::into).collect()),
            Err(e) => tracing::warn!(
                "Engine: failed to rehydrate history for {}: {}",
                monitor.name,
                e
            ),
        }

        target
    }

    fn spawn_probe_timer(&self, target: &Arc<TargetState>) {
        tokio::spawn(run_probe_timer(
            target.clone(),
            self.job_tx.clone(),
            target.subscribe_stop(),
            self.shutdown.subscribe(),
        ));
    }

    // --- Accessors ---

    pub async fn get_target(&self, id: i64) -> Option<Arc<TargetState>> {
        self.targets.read().await.get(&id).cloned()
    }

    pub async fn list_all(&self) -> Vec<Arc<TargetState>> {
        self.targets.read().await.values().cloned().collect()
    }

    /// Stop and remove a single target.
    pub async fn remove_target(&self, id: i64) {
        let mut targets = self.targets.write().await;
        if let Some(target) = targets.remove(&id) {
            target.stop();
            tracing::info!("Engine: Removed target {}", id);
        }
    }

    /// Point-in-time check against the maintenance-window cache.
    pub async fn is_group_in_maintenance(&self, group_id: i64) -> bool {
        let now = Utc::now();
        self.maintenance
            .read()
            .await
            .iter()
            .any(|w| w.is_active_for(group_id, now))
    }

    // --- Process-wide tunables ---

    pub fn latency_threshold_ms(&self) -> u64 {
        self.latency_threshold_ms.load(Ordering::Relaxed)
    }

    pub fn set_latency_threshold_ms(&self, ms: u64) -> Result<(), DbError> {
        self.latency_threshold_ms.store(ms, Ordering::Relaxed);
        self.store.set_setting(LATENCY_THRESHOLD_KEY, &ms.to_string())
    }

    pub fn ssl_expiry_thresholds(&self) -> Vec<i64> {
        self.ssl_thresholds.read().unwrap().clone()
    }

    pub fn set_ssl_expiry_thresholds(&self, days: Vec<i64>) -> Result<(), DbError> {
        let days = if days.is_empty() {
            DEFAULT_SSL_THRESHOLDS.to_vec()
        } else {
            days
        };
        let encoded = days
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        *self.ssl_thresholds.write().unwrap() = days;
        self.store.set_setting(SSL_THRESHOLDS_KEY, &encoded)
    }
}

fn target_config_from(monitor: &MonitorConfig) -> TargetConfig {
    TargetConfig {
        confirmation_threshold: monitor.confirmation_threshold.max(1),
        cooldown_minutes: monitor.cooldown_minutes.max(0),
        flap_detection_enabled: monitor.flap_detection_enabled,
        flap_window_checks: monitor.flap_window_checks,
        flap_threshold_percent: monitor.flap_threshold_percent,
    }
}

/// Parse a comma-separated day-threshold list.
fn parse_thresholds(value: &str) -> Vec<i64> {
    let parsed: Vec<i64> = value
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if parsed.is_empty() {
        DEFAULT_SSL_THRESHOLDS.to_vec()
    } else {
        parsed
    }
}

/// Delay until the next probe tick on the virtual grid derived from the
/// target's creation time, so cadence is stable across restarts and targets
/// created apart stay spread apart.
pub(crate) fn align_delay(
    created_at: DateTime<Utc>,
    interval: Duration,
    now: DateTime<Utc>,
) -> Duration {
    let interval_ms = interval.as_millis() as i64;
    if interval_ms <= 0 {
        return Duration::from_secs(60);
    }
    let elapsed_ms = (now - created_at).num_milliseconds();
    if elapsed_ms <= 0 {
        return interval;
    }
    let rem = elapsed_ms % interval_ms;
    Duration::from_millis((interval_ms - rem) as u64)
}

/// Probe timer for a single target: first tick immediately, then aligned to
/// the creation-time grid. Submission never blocks; a full job queue drops
/// the tick.
async fn run_probe_timer(
    target: Arc<TargetState>,
    job_tx: mpsc::Sender<Job>,
    mut stop_rx: broadcast::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let job = Job {
            monitor_id: target.id(),
            url: target.url().to_string(),
        };
        match job_tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Job queue full, dropping probe tick for {}",
                    target.name()
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }

        let delay = align_delay(target.created_at(), target.interval(), Utc::now());
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One worker: pull jobs off the shared queue, run the probe, emit the
/// result. The result send may block briefly when the processor falls
/// behind; that backpressure is deliberate.
async fn run_worker(
    job_rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    client: reqwest::Client,
    timeout: Duration,
    result_tx: mpsc::Sender<ProbeResult>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let job = {
            let mut rx = job_rx.lock().await;
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                job = rx.recv() => match job {
                    Some(j) => j,
                    None => return,
                },
            }
        };

        let time = Utc::now();
        let outcome = probe::run_probe(&client, &job.url, timeout).await;
        let result = ProbeResult {
            monitor_id: job.monitor_id,
            time,
            is_up: outcome.is_up,
            latency_ms: outcome.latency_ms,
            status_code: outcome.status_code,
            error: outcome.error,
            cert_expires_at: outcome.cert_expires_at,
        };

        if result_tx.send(result).await.is_err() {
            return;
        }
    }
}

/// Periodic sweep deleting checks past the configured retention.
async fn run_retention_loop(engine: Arc<Engine>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let days = engine
                    .store
                    .get_setting(RETENTION_DAYS_KEY)
                    .ok()
                    .flatten()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RETENTION_DAYS);
                match engine.store.prune_checks_older_than(days) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Retention: pruned {} check rows", n),
                    Err(e) => tracing::error!("Retention: failed to prune checks: {}", e),
                }
            }
        }
    }
}
