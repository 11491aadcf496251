//! Configuration module for Flarepath.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file (default: "flarepath.db")
    pub db_path: String,
    /// Number of probe workers (default: 50)
    pub worker_count: usize,
    /// Client-side probe timeout in seconds (default: 5)
    pub probe_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "flarepath.db".to_string(),
            worker_count: 50,
            probe_timeout_secs: 5,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `FLAREPATH_DB_PATH`: Database file path (default: "flarepath.db")
    /// - `FLAREPATH_WORKERS`: Probe worker count (default: 50)
    /// - `FLAREPATH_PROBE_TIMEOUT_SECS`: Probe timeout (default: 5)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("FLAREPATH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(workers_str) = env::var("FLAREPATH_WORKERS") {
            if let Ok(workers) = workers_str.parse() {
                if workers > 0 {
                    cfg.worker_count = workers;
                }
            }
        }

        if let Ok(timeout_str) = env::var("FLAREPATH_PROBE_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout_str.parse() {
                if timeout > 0 {
                    cfg.probe_timeout_secs = timeout;
                }
            }
        }

        cfg
    }
}
