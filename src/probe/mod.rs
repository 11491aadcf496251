//! Probe module for endpoint monitoring.
//!
//! Flarepath watches HTTP(S) endpoints only; each probe is a single GET on
//! a shared client.

mod http;

pub use http::*;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP status {0}")]
    Status(u16),
}

/// What one probe observed about an endpoint.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub is_up: bool,
    pub latency_ms: f64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    /// `not_after` of the peer certificate, for https targets only.
    pub cert_expires_at: Option<DateTime<Utc>>,
}

/// Run a probe against the given URL.
///
/// Never fails: connection errors, timeouts, and non-2xx statuses all come
/// back as a down outcome with the error text retained.
pub async fn run_probe(client: &reqwest::Client, url: &str, timeout: Duration) -> ProbeOutcome {
    // Add jitter to avoid thundering herd
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    run_http_probe(client, url, timeout).await
}
