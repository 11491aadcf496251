//! HTTP probe implementation.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use x509_parser::prelude::FromDer;

use super::{ProbeError, ProbeOutcome};

/// Run an HTTP probe against the given URL.
///
/// The shared client carries the request timeout and keeps connections
/// alive across probes of the same host.
pub async fn run_http_probe(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> ProbeOutcome {
    let start = Instant::now();

    let response = match client.get(url).send().await {
        Ok(r) => r,
        Err(e) => {
            let error = if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(e.to_string())
            };
            return ProbeOutcome {
                is_up: false,
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                status_code: None,
                error: Some(error.to_string()),
                cert_expires_at: None,
            };
        }
    };

    let status = response.status();
    let cert_expires_at = if url.starts_with("https://") {
        peer_cert_expiry(&response)
    } else {
        None
    };

    // Read the full body to measure complete transfer time
    let body = response.bytes().await;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    if let Err(e) = body {
        let error = if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        };
        return ProbeOutcome {
            is_up: false,
            latency_ms,
            status_code: Some(status.as_u16()),
            error: Some(error.to_string()),
            cert_expires_at,
        };
    }

    if status.is_success() {
        ProbeOutcome {
            is_up: true,
            latency_ms,
            status_code: Some(status.as_u16()),
            error: None,
            cert_expires_at,
        }
    } else {
        ProbeOutcome {
            is_up: false,
            latency_ms,
            status_code: Some(status.as_u16()),
            error: Some(ProbeError::Status(status.as_u16()).to_string()),
            cert_expires_at,
        }
    }
}

/// Extract `not_after` from the peer certificate, if the TLS backend
/// exposed it on the response.
fn peer_cert_expiry(response: &reqwest::Response) -> Option<DateTime<Utc>> {
    let info = response.extensions().get::<reqwest::tls::TlsInfo>()?;
    let der = info.peer_certificate()?;
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der).ok()?;
    let timestamp = cert.validity().not_after.timestamp();
    DateTime::<Utc>::from_timestamp(timestamp, 0)
}
