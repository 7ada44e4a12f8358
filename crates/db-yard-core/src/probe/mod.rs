//! Reachability probe.
//!
//! Informational only: the probe's result is an event, never a gate on the
//! spawn lifecycle. Failures (timeout, refused, non-success status) are
//! reported and otherwise ignored.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

/// Outcome of one reachability probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    /// The probed URL.
    pub url: String,

    /// Whether a success status came back inside the timeout.
    pub reachable: bool,

    /// HTTP status, when a response arrived.
    pub status: Option<u16>,

    /// Elapsed time in milliseconds.
    pub elapsed_ms: u64,

    /// Failure description, when unreachable.
    pub error: Option<String>,
}

/// Probe a URL with an explicit timeout.
///
/// Never returns an error; unreachability is data.
pub async fn probe_http(url: &str, timeout: Duration) -> ProbeResult {
    let started = Instant::now();

    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => {
            return ProbeResult {
                url: url.to_string(),
                reachable: false,
                status: None,
                elapsed_ms: 0,
                error: Some(format!("client build failed: {err}")),
            };
        }
    };

    let result = client.get(url).send().await;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match result {
        Ok(response) => {
            let status = response.status();
            debug!(url, status = status.as_u16(), elapsed_ms, "probe completed");
            ProbeResult {
                url: url.to_string(),
                reachable: status.is_success(),
                status: Some(status.as_u16()),
                elapsed_ms,
                error: (!status.is_success()).then(|| format!("status {status}")),
            }
        }
        Err(err) => ProbeResult {
            url: url.to_string(),
            reachable: false,
            status: None,
            elapsed_ms,
            error: Some(err.to_string()),
        },
    }
}
