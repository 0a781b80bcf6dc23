//! Periodic HTTP GET against a configurable endpoint until 2xx or a
//! deadline, cancellable via a `CancellationToken`. Grounded on the
//! teacher's `health::wait_for_http_health` polling shape, generalized
//! from a hardcoded llama-server `/health` path to an arbitrary
//! `check_endpoint` and made cancellation-aware for shutdown.

use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of a health probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

/// Poll `url` at `interval` until a 2xx response arrives, `timeout`
/// elapses, or `cancel` fires. Never panics on connection errors — those
/// are treated as "not ready yet" and retried.
pub async fn probe_until_ready(
    client: &Client,
    url: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ProbeOutcome {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return ProbeOutcome::Cancelled;
        }

        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return ProbeOutcome::Ready,
            Ok(resp) => debug!(status = %resp.status(), url, "health probe not ready"),
            Err(e) => debug!(error = %e, url, "health probe connection failed"),
        }

        if tokio::time::Instant::now() >= deadline {
            return ProbeOutcome::TimedOut;
        }

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = cancel.cancelled() => return ProbeOutcome::Cancelled,
        }
    }
}
