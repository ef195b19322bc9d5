//! Readiness of the web UI, as seen through its published port.

use std::{
    fmt,
    time::{Duration, Instant},
};

use hyper::{Client, StatusCode, Uri};

use crate::errors::{Error, Result};

/// Outcome of one request against the health endpoint
#[derive(Clone, Debug, PartialEq)]
pub enum Probe {
    Healthy,
    Unhealthy(StatusCode),
    Unreachable(String),
}

impl Probe {
    pub fn is_healthy(&self) -> bool {
        *self == Probe::Healthy
    }
}

impl fmt::Display for Probe {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        match self {
            Probe::Healthy => write!(f, "ok"),
            Probe::Unhealthy(status) => write!(f, "responded {}", status),
            Probe::Unreachable(reason) => write!(f, "unreachable ({})", reason),
        }
    }
}

/// GETs `url` once. Only a `200 OK` within `timeout` counts as healthy.
pub async fn probe(
    url: &str,
    timeout: Duration,
) -> Result<Probe> {
    let uri: Uri = url
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid health url {}", url)))?;
    let client = Client::new();

    log::debug!("GET {}", uri);
    let outcome = match tokio::time::timeout(timeout, client.get(uri)).await {
        Err(_) => Probe::Unreachable(format!("no response within {}s", timeout.as_secs())),
        Ok(Err(e)) => Probe::Unreachable(e.to_string()),
        Ok(Ok(response)) if response.status() == StatusCode::OK => Probe::Healthy,
        Ok(Ok(response)) => Probe::Unhealthy(response.status()),
    };
    Ok(outcome)
}

/// Combined view of the endpoint probe and the runtime's own healthcheck
#[derive(Clone, Debug, PartialEq)]
pub struct HealthReport {
    pub endpoint: Probe,
    /// `starting`, `healthy` or `unhealthy`; `None` without a healthcheck
    /// or when the container could not be inspected
    pub container: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.endpoint.is_healthy() && self.container.as_deref() != Some("unhealthy")
    }
}

impl fmt::Display for HealthReport {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        write!(f, "endpoint {}", self.endpoint)?;
        if let Some(ref status) = self.container {
            write!(f, ", container {}", status)?;
        }
        Ok(())
    }
}

/// Probes every `interval` until the endpoint is healthy or `deadline` has
/// passed, returning the last outcome
pub async fn wait_until_healthy(
    url: &str,
    timeout: Duration,
    interval: Duration,
    deadline: Duration,
) -> Result<Probe> {
    let started = Instant::now();
    loop {
        let outcome = probe(url, timeout).await?;
        if outcome.is_healthy() || started.elapsed() + interval > deadline {
            return Ok(outcome);
        }
        log::info!("waiting for {}: {}", url, outcome);
        tokio::time::delay_for(interval).await;
    }
}
