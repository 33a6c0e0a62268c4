//! Background data-plane health poller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;
use url::Url;

use super::{HealthObservation, VizierHealthChecker};

const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Polls an HTTP health endpoint and caches the latest observation for the
/// heartbeat generator to read synchronously.
pub struct HttpHealthChecker {
    last: Arc<parking_lot::Mutex<HealthObservation>>,
}

impl HttpHealthChecker {
    pub fn spawn(endpoint: Url) -> Self {
        let last = Arc::new(parking_lot::Mutex::new(HealthObservation::default()));
        let shared = last.clone();
        tokio::spawn(async move {
            let client = match reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(2))
                .timeout(Duration::from_secs(4))
                .build()
            {
                Ok(client) => client,
                Err(err) => {
                    // Leave the observation empty; heartbeats report UNKNOWN.
                    tracing::error!(error = %err, "could not build health probe client");
                    return;
                }
            };
            let mut ticker = tokio::time::interval(PROBE_INTERVAL);
            loop {
                ticker.tick().await;
                let error = match client.get(endpoint.clone()).send().await {
                    Ok(response) if response.status().is_success() => None,
                    Ok(response) => Some(format!("health probe status {}", response.status())),
                    Err(err) => Some(err.to_string()),
                };
                trace!(?error, "health probe observation");
                *shared.lock() = HealthObservation {
                    observed_at: Some(Instant::now()),
                    error,
                };
            }
        });
        Self { last }
    }
}

impl VizierHealthChecker for HttpHealthChecker {
    fn status(&self) -> HealthObservation {
        self.last.lock().clone()
    }
}
