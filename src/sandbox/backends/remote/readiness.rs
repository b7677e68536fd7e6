use std::time::Duration;

use reqwest::{Method, StatusCode};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::envd::EnvdTransport;
use crate::error::{Result, RunboxError};

const HEALTH_PATH: &str = "/health";

/// Upper bound for a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Floor for the probe made when the deadline is (almost) spent.
const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Outcome of one health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Ready,
    /// Reachable but not serving yet, or not reachable at all
    NotYet(String),
}

/// Polls the envd health endpoint until it answers or a deadline passes.
pub struct ReadinessProber<'a> {
    transport: &'a EnvdTransport,
    interval: Duration,
    deadline: Duration,
}

impl<'a> ReadinessProber<'a> {
    pub fn new(transport: &'a EnvdTransport, interval: Duration, deadline: Duration) -> Self {
        Self {
            transport,
            interval,
            deadline,
        }
    }

    /// Probe once. Connection failures and 502s mean "not yet", never an error.
    pub async fn probe(&self) -> Probe {
        self.probe_within(PROBE_TIMEOUT.min(self.deadline)).await
    }

    async fn probe_within(&self, limit: Duration) -> Probe {
        let response = self
            .transport
            .request(Method::GET, HEALTH_PATH)
            .timeout(limit.max(MIN_PROBE_TIMEOUT))
            .send()
            .await;

        match response {
            Ok(response) if is_ready_status(response.status()) => Probe::Ready,
            Ok(response) => Probe::NotYet(format!("status {}", response.status().as_u16())),
            Err(e) => Probe::NotYet(e.to_string()),
        }
    }

    /// Wait until the service reports healthy, failing with `NotReady` once
    /// the deadline has passed. The last probe runs at the deadline itself.
    pub async fn wait(&self) -> Result<()> {
        let started = Instant::now();
        let deadline_at = started + self.deadline;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            match self.probe_within(PROBE_TIMEOUT.min(remaining)).await {
                Probe::Ready => {
                    info!(
                        url = %self.transport.base_url(),
                        attempts = attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Sandbox service is ready"
                    );
                    return Ok(());
                }
                Probe::NotYet(reason) => {
                    trace!(attempt = attempt, reason = %reason, "Sandbox service not ready");
                }
            }

            let now = Instant::now();
            if now >= deadline_at {
                debug!(attempts = attempt, "Readiness deadline reached");
                return Err(RunboxError::NotReady {
                    url: self.transport.base_url().to_string(),
                    waited: started.elapsed().min(self.deadline),
                });
            }
            tokio::time::sleep(self.interval.min(deadline_at - now)).await;
        }
    }
}

fn is_ready_status(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_statuses() {
        assert!(is_ready_status(StatusCode::OK));
        assert!(is_ready_status(StatusCode::NO_CONTENT));
        assert!(!is_ready_status(StatusCode::BAD_GATEWAY));
        assert!(!is_ready_status(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_not_ready() {
        // Port 9 (discard) is closed on test hosts; connection refused counts as "not yet".
        let transport =
            EnvdTransport::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        let prober = ReadinessProber::new(
            &transport,
            Duration::from_millis(20),
            Duration::from_millis(100),
        );

        assert!(matches!(prober.probe().await, Probe::NotYet(_)));
        match prober.wait().await {
            Err(RunboxError::NotReady { url, waited }) => {
                assert_eq!(url, "http://127.0.0.1:9");
                assert_eq!(waited, Duration::from_millis(100));
            }
            other => panic!("expected NotReady, got {:?}", other),
        }
    }
}
