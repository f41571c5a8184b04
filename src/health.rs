//! Health probing of individual proxies.

use crate::config::Timeouts;
use crate::proxy::{new_session_id, ProxyRecord, ProxyRoute};
use crate::transport::{RequestTemplate, Transport};

use futures::StreamExt;
use log::debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub alive: bool,
    pub latency: Duration,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl ProbeResult {
    fn failed(latency: Duration, status_code: Option<u16>, error: String) -> Self {
        Self {
            alive: false,
            latency,
            status_code,
            error: Some(error),
        }
    }
}

/// Summary of a bulk health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub alive: usize,
    pub marked_dead: usize,
}

/// Issues lightweight GET probes through proxies.
///
/// Certificate checks are skipped on probes by default since many proxies
/// present broken certificates. This only decides liveness and is not a TLS
/// policy for real traffic.
#[derive(Clone)]
pub struct HealthProber {
    transport: Arc<dyn Transport>,
    timeouts: Timeouts,
    accept_invalid_certs: bool,
}

impl HealthProber {
    /// Prober sending through `transport`. Certificate checks follow `accept_invalid_certs`.
    pub fn new(transport: Arc<dyn Transport>, timeouts: Timeouts, accept_invalid_certs: bool) -> Self {
        Self {
            transport,
            timeouts,
            accept_invalid_certs,
        }
    }

    /// Probe `test_url` through `record`.
    ///
    /// `timeout` is the total budget for HTTP proxies; SOCKS proxies get it
    /// multiplied by the configured factor. Never fails: transport errors are
    /// reported as a dead result.
    pub async fn probe(&self, record: &ProxyRecord, test_url: &Url, timeout: Duration) -> ProbeResult {
        let timeouts = Timeouts {
            connect: self.timeouts.connect.min(timeout),
            total: timeout,
            socks_multiplier: self.timeouts.socks_multiplier,
        };
        let session = new_session_id();
        let route = match ProxyRoute::new(record, test_url, Some(&session), &timeouts, self.accept_invalid_certs) {
            Ok(route) => route,
            Err(e) => return ProbeResult::failed(Duration::ZERO, None, e.to_string()),
        };

        let request = RequestTemplate::get(test_url.clone());
        let started = Instant::now();
        let result = tokio::time::timeout(route.timeout, self.transport.send(&route, &request)).await;
        let latency = started.elapsed();

        let probe = match result {
            Ok(Ok(response)) => {
                let code = response.status.as_u16();
                if (200..400).contains(&code) {
                    ProbeResult {
                        alive: true,
                        latency,
                        status_code: Some(code),
                        error: None,
                    }
                } else {
                    ProbeResult::failed(latency, Some(code), format!("unexpected status {}", code))
                }
            }
            Ok(Err(e)) => ProbeResult::failed(latency, None, e.to_string()),
            Err(_) => ProbeResult::failed(latency, None, "probe timed out".to_string()),
        };

        debug!(
            "Probe via {} (tunnel: {}): alive={} latency={:?} status={:?}",
            record.redacted(),
            route.tunnel,
            probe.alive,
            probe.latency,
            probe.status_code
        );
        probe
    }

    /// Probe many proxies with at most `concurrency` probes in flight.
    pub async fn probe_all(
        &self,
        records: Vec<ProxyRecord>,
        test_url: &Url,
        concurrency: usize,
    ) -> Vec<(ProxyRecord, ProbeResult)> {
        let timeout = self.timeouts.total;
        futures::stream::iter(records)
            .map(|record| async move {
                let result = self.probe(&record, test_url, timeout).await;
                (record, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }
}
