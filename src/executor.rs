//! Request execution with proxy rotation.
//!
//! Failures are split by who is to blame. Transport errors and 5xx answers are
//! charged to the proxy and trigger rotation. Non-429 4xx answers are about the
//! request itself and end the loop immediately, since no other proxy would get
//! a different answer.

use crate::error::NoProxyAvailable;
use crate::pool::{Outcome, ProxyPool};
use crate::proxy::{new_session_id, FailureCause, ProxyRecord, ProxyRoute};
use crate::rate_limit;
use crate::transport::{RequestTemplate, Transport, TransportResponse};

use futures::future;
use http::StatusCode;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Why a rotation ended without success.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FailureReason {
    /// Nothing left to try: add proxies or reset dead ones.
    #[error("no proxies available: {0}")]
    NoProxyAvailable(NoProxyAvailable),
    /// Every attempt was throttled: wait for cooldowns to expire.
    #[error("all {attempts} attempts were rate limited")]
    AllRateLimited { attempts: usize },
    /// Attempts failed for other reasons: investigate the target.
    #[error("all {attempts} attempts failed (last error: {})", last_error.as_deref().unwrap_or("none"))]
    AllAttemptsFailed {
        attempts: usize,
        last_error: Option<String>,
    },
    /// The target rejected the request itself.
    #[error("request rejected with status {status}")]
    Terminal { status: StatusCode },
    #[error("request cancelled")]
    Cancelled,
}

/// Result of [`RequestExecutor::execute_with_rotation`].
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Last response received, if any. Terminal 4xx responses are kept verbatim.
    pub response: Option<TransportResponse>,
    pub proxy_used: Option<ProxyRecord>,
    /// Whether any attempt was rate limited.
    pub rate_limited: bool,
    pub attempts_made: usize,
    /// Total time slept in rate-limit backoff.
    pub backoff: Duration,
    pub failure: Option<FailureReason>,
}

impl ExecutionOutcome {
    /// The successful response, or why there is none.
    pub fn into_result(self) -> Result<TransportResponse, FailureReason> {
        match (self.success, self.response, self.failure) {
            (true, Some(response), _) => Ok(response),
            (_, _, Some(reason)) => Err(reason),
            (_, _, None) => Err(FailureReason::AllAttemptsFailed {
                attempts: self.attempts_made,
                last_error: None,
            }),
        }
    }
}

/// Running tally of one rotation.
#[derive(Default)]
struct Attempts {
    made: usize,
    rate_limited: usize,
    consecutive_rate_limited: usize,
    skipped_cooling: usize,
    failed: usize,
    backoff: Duration,
    last_error: Option<String>,
    last_response: Option<TransportResponse>,
    last_proxy: Option<ProxyRecord>,
}

impl Attempts {
    fn finish(self, success: bool, failure: Option<FailureReason>) -> ExecutionOutcome {
        ExecutionOutcome {
            success,
            response: self.last_response,
            proxy_used: self.last_proxy,
            rate_limited: self.rate_limited > 0,
            attempts_made: self.made,
            backoff: self.backoff,
            failure,
        }
    }

    /// Records a failed attempt. `response` and `proxy` always describe the
    /// same attempt.
    fn fail(&mut self, error: String, proxy: Option<ProxyRecord>, response: Option<TransportResponse>) {
        self.failed += 1;
        self.consecutive_rate_limited = 0;
        self.last_error = Some(error);
        self.last_proxy = proxy;
        self.last_response = response;
    }

    fn exhausted(self) -> ExecutionOutcome {
        let reason = if self.failed == 0 && (self.rate_limited > 0 || self.skipped_cooling > 0) {
            FailureReason::AllRateLimited { attempts: self.made }
        } else {
            FailureReason::AllAttemptsFailed {
                attempts: self.made,
                last_error: self.last_error.clone(),
            }
        };
        self.finish(false, Some(reason))
    }
}

/// Sends requests through the pool, rotating proxies on failure.
pub struct RequestExecutor {
    pool: Arc<ProxyPool>,
    transport: Arc<dyn Transport>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl RequestExecutor {
    /// Executor using the pool's own transport.
    pub fn new(pool: Arc<ProxyPool>) -> Self {
        let transport = pool.transport();
        Self {
            pool,
            transport,
            shutdown: None,
        }
    }

    /// Executor sending through `transport` instead of the pool's transport.
    pub fn with_transport(pool: Arc<ProxyPool>, transport: Arc<dyn Transport>) -> Self {
        Self {
            pool,
            transport,
            shutdown: None,
        }
    }

    /// Stop between attempts and during backoff once `shutdown` reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// The pool proxies are drawn from.
    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// [`RequestExecutor::execute_with_rotation`] with the configured attempt budget.
    pub async fn execute(&self, request: &RequestTemplate) -> ExecutionOutcome {
        self.execute_with_rotation(request, self.pool.config.max_attempts)
            .await
    }

    /// Send `request`, rotating to a fresh health-checked proxy after each
    /// proxy-attributable failure, for at most `max_attempts` attempts.
    pub async fn execute_with_rotation(&self, request: &RequestTemplate, max_attempts: usize) -> ExecutionOutcome {
        let config = &self.pool.config;
        let session = new_session_id();
        let mut attempts = Attempts::default();

        for attempt in 1..=max_attempts {
            if self.is_cancelled() {
                return attempts.finish(false, Some(FailureReason::Cancelled));
            }

            let proxy = match self.pool.acquire_next(true).await {
                Ok(proxy) => proxy,
                Err(NoProxyAvailable::AllCoolingDown) => {
                    let made = attempts.made;
                    warn!("All proxies cooling down after {} attempts", made);
                    return attempts.finish(false, Some(FailureReason::AllRateLimited { attempts: made }));
                }
                Err(NoProxyAvailable::HealthCheckFailed) => {
                    // Live proxies remain, a later pass may find one healthy.
                    debug!("No proxy passed its health check on attempt {}", attempt);
                    attempts.made = attempt;
                    attempts.fail(NoProxyAvailable::HealthCheckFailed.to_string(), None, None);
                    continue;
                }
                Err(reason) => {
                    warn!("No proxy available for {}: {}", request.url, reason);
                    return attempts.finish(false, Some(FailureReason::NoProxyAvailable(reason)));
                }
            };
            attempts.made = attempt;

            if self.pool.is_cooling_down(&proxy.id) {
                debug!("Proxy {} is cooling down, skipping attempt {}", proxy.redacted(), attempt);
                attempts.skipped_cooling += 1;
                continue;
            }

            if let Some(limiter) = self.pool.limiter(&proxy.id) {
                limiter.until_ready().await;
            }

            let route = match ProxyRoute::new(
                &proxy,
                &request.url,
                Some(&session),
                &config.timeouts,
                !config.verify_target_certs,
            ) {
                Ok(route) => route,
                Err(e) => {
                    warn!("Cannot build route through {}: {}", proxy.redacted(), e);
                    self.pool.report_outcome(&proxy.id, Outcome::Failure { cause: FailureCause::Other });
                    attempts.fail(e.to_string(), Some(proxy), None);
                    continue;
                }
            };

            debug!(
                "Sending {} {} via {} (attempt {}/{}, tunnel: {})",
                request.method,
                request.url,
                proxy.redacted(),
                attempt,
                max_attempts,
                route.tunnel
            );

            let started = Instant::now();
            let result = self.transport.send(&route, request).await;
            let latency = started.elapsed();

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    warn!("Request via {} failed (attempt {}): {}", proxy.redacted(), attempt, e);
                    self.pool.report_outcome(&proxy.id, Outcome::Failure { cause: e.cause() });
                    attempts.fail(e.to_string(), Some(proxy), None);
                    continue;
                }
            };

            let status = response.status;
            if rate_limit::is_rate_limited(status.as_u16(), &response.headers, &response.text()) {
                attempts.rate_limited += 1;
                attempts.consecutive_rate_limited += 1;
                self.pool.report_outcome(
                    &proxy.id,
                    Outcome::RateLimited {
                        retry_after: rate_limit::retry_after(&response.headers),
                    },
                );
                attempts.last_response = Some(response);
                attempts.last_proxy = Some(proxy);

                if let Some(delay) = backoff_delay(
                    attempts.consecutive_rate_limited,
                    config.backoff_threshold,
                    &config.backoff_schedule,
                ) {
                    info!(
                        "Rate limited {} times in a row, backing off for {:?}",
                        attempts.consecutive_rate_limited, delay
                    );
                    if !self.sleep(delay).await {
                        return attempts.finish(false, Some(FailureReason::Cancelled));
                    }
                    attempts.backoff += delay;
                }
                continue;
            }
            attempts.consecutive_rate_limited = 0;

            if status.is_success() || status.is_redirection() {
                self.pool.report_outcome(&proxy.id, Outcome::Success { latency });
                debug!("Request via {} succeeded in {:?}", proxy.redacted(), latency);
                attempts.last_response = Some(response);
                attempts.last_proxy = Some(proxy);
                return attempts.finish(true, None);
            }

            if status.is_client_error() {
                // The proxy did its job; the target refused the request.
                self.pool.report_outcome(&proxy.id, Outcome::Success { latency });
                info!("Request to {} rejected with {}, not rotating", request.url, status);
                attempts.last_response = Some(response);
                attempts.last_proxy = Some(proxy);
                return attempts.finish(false, Some(FailureReason::Terminal { status }));
            }

            if status.is_informational() {
                // Not the proxy's fault, so rotate without charging it.
                warn!("Unexpected {} from {} via {}", status, request.url, proxy.redacted());
                attempts.fail(format!("unexpected HTTP {}", status), Some(proxy), Some(response));
                continue;
            }

            warn!("Request via {} got {} (attempt {})", proxy.redacted(), status, attempt);
            self.pool.report_outcome(
                &proxy.id,
                Outcome::Failure {
                    cause: FailureCause::ServerError(status.as_u16()),
                },
            );
            attempts.fail(format!("HTTP {}", status), Some(proxy), Some(response));
        }

        warn!("Giving up on {} after {} attempts", request.url, attempts.made);
        attempts.exhausted()
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleeps for `delay`. Returns `false` if shutdown was signalled first.
    async fn sleep(&self, delay: Duration) -> bool {
        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = time::sleep(delay) => true,
            _ = wait_for_shutdown(shutdown) => false,
        }
    }
}

async fn wait_for_shutdown(shutdown: Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(mut rx) => {
            if rx.wait_for(|stop| *stop).await.is_err() {
                future::pending::<()>().await;
            }
        }
        None => future::pending::<()>().await,
    }
}

/// Backoff after the `consecutive`-th rate limit in a row.
///
/// The first `threshold` hits rotate without sleeping. Later hits walk the
/// schedule, staying on its last step.
pub fn backoff_delay(consecutive: usize, threshold: usize, schedule: &[Duration]) -> Option<Duration> {
    if consecutive <= threshold || schedule.is_empty() {
        return None;
    }
    let step = (consecutive - threshold - 1).min(schedule.len() - 1);
    schedule.get(step).copied()
}
