//! Configuration for the proxy pool.

use crate::proxy::ProxyScheme;

use std::path::PathBuf;
use std::time::Duration;

/// Strategy for selecting a proxy from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxySelectionStrategy {
    /// Walk the pool in load order, wrapping at the end.
    #[default]
    RoundRobin,
    /// Pick uniformly among eligible proxies.
    Random,
}

/// Connect and total timeout budgets for a single proxied call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeouts {
    /// Budget for establishing the connection to the proxy.
    pub connect: Duration,
    /// Budget for the whole exchange, body included.
    pub total: Duration,
    /// Factor applied to both budgets for SOCKS proxies.
    pub socks_multiplier: u32,
}

impl Timeouts {
    /// Returns `(connect, total)` adjusted for the proxy scheme.
    pub fn for_scheme(&self, scheme: ProxyScheme) -> (Duration, Duration) {
        if scheme.is_socks() {
            let factor = self.socks_multiplier.max(1);
            (self.connect * factor, self.total * factor)
        } else {
            (self.connect, self.total)
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            total: Duration::from_secs(10),
            socks_multiplier: 2,
        }
    }
}

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Files or URLs to load proxy lists from.
    pub sources: Vec<String>,
    /// Proxy list file that validated proxies are appended to.
    pub proxy_file: Option<PathBuf>,
    /// URL probed through each proxy during health checks.
    pub health_check_url: String,
    /// Timeouts for probes and proxied requests.
    pub timeouts: Timeouts,
    /// Interval of the background health sweep. `None` disables it.
    pub health_check_interval: Option<Duration>,
    /// Probe every loaded proxy before the pool is handed out.
    pub check_on_startup: bool,
    /// Upper bound on concurrent probes during a bulk health check.
    pub probe_concurrency: usize,
    /// Attempt budget of the request executor.
    pub max_attempts: usize,
    /// Strategy for selecting proxies.
    pub selection_strategy: ProxySelectionStrategy,
    /// How long a rate-limited proxy is kept out of rotation.
    pub rate_limit_cooldown: Duration,
    /// Sleep applied after consecutive rate limits, indexed by hit count.
    pub backoff_schedule: Vec<Duration>,
    /// Consecutive rate-limit hits tolerated before backoff starts.
    pub backoff_threshold: usize,
    /// Consecutive failures before a rotating gateway is marked dead.
    pub rotating_failure_threshold: u32,
    /// Maximum requests per second per proxy.
    pub max_requests_per_second: f64,
    /// Skip certificate verification on health probes.
    pub accept_invalid_certs: bool,
    /// Verify certificates on executor traffic.
    pub verify_target_certs: bool,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }

    /// The default backoff ladder: 1s, 2s, 5s, 10s, 20s.
    pub fn default_backoff_schedule() -> Vec<Duration> {
        [1, 2, 5, 10, 20].into_iter().map(Duration::from_secs).collect()
    }
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        ProxyPoolConfigBuilder::new().build()
    }
}

/// Builder for `ProxyPoolConfig`.
pub struct ProxyPoolConfigBuilder {
    sources: Vec<String>,
    proxy_file: Option<PathBuf>,
    health_check_url: Option<String>,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    socks_timeout_multiplier: Option<u32>,
    health_check_interval: Option<Duration>,
    check_on_startup: bool,
    probe_concurrency: Option<usize>,
    max_attempts: Option<usize>,
    selection_strategy: Option<ProxySelectionStrategy>,
    rate_limit_cooldown: Option<Duration>,
    backoff_schedule: Option<Vec<Duration>>,
    backoff_threshold: Option<usize>,
    rotating_failure_threshold: Option<u32>,
    max_requests_per_second: Option<f64>,
    accept_invalid_certs: Option<bool>,
    verify_target_certs: Option<bool>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            proxy_file: None,
            health_check_url: None,
            connect_timeout: None,
            request_timeout: None,
            socks_timeout_multiplier: None,
            health_check_interval: None,
            check_on_startup: false,
            probe_concurrency: None,
            max_attempts: None,
            selection_strategy: None,
            rate_limit_cooldown: None,
            backoff_schedule: None,
            backoff_threshold: None,
            rotating_failure_threshold: None,
            max_requests_per_second: None,
            accept_invalid_certs: None,
            verify_target_certs: None,
        }
    }

    /// Set the files or URLs to load proxy lists from.
    pub fn sources(mut self, sources: Vec<impl Into<String>>) -> Self {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Set the proxy list file validated proxies are appended to.
    pub fn proxy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.proxy_file = Some(path.into());
        self
    }

    /// Set the URL used for health checks.
    pub fn health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the total timeout of a probe or request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the timeout factor for SOCKS proxies.
    pub fn socks_timeout_multiplier(mut self, factor: u32) -> Self {
        self.socks_timeout_multiplier = Some(factor);
        self
    }

    /// Enable the background health sweep.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    /// Probe all proxies once when the pool is created.
    pub fn check_on_startup(mut self, enabled: bool) -> Self {
        self.check_on_startup = enabled;
        self
    }

    /// Set the maximum number of concurrent probes.
    pub fn probe_concurrency(mut self, count: usize) -> Self {
        self.probe_concurrency = Some(count);
        self
    }

    /// Set the number of attempts a request gets before giving up.
    pub fn max_attempts(mut self, count: usize) -> Self {
        self.max_attempts = Some(count);
        self
    }

    /// Set the strategy for selecting proxies.
    pub fn selection_strategy(mut self, strategy: ProxySelectionStrategy) -> Self {
        self.selection_strategy = Some(strategy);
        self
    }

    /// Set how long a rate-limited proxy stays out of rotation.
    pub fn rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = Some(cooldown);
        self
    }

    /// Set the backoff ladder applied after consecutive rate limits.
    pub fn backoff_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.backoff_schedule = Some(schedule);
        self
    }

    /// Set how many consecutive rate limits are tolerated without sleeping.
    pub fn backoff_threshold(mut self, hits: usize) -> Self {
        self.backoff_threshold = Some(hits);
        self
    }

    /// Set how many consecutive failures a rotating gateway survives.
    pub fn rotating_failure_threshold(mut self, failures: u32) -> Self {
        self.rotating_failure_threshold = Some(failures);
        self
    }

    /// Set the maximum requests per second per proxy.
    pub fn max_requests_per_second(mut self, rps: f64) -> Self {
        self.max_requests_per_second = Some(rps);
        self
    }

    /// Skip certificate verification on health probes.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = Some(accept);
        self
    }

    /// Verify certificates on proxied requests.
    pub fn verify_target_certs(mut self, verify: bool) -> Self {
        self.verify_target_certs = Some(verify);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        let defaults = Timeouts::default();
        ProxyPoolConfig {
            sources: self.sources,
            proxy_file: self.proxy_file,
            health_check_url: self
                .health_check_url
                .unwrap_or_else(|| "https://api.ipify.org?format=json".to_string()),
            timeouts: Timeouts {
                connect: self.connect_timeout.unwrap_or(defaults.connect),
                total: self.request_timeout.unwrap_or(defaults.total),
                socks_multiplier: self.socks_timeout_multiplier.unwrap_or(defaults.socks_multiplier),
            },
            health_check_interval: self.health_check_interval,
            check_on_startup: self.check_on_startup,
            probe_concurrency: self.probe_concurrency.unwrap_or(200).max(1),
            max_attempts: self.max_attempts.unwrap_or(5).max(1),
            selection_strategy: self.selection_strategy.unwrap_or_default(),
            rate_limit_cooldown: self.rate_limit_cooldown.unwrap_or(Duration::from_secs(60)),
            backoff_schedule: self
                .backoff_schedule
                .unwrap_or_else(ProxyPoolConfig::default_backoff_schedule),
            backoff_threshold: self.backoff_threshold.unwrap_or(2),
            rotating_failure_threshold: self.rotating_failure_threshold.unwrap_or(3).max(1),
            max_requests_per_second: self.max_requests_per_second.unwrap_or(5.0),
            accept_invalid_certs: self.accept_invalid_certs.unwrap_or(true),
            verify_target_certs: self.verify_target_certs.unwrap_or(true),
        }
    }
}

impl Default for ProxyPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
