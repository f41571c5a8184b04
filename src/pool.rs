//! Core proxy pool implementation.
//!
//! All pool state lives in one [`PoolState`] behind a single mutex. Every
//! public operation takes the lock once per state change and never holds it
//! across a network call, so concurrent callers cannot corrupt the cursor or
//! double-count statistics.

use crate::config::{ProxyPoolConfig, ProxySelectionStrategy};
use crate::error::{Error, NoProxyAvailable, ParseError};
use crate::health::{HealthProber, HealthReport};
use crate::proxy::{FailureCause, ProxyId, ProxyRecord, ProxyStats};
use crate::source;
use crate::transport::{ReqwestTransport, Transport};

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use url::Url;

/// Result of using a proxy, reported back to the pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// The proxy delivered a response.
    Success { latency: Duration },
    /// The target throttled us. The proxy cools down, it is not dead.
    RateLimited { retry_after: Option<Duration> },
    /// The proxy failed in a way attributable to the proxy.
    Failure { cause: FailureCause },
}

/// Counts from loading a proxy list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub added: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Derived lifecycle state of one proxy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProxyState {
    Eligible,
    Dead { since: DateTime<Utc> },
    CoolingDown { remaining: Duration },
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub record: ProxyRecord,
    #[serde(flatten)]
    pub state: ProxyState,
    pub stats: ProxyStats,
}

/// Point-in-time copy of the pool for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub total: usize,
    pub eligible: usize,
    pub dead: usize,
    pub cooling_down: usize,
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Default)]
struct PoolState {
    /// Insertion order is rotation order.
    records: Vec<ProxyRecord>,
    cursor: usize,
    dead: HashMap<ProxyId, DateTime<Utc>>,
    /// Cooldown expiry, removed lazily once elapsed.
    rate_limited: HashMap<ProxyId, Instant>,
    stats: HashMap<ProxyId, ProxyStats>,
    limiters: HashMap<ProxyId, Arc<DefaultDirectRateLimiter>>,
}

impl PoolState {
    fn insert(&mut self, record: ProxyRecord, max_rps: f64) -> bool {
        if self.stats.contains_key(&record.id) {
            return false;
        }
        let quota = Quota::per_second(NonZeroU32::new(max_rps.ceil() as u32).unwrap_or(NonZeroU32::MIN));
        self.limiters
            .insert(record.id.clone(), Arc::new(RateLimiter::direct(quota)));
        self.stats.insert(record.id.clone(), ProxyStats::default());
        self.records.push(record);
        true
    }

    fn contains(&self, id: &ProxyId) -> bool {
        self.stats.contains_key(id)
    }

    fn is_rotating(&self, id: &ProxyId) -> bool {
        self.records.iter().any(|r| &r.id == id && r.is_rotating)
    }

    fn is_cooling_down(&mut self, id: &ProxyId, now: Instant) -> bool {
        match self.rate_limited.get(id) {
            Some(expiry) if now < *expiry => true,
            Some(_) => {
                self.rate_limited.remove(id);
                false
            }
            None => false,
        }
    }

    fn is_eligible(&mut self, id: &ProxyId, now: Instant) -> bool {
        !self.dead.contains_key(id) && !self.is_cooling_down(id, now)
    }

    fn next_round_robin(&mut self, now: Instant) -> Result<ProxyRecord, NoProxyAvailable> {
        let len = self.records.len();
        for _ in 0..len {
            let idx = self.cursor % len;
            self.cursor = (idx + 1) % len;
            let id = self.records[idx].id.clone();
            if self.is_eligible(&id, now) {
                return Ok(self.records[idx].clone());
            }
        }
        Err(self.exhaustion_reason(now))
    }

    fn pick_random(
        &mut self,
        excluded: &HashSet<ProxyId>,
        now: Instant,
    ) -> Result<ProxyRecord, NoProxyAvailable> {
        let ids: Vec<ProxyId> = self.records.iter().map(|r| r.id.clone()).collect();
        let candidates: Vec<usize> = ids
            .iter()
            .enumerate()
            .filter(|(_, id)| !excluded.contains(*id))
            .filter(|(_, id)| self.is_eligible(id, now))
            .map(|(idx, _)| idx)
            .collect();

        match candidates.choose(&mut rand::rng()) {
            Some(&idx) => Ok(self.records[idx].clone()),
            None => Err(self.exhaustion_reason(now)),
        }
    }

    fn exhaustion_reason(&mut self, now: Instant) -> NoProxyAvailable {
        if self.records.is_empty() {
            return NoProxyAvailable::Empty;
        }
        let ids: Vec<ProxyId> = self.records.iter().map(|r| r.id.clone()).collect();
        let mut cooling = false;
        for id in &ids {
            if self.dead.contains_key(id) {
                continue;
            }
            if !self.is_cooling_down(id, now) {
                return NoProxyAvailable::HealthCheckFailed;
            }
            cooling = true;
        }
        if cooling {
            NoProxyAvailable::AllCoolingDown
        } else {
            NoProxyAvailable::AllDead
        }
    }

    fn mark_dead(&mut self, id: &ProxyId) -> bool {
        if !self.contains(id) || self.dead.contains_key(id) {
            return false;
        }
        self.rate_limited.remove(id);
        self.dead.insert(id.clone(), Utc::now());
        true
    }

    /// Counts a consecutive failure and marks the proxy dead once it crosses
    /// its threshold. Rotating gateways get `rotating_threshold`, others die on
    /// the first failure.
    fn note_failure(&mut self, id: &ProxyId, cause: FailureCause, rotating_threshold: u32) -> bool {
        let threshold = if self.is_rotating(id) { rotating_threshold } else { 1 };
        let Some(stats) = self.stats.get_mut(id) else {
            return false;
        };
        stats.consecutive_failures += 1;
        stats.last_failure = Some(cause);
        if stats.consecutive_failures >= threshold {
            self.mark_dead(id)
        } else {
            false
        }
    }

    fn state_of(&mut self, id: &ProxyId, now: Instant) -> ProxyState {
        if let Some(since) = self.dead.get(id) {
            return ProxyState::Dead { since: *since };
        }
        if self.is_cooling_down(id, now) {
            if let Some(expiry) = self.rate_limited.get(id) {
                return ProxyState::CoolingDown {
                    remaining: expiry.saturating_duration_since(now),
                };
            }
        }
        ProxyState::Eligible
    }
}

/// A pool of proxies that can be used for HTTP requests.
pub struct ProxyPool {
    state: Mutex<PoolState>,
    transport: Arc<dyn Transport>,
    prober: HealthProber,
    health_check_url: Url,
    /// Configuration for the pool.
    pub config: ProxyPoolConfig,
}

impl ProxyPool {
    /// Create a pool backed by reqwest, load its sources and start the
    /// configured health checks.
    pub async fn new(config: ProxyPoolConfig) -> Result<Arc<Self>, Error> {
        let pool = Arc::new(Self::with_transport(config, Arc::new(ReqwestTransport))?);

        let report = pool.load_sources().await;
        info!(
            "Proxy pool loaded {} proxies ({} duplicates, {} rejected)",
            report.added, report.duplicates, report.rejected
        );

        if pool.config.check_on_startup {
            info!("Starting initial health check");
            pool.check_all_proxies().await;
        }

        let (total, eligible) = pool.get_stats();
        info!("Initial proxy pool status: {}/{} eligible proxies", eligible, total);

        if let Some(interval) = pool.config.health_check_interval {
            pool.spawn_health_checks(interval);
        }

        Ok(pool)
    }

    /// Create an empty pool that sends through `transport`. Nothing is loaded.
    pub fn with_transport(config: ProxyPoolConfig, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        let health_check_url = Url::parse(&config.health_check_url)?;
        let prober = HealthProber::new(transport.clone(), config.timeouts, config.accept_invalid_certs);
        Ok(Self {
            state: Mutex::new(PoolState::default()),
            transport,
            prober,
            health_check_url,
            config,
        })
    }

    /// The transport shared by probes and the executor.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Load every configured source plus the proxy file, if present.
    pub async fn load_sources(&self) -> LoadReport {
        let mut total = LoadReport::default();
        info!("Loading proxy pool from {} sources", self.config.sources.len());

        for src in &self.config.sources {
            match source::fetch_proxy_list(src).await {
                Ok(content) => {
                    let report = self.load_from_str(&content);
                    info!("Loaded {} proxies from {}", report.added, src);
                    total.merge(report);
                }
                Err(e) => warn!("Failed to load proxies from {}: {}", src, e),
            }
        }

        if let Some(path) = &self.config.proxy_file {
            match self.load_from_file(path).await {
                Ok(report) => total.merge(report),
                Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    debug!("Proxy file {} does not exist yet", path.display());
                }
                Err(e) => warn!("Failed to load proxy file {}: {}", path.display(), e),
            }
        }

        total
    }

    /// Load a newline-delimited proxy list.
    pub fn load_from_str(&self, content: &str) -> LoadReport {
        let parsed = source::parse_proxy_list(content);
        let mut report = LoadReport {
            rejected: parsed.rejected.len(),
            ..LoadReport::default()
        };

        let mut state = self.state.lock();
        for record in parsed.records {
            if state.insert(record, self.config.max_requests_per_second) {
                report.added += 1;
            } else {
                report.duplicates += 1;
            }
        }
        report
    }

    /// Load a proxy list file.
    pub async fn load_from_file(&self, path: impl AsRef<Path>) -> Result<LoadReport, Error> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(self.load_from_str(&content))
    }

    /// Parse and add one proxy. Returns `false` if it was already present.
    pub fn add(&self, raw: &str) -> Result<bool, ParseError> {
        Ok(self.add_record(ProxyRecord::parse(raw)?))
    }

    /// Add a parsed proxy. Returns `false` if it was already present.
    pub fn add_record(&self, record: ProxyRecord) -> bool {
        self.state.lock().insert(record, self.config.max_requests_per_second)
    }

    /// Number of proxies in the pool, dead ones included.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether the pool holds no proxies.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records in rotation order.
    pub fn records(&self) -> Vec<ProxyRecord> {
        self.state.lock().records.clone()
    }

    /// Acquire a proxy with the configured selection strategy.
    pub async fn acquire_next(&self, require_health_check: bool) -> Result<ProxyRecord, NoProxyAvailable> {
        match self.config.selection_strategy {
            ProxySelectionStrategy::RoundRobin => self.acquire(require_health_check).await,
            ProxySelectionStrategy::Random => self.acquire_random(require_health_check).await,
        }
    }

    /// Next eligible proxy in round-robin order.
    ///
    /// Dead and cooling-down proxies are skipped. With `require_health_check`
    /// each candidate is probed first and a failing one is charged a failure
    /// before the next is tried. At most one pass over the pool is made.
    pub async fn acquire(&self, require_health_check: bool) -> Result<ProxyRecord, NoProxyAvailable> {
        let budget = self.len();
        for _ in 0..budget {
            let candidate = self.state.lock().next_round_robin(Instant::now())?;
            if !require_health_check || self.verify(&candidate).await {
                return Ok(candidate);
            }
        }
        Err(self.state.lock().exhaustion_reason(Instant::now()))
    }

    /// Uniformly random eligible proxy, with the same health-check semantics
    /// as [`ProxyPool::acquire`].
    pub async fn acquire_random(&self, require_health_check: bool) -> Result<ProxyRecord, NoProxyAvailable> {
        let mut excluded = HashSet::new();
        loop {
            let candidate = self.state.lock().pick_random(&excluded, Instant::now())?;
            if !require_health_check || self.verify(&candidate).await {
                return Ok(candidate);
            }
            excluded.insert(candidate.id);
        }
    }

    async fn verify(&self, record: &ProxyRecord) -> bool {
        let result = self
            .prober
            .probe(record, &self.health_check_url, self.config.timeouts.total)
            .await;

        let mut state = self.state.lock();
        if result.alive {
            if let Some(stats) = state.stats.get_mut(&record.id) {
                stats.record_latency(result.latency);
                stats.consecutive_failures = 0;
            }
            return true;
        }

        let error = result.error.unwrap_or_default();
        if state.note_failure(&record.id, FailureCause::HealthCheck, self.config.rotating_failure_threshold) {
            warn!("Proxy {} marked dead after failed health check: {}", record.redacted(), error);
        } else {
            debug!("Proxy {} failed health check: {}", record.redacted(), error);
        }
        false
    }

    /// Record the outcome of using a proxy.
    pub fn report_outcome(&self, id: &ProxyId, outcome: Outcome) {
        let mut state = self.state.lock();
        let Some(stats) = state.stats.get_mut(id) else {
            debug!("Ignoring outcome for unknown proxy {}", id);
            return;
        };
        stats.used_count += 1;
        stats.last_used_at = Some(Utc::now());

        match outcome {
            Outcome::Success { latency } => {
                stats.success_count += 1;
                stats.consecutive_failures = 0;
                stats.record_latency(latency);
            }
            Outcome::RateLimited { retry_after } => {
                stats.rate_limited_count += 1;
                if state.dead.contains_key(id) {
                    return;
                }
                let cooldown = retry_after
                    .map_or(self.config.rate_limit_cooldown, |d| d.max(self.config.rate_limit_cooldown));
                state.rate_limited.insert(id.clone(), Instant::now() + cooldown);
                warn!("Proxy {} rate limited, cooling down for {:?}", id, cooldown);
            }
            Outcome::Failure { cause } => {
                stats.failed_count += 1;
                if state.note_failure(id, cause, self.config.rotating_failure_threshold) {
                    warn!("Proxy {} marked dead: {:?}", id, cause);
                }
            }
        }
    }

    /// Take a proxy out of rotation until [`ProxyPool::reset_dead`].
    pub fn mark_dead(&self, id: &ProxyId) -> bool {
        self.state.lock().mark_dead(id)
    }

    /// Bring every dead proxy back. Returns how many were revived.
    pub fn reset_dead(&self) -> usize {
        let mut state = self.state.lock();
        let revived: Vec<ProxyId> = state.dead.drain().map(|(id, _)| id).collect();
        for id in &revived {
            if let Some(stats) = state.stats.get_mut(id) {
                stats.consecutive_failures = 0;
            }
        }
        if !revived.is_empty() {
            info!("Reset {} dead proxies", revived.len());
        }
        revived.len()
    }

    /// Put a proxy in cooldown for `cooldown` without touching its stats.
    pub fn mark_rate_limited(&self, id: &ProxyId, cooldown: Duration) {
        let mut state = self.state.lock();
        if state.contains(id) && !state.dead.contains_key(id) {
            state.rate_limited.insert(id.clone(), Instant::now() + cooldown);
        }
    }

    /// Whether the proxy has been taken out of rotation.
    pub fn is_dead(&self, id: &ProxyId) -> bool {
        self.state.lock().dead.contains_key(id)
    }

    /// Whether the proxy is waiting out a rate-limit cooldown.
    pub fn is_cooling_down(&self, id: &ProxyId) -> bool {
        self.state.lock().is_cooling_down(id, Instant::now())
    }

    /// Usage counters for one proxy.
    pub fn stats(&self, id: &ProxyId) -> Option<ProxyStats> {
        self.state.lock().stats.get(id).cloned()
    }

    /// Per-proxy request rate limiter.
    pub fn limiter(&self, id: &ProxyId) -> Option<Arc<DefaultDirectRateLimiter>> {
        self.state.lock().limiters.get(id).cloned()
    }

    /// Get `(total, eligible)` proxy counts.
    pub fn get_stats(&self) -> (usize, usize) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let ids: Vec<ProxyId> = state.records.iter().map(|r| r.id.clone()).collect();
        let eligible = ids.iter().filter(|id| state.is_eligible(id, now)).count();
        (ids.len(), eligible)
    }

    /// Point-in-time view of every proxy with its state and stats.
    pub fn snapshot(&self) -> PoolSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock();
        let records = state.records.clone();

        let entries: Vec<SnapshotEntry> = records
            .into_iter()
            .map(|record| {
                let proxy_state = state.state_of(&record.id, now);
                let stats = state.stats.get(&record.id).cloned().unwrap_or_default();
                SnapshotEntry {
                    record,
                    state: proxy_state,
                    stats,
                }
            })
            .collect();

        let count = |f: fn(&ProxyState) -> bool| entries.iter().filter(|e| f(&e.state)).count();
        PoolSnapshot {
            total: entries.len(),
            eligible: count(|s| matches!(s, ProxyState::Eligible)),
            dead: count(|s| matches!(s, ProxyState::Dead { .. })),
            cooling_down: count(|s| matches!(s, ProxyState::CoolingDown { .. })),
            entries,
        }
    }

    /// Probe every proxy that is not dead and mark failures.
    ///
    /// Dead proxies are not probed, so nothing is resurrected here. Proxies
    /// that pass are appended to the configured proxy file.
    pub async fn check_all_proxies(&self) -> HealthReport {
        let candidates: Vec<ProxyRecord> = {
            let state = self.state.lock();
            state
                .records
                .iter()
                .filter(|r| !state.dead.contains_key(&r.id))
                .cloned()
                .collect()
        };
        info!("Starting health check for {} proxies", candidates.len());

        let results = self
            .prober
            .probe_all(candidates, &self.health_check_url, self.config.probe_concurrency)
            .await;

        let mut report = HealthReport {
            checked: results.len(),
            ..HealthReport::default()
        };
        let mut alive = Vec::new();
        {
            let mut state = self.state.lock();
            for (record, result) in results {
                if result.alive {
                    if let Some(stats) = state.stats.get_mut(&record.id) {
                        stats.record_latency(result.latency);
                        stats.consecutive_failures = 0;
                    }
                    report.alive += 1;
                    alive.push(record.to_string());
                } else if state.note_failure(
                    &record.id,
                    FailureCause::HealthCheck,
                    self.config.rotating_failure_threshold,
                ) {
                    report.marked_dead += 1;
                    debug!(
                        "Proxy {} failed health check: {}",
                        record.redacted(),
                        result.error.unwrap_or_default()
                    );
                }
            }
        }

        if let Some(path) = &self.config.proxy_file {
            match source::append_proxies(path, alive).await {
                Ok(0) => {}
                Ok(written) => info!("Saved {} validated proxies to {}", written, path.display()),
                Err(e) => warn!("Failed to save validated proxies to {}: {}", path.display(), e),
            }
        }

        info!(
            "Health check completed: {} alive, {} marked dead",
            report.alive, report.marked_dead
        );
        report
    }

    /// Append every proxy that is not dead to `path`.
    pub async fn save_eligible(&self, path: impl AsRef<Path>) -> Result<usize, Error> {
        let lines: Vec<String> = {
            let state = self.state.lock();
            state
                .records
                .iter()
                .filter(|r| !state.dead.contains_key(&r.id))
                .map(ToString::to_string)
                .collect()
        };
        source::append_proxies(path.as_ref(), lines).await
    }

    /// Run [`ProxyPool::check_all_proxies`] every `interval` until the pool is dropped.
    pub fn spawn_health_checks(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                time::sleep(interval).await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.check_all_proxies().await;

                let (total, eligible) = pool.get_stats();
                info!("Proxy pool status update: {}/{} eligible proxies", eligible, total);
            }
        })
    }
}

impl LoadReport {
    fn merge(&mut self, other: LoadReport) {
        self.added += other.added;
        self.duplicates += other.duplicates;
        self.rejected += other.rejected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{reply, MockTransport};
    use crate::transport::TransportError;

    const SCENARIO: &str = "http://10.0.0.1:8080\nsocks5://10.0.0.2:1080\n# comment\n";

    fn config() -> ProxyPoolConfig {
        ProxyPoolConfig::builder()
            .health_check_url("http://probe.test/ip")
            .rate_limit_cooldown(Duration::from_secs(60))
            .build()
    }

    fn pool_with(transport: MockTransport, content: &str) -> ProxyPool {
        let pool = ProxyPool::with_transport(config(), Arc::new(transport)).unwrap();
        pool.load_from_str(content);
        pool
    }

    fn pool(content: &str) -> ProxyPool {
        pool_with(MockTransport::always(200), content)
    }

    fn ids(pool: &ProxyPool) -> Vec<ProxyId> {
        pool.records().into_iter().map(|r| r.id).collect()
    }

    #[tokio::test]
    async fn test_load_scenario_and_round_robin_wraps() {
        let pool = pool(SCENARIO);
        assert_eq!(pool.len(), 2);

        let first = pool.acquire(false).await.unwrap();
        let second = pool.acquire(false).await.unwrap();
        let third = pool.acquire(false).await.unwrap();
        assert_eq!(first.host, "10.0.0.1");
        assert_eq!(second.host, "10.0.0.2");
        assert_eq!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_round_robin_returns_each_record_once_per_cycle() {
        let pool = pool("10.0.0.1:1\n10.0.0.2:2\n10.0.0.3:3\n10.0.0.4:4\n");
        let mut seen = HashSet::new();
        for _ in 0..4 {
            assert!(seen.insert(pool.acquire(false).await.unwrap().id));
        }
        assert_eq!(pool.acquire(false).await.unwrap().id, ids(&pool)[0]);
    }

    #[tokio::test]
    async fn test_duplicates_collapse() {
        let pool = pool("10.0.0.1:8080\nhttp://10.0.0.1:8080\nsocks5://10.0.0.1:8080\n");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.add("10.0.0.1:8080"), Ok(false));
        assert_eq!(pool.add("10.0.0.5:8080"), Ok(true));
        assert!(pool.add("nonsense").is_err());
    }

    #[tokio::test]
    async fn test_dead_proxy_is_never_returned_until_reset() {
        let pool = pool("10.0.0.1:1\n10.0.0.2:2\n10.0.0.3:3\n");
        let dead = ids(&pool)[1].clone();
        assert!(pool.mark_dead(&dead));

        for _ in 0..20 {
            assert_ne!(pool.acquire(false).await.unwrap().id, dead);
            assert_ne!(pool.acquire_random(false).await.unwrap().id, dead);
        }

        assert_eq!(pool.reset_dead(), 1);
        let mut returned = HashSet::new();
        for _ in 0..3 {
            returned.insert(pool.acquire(false).await.unwrap().id);
        }
        assert!(returned.contains(&dead));
    }

    #[tokio::test]
    async fn test_exhaustion_reasons() {
        let empty = pool("");
        assert_eq!(empty.acquire(false).await, Err(NoProxyAvailable::Empty));
        assert_eq!(empty.acquire_random(false).await, Err(NoProxyAvailable::Empty));

        let pool = pool("10.0.0.1:1\n10.0.0.2:2\n");
        let all = ids(&pool);
        pool.mark_dead(&all[0]);
        pool.report_outcome(&all[1], Outcome::RateLimited { retry_after: None });
        assert_eq!(pool.acquire(false).await, Err(NoProxyAvailable::AllCoolingDown));

        pool.mark_dead(&all[1]);
        assert_eq!(pool.acquire(false).await, Err(NoProxyAvailable::AllDead));
        assert_eq!(pool.acquire_random(false).await, Err(NoProxyAvailable::AllDead));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_expires_lazily() {
        let pool = pool("10.0.0.1:1\n10.0.0.2:2\n");
        let limited = ids(&pool)[0].clone();
        pool.report_outcome(&limited, Outcome::RateLimited { retry_after: None });
        assert!(pool.is_cooling_down(&limited));
        assert!(!pool.is_dead(&limited));

        for _ in 0..4 {
            assert_ne!(pool.acquire(false).await.unwrap().id, limited);
        }

        time::advance(Duration::from_secs(59)).await;
        assert_ne!(pool.acquire(false).await.unwrap().id, limited);

        time::advance(Duration::from_secs(1)).await;
        let mut returned = HashSet::new();
        for _ in 0..2 {
            returned.insert(pool.acquire(false).await.unwrap().id);
        }
        assert!(returned.contains(&limited));
        assert!(!pool.is_cooling_down(&limited));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_extends_cooldown() {
        let pool = pool("10.0.0.1:1\n");
        let id = ids(&pool)[0].clone();
        pool.report_outcome(
            &id,
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(300)),
            },
        );

        time::advance(Duration::from_secs(120)).await;
        assert!(pool.is_cooling_down(&id));
        time::advance(Duration::from_secs(180)).await;
        assert!(!pool.is_cooling_down(&id));
    }

    #[tokio::test]
    async fn test_health_checked_acquire_marks_failures_dead() {
        let transport = MockTransport::new(|route, _| {
            if route.proxy_url.port() == Some(1) {
                Err(TransportError::Connect("refused".into()))
            } else {
                Ok(reply(200))
            }
        });
        let pool = pool_with(transport, "10.0.0.1:1\n10.0.0.2:2\n");
        let all = ids(&pool);

        let acquired = pool.acquire(true).await.unwrap();
        assert_eq!(acquired.id, all[1]);
        assert!(pool.is_dead(&all[0]));
        assert_eq!(pool.stats(&all[0]).unwrap().last_failure, Some(FailureCause::HealthCheck));
        assert!(pool.stats(&all[1]).unwrap().average_latency.is_some());
    }

    #[tokio::test]
    async fn test_health_checked_acquire_exhausts() {
        let pool = pool_with(MockTransport::always(502), "10.0.0.1:1\n10.0.0.2:2\n");
        assert_eq!(pool.acquire(true).await, Err(NoProxyAvailable::AllDead));

        let pool = pool_with(MockTransport::always(502), "10.0.0.1:1\n10.0.0.2:2\n");
        assert_eq!(pool.acquire_random(true).await, Err(NoProxyAvailable::AllDead));
        assert_eq!(pool.snapshot().dead, 2);
    }

    #[tokio::test]
    async fn test_failed_check_on_live_gateway_is_not_all_dead() {
        let pool = pool_with(MockTransport::always(502), "rotating://gw.example.com:8000\n");
        assert_eq!(pool.acquire(true).await, Err(NoProxyAvailable::HealthCheckFailed));
        assert_eq!(pool.acquire_random(true).await, Err(NoProxyAvailable::HealthCheckFailed));
        assert_eq!(pool.snapshot().dead, 0);

        assert_eq!(pool.acquire(true).await, Err(NoProxyAvailable::AllDead));
        assert_eq!(pool.snapshot().dead, 1);
    }

    #[tokio::test]
    async fn test_rotating_gateway_survives_isolated_failures() {
        let pool = pool("rotating://gw.example.com:8000\n10.0.0.2:2\n");
        let all = ids(&pool);
        let failure = Outcome::Failure {
            cause: FailureCause::Timeout,
        };

        pool.report_outcome(&all[0], failure);
        pool.report_outcome(&all[0], failure);
        assert!(!pool.is_dead(&all[0]));
        pool.report_outcome(&all[0], failure);
        assert!(pool.is_dead(&all[0]));

        pool.report_outcome(&all[1], failure);
        assert!(pool.is_dead(&all[1]));
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let pool = pool("rotating://gw.example.com:8000\n");
        let id = ids(&pool)[0].clone();
        let failure = Outcome::Failure {
            cause: FailureCause::ServerError(502),
        };

        pool.report_outcome(&id, failure);
        pool.report_outcome(&id, failure);
        pool.report_outcome(
            &id,
            Outcome::Success {
                latency: Duration::from_millis(40),
            },
        );
        pool.report_outcome(&id, failure);
        assert!(!pool.is_dead(&id));
    }

    #[tokio::test]
    async fn test_report_outcome_updates_stats() {
        let pool = pool("10.0.0.1:1\n10.0.0.2:2\n");
        let id = ids(&pool)[0].clone();

        pool.report_outcome(&id, Outcome::Success { latency: Duration::from_millis(100) });
        pool.report_outcome(&id, Outcome::Success { latency: Duration::from_millis(300) });
        pool.report_outcome(&id, Outcome::RateLimited { retry_after: None });

        let stats = pool.stats(&id).unwrap();
        assert_eq!(stats.used_count, 3);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.rate_limited_count, 1);
        assert_eq!(stats.failed_count, 0);
        assert_eq!(stats.average_latency, Some(Duration::from_millis(200)));
        assert!(stats.last_used_at.is_some());
        assert!(!pool.is_dead(&id));

        pool.report_outcome(&id, Outcome::Failure { cause: FailureCause::Connect });
        assert!(pool.is_dead(&id));
        assert!(!pool.is_cooling_down(&id));
    }

    #[tokio::test]
    async fn test_rate_limit_does_not_touch_dead_proxy() {
        let pool = pool("10.0.0.1:1\n");
        let id = ids(&pool)[0].clone();
        pool.mark_dead(&id);
        pool.report_outcome(&id, Outcome::RateLimited { retry_after: None });
        pool.mark_rate_limited(&id, Duration::from_secs(30));
        assert!(!pool.is_cooling_down(&id));
        assert_eq!(pool.snapshot().dead, 1);
    }

    #[tokio::test]
    async fn test_snapshot_counts_states() {
        let pool = pool("10.0.0.1:1\n10.0.0.2:2\n10.0.0.3:3\n");
        let all = ids(&pool);
        pool.mark_dead(&all[0]);
        pool.mark_rate_limited(&all[1], Duration::from_secs(30));

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.eligible, 1);
        assert_eq!(snapshot.dead, 1);
        assert_eq!(snapshot.cooling_down, 1);
        assert!(matches!(snapshot.entries[2].state, ProxyState::Eligible));
        assert_eq!(pool.get_stats(), (3, 1));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["entries"][0]["state"], "dead");
        assert!(json["entries"][0]["record"].get("password").is_none());
    }

    #[tokio::test]
    async fn test_check_all_proxies_marks_dead_and_persists_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validated.txt");
        let config = ProxyPoolConfig::builder()
            .health_check_url("http://probe.test/ip")
            .proxy_file(&path)
            .build();
        let transport = MockTransport::new(|route, _| {
            if route.proxy_url.port() == Some(2) {
                Ok(reply(500))
            } else {
                Ok(reply(200))
            }
        });
        let pool = ProxyPool::with_transport(config, Arc::new(transport)).unwrap();
        pool.load_from_str("10.0.0.1:1\n10.0.0.2:2\n10.0.0.3:3\n");

        let report = pool.check_all_proxies().await;
        assert_eq!(report, HealthReport { checked: 3, alive: 2, marked_dead: 1 });
        assert_eq!(pool.get_stats(), (3, 2));

        let saved = source::parse_proxy_list(&tokio::fs::read_to_string(&path).await.unwrap());
        assert_eq!(saved.records.len(), 2);

        let second = pool.check_all_proxies().await;
        assert_eq!(second.checked, 2);
        let saved = source::parse_proxy_list(&tokio::fs::read_to_string(&path).await.unwrap());
        assert_eq!(saved.records.len(), 2);
    }

    #[tokio::test]
    async fn test_load_sources_reads_files_and_proxy_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.txt");
        let saved = dir.path().join("saved.txt");
        tokio::fs::write(&list, "10.0.0.1:1\nbroken\n").await.unwrap();
        tokio::fs::write(&saved, "10.0.0.1:1\n10.0.0.2:2\n").await.unwrap();

        let config = ProxyPoolConfig::builder()
            .health_check_url("http://probe.test/ip")
            .sources(vec![list.to_str().unwrap(), "/nonexistent/list.txt"])
            .proxy_file(&saved)
            .build();
        let pool = ProxyPool::with_transport(config, Arc::new(MockTransport::always(200))).unwrap();

        let report = pool.load_sources().await;
        assert_eq!(report, LoadReport { added: 2, duplicates: 1, rejected: 1 });
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_marks_failures() {
        let pool = Arc::new(pool_with(MockTransport::always(500), "10.0.0.1:1\n10.0.0.2:2\n"));
        let handle = pool.spawn_health_checks(Duration::from_secs(30));

        time::sleep(Duration::from_secs(29)).await;
        assert_eq!(pool.snapshot().dead, 0);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pool.snapshot().dead, 2);
        handle.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_keeps_rotation_fair() {
        let pool = Arc::new(pool("10.0.0.1:1\n10.0.0.2:2\n10.0.0.3:3\n10.0.0.4:4\n"));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mut picked = Vec::new();
                for _ in 0..10 {
                    picked.push(pool.acquire(false).await.unwrap().id);
                }
                picked
            }));
        }

        let mut counts: HashMap<ProxyId, usize> = HashMap::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                *counts.entry(id).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&n| n == 25));
    }
}
