//! Adaptive per-host rate limiting
//!
//! Each host gets a token bucket with a concurrency cap. The bucket state is
//! owned by a single actor task; callers talk to it through [`RateLimiter`]
//! handles over a request/response channel. Admission is cooperative: a
//! caller that cannot be admitted waits in a FIFO queue until tokens refill
//! or a permit is released.
//!
//! The control loop halves the sustained rate on HTTP 429 (plus a cooldown),
//! quarters it on HTTP 503 (plus a longer pause), and adds `recovery_step`
//! back for every error-free `recovery_window_secs` until the configured
//! ceiling is reached again.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::domain::RateLimitConfig;

/// Lowest rate the adaptive loop will fall to
const MIN_RATE: f64 = 0.1;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limiter service has shut down")]
    Closed,
}

/// A change the adaptive loop made to a host's sustained rate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateAdjustment {
    pub host: String,
    pub status: u16,
    pub previous_rate: f64,
    pub new_rate: f64,
    pub pause_secs: u64,
    pub consecutive_errors: u32,
}

/// Point-in-time view of one host's limiter state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateSnapshot {
    pub rate: f64,
    pub ceiling: f64,
    pub tokens: f64,
    pub in_flight: u32,
    pub max_in_flight_observed: u32,
    pub max_concurrent: u32,
    pub consecutive_errors: u32,
    pub paused: bool,
    pub granted: u64,
}

/// Plain token bucket
#[derive(Debug, Clone)]
struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, capacity: f64, now: Instant) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until one token is available (zero if available now)
    fn wait_time(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let missing = 1.0 - self.tokens;
        Duration::from_secs_f64(missing / self.rate.max(MIN_RATE))
    }
}

/// Why a caller cannot be admitted right now
#[derive(Debug, Clone, Copy, PartialEq)]
enum Admission {
    Granted,
    /// Wait for a release
    AtConcurrencyLimit,
    /// Retry at the given instant
    RetryAt(Instant),
}

/// Rate state for one host. Pure: every method takes `now`.
#[derive(Debug, Clone)]
struct HostBucket {
    config: RateLimitConfig,
    ceiling: f64,
    bucket: TokenBucket,
    endpoints: HashMap<String, TokenBucket>,
    in_flight: u32,
    max_in_flight_observed: u32,
    consecutive_errors: u32,
    paused_until: Option<Instant>,
    last_adjusted: Instant,
    last_grant: Option<Instant>,
    granted: u64,
}

impl HostBucket {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        let ceiling = config.requests_per_second.max(MIN_RATE);
        let capacity = f64::from(config.burst.max(1));
        Self {
            bucket: TokenBucket::new(ceiling, capacity, now),
            endpoints: HashMap::new(),
            ceiling,
            config,
            in_flight: 0,
            max_in_flight_observed: 0,
            consecutive_errors: 0,
            paused_until: None,
            last_adjusted: now,
            last_grant: None,
            granted: 0,
        }
    }

    fn endpoint_key(&self, path: Option<&str>) -> Option<(String, f64)> {
        let path = path?;
        self.config
            .per_endpoint
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, rps)| (prefix.clone(), *rps))
    }

    /// Additive increase toward the ceiling for every error-free window
    fn recover(&mut self, now: Instant) {
        if self.bucket.rate >= self.ceiling {
            return;
        }
        let window = Duration::from_secs(self.config.recovery_window_secs.max(1));
        let since = now.saturating_duration_since(self.last_adjusted);
        let windows = (since.as_secs_f64() / window.as_secs_f64()).floor();
        if windows >= 1.0 {
            let step = self.config.recovery_step.max(0.0);
            self.bucket.rate = (self.bucket.rate + step * windows).min(self.ceiling);
            self.last_adjusted += window.mul_f64(windows);
            self.consecutive_errors = 0;
        }
    }

    fn try_admit(&mut self, path: Option<&str>, now: Instant) -> Admission {
        self.recover(now);

        if let Some(until) = self.paused_until {
            if now < until {
                return Admission::RetryAt(until);
            }
            self.paused_until = None;
        }
        if self.in_flight >= self.config.max_concurrent.max(1) {
            return Admission::AtConcurrencyLimit;
        }
        if let Some(last) = self.last_grant {
            let spacing = Duration::from_millis(self.config.delay_ms);
            if now < last + spacing {
                return Admission::RetryAt(last + spacing);
            }
        }

        self.bucket.refill(now);
        let mut wait = self.bucket.wait_time();

        let endpoint = self.endpoint_key(path);
        if let Some((prefix, rps)) = &endpoint {
            let capacity = self.bucket.capacity;
            let ep = self
                .endpoints
                .entry(prefix.clone())
                .or_insert_with(|| TokenBucket::new(rps.max(MIN_RATE), capacity, now));
            ep.refill(now);
            wait = wait.max(ep.wait_time());
        }

        if !wait.is_zero() {
            return Admission::RetryAt(now + wait);
        }

        self.bucket.tokens -= 1.0;
        if let Some((prefix, _)) = endpoint {
            if let Some(ep) = self.endpoints.get_mut(&prefix) {
                ep.tokens -= 1.0;
            }
        }
        self.in_flight += 1;
        self.max_in_flight_observed = self.max_in_flight_observed.max(self.in_flight);
        self.last_grant = Some(now);
        self.granted += 1;
        Admission::Granted
    }

    fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Feed one observed HTTP status into the control loop
    fn observe(&mut self, status: u16, now: Instant) -> Option<(f64, f64, u64)> {
        let (factor, pause) = match status {
            429 => (0.5, self.config.cooldown_429_secs),
            503 => (0.25, self.config.pause_503_secs),
            _ => {
                self.recover(now);
                return None;
            }
        };
        let previous = self.bucket.rate;
        self.bucket.refill(now);
        self.bucket.rate = (previous * factor).max(MIN_RATE);
        self.bucket.tokens = self.bucket.tokens.min(0.0);
        self.consecutive_errors += 1;
        self.last_adjusted = now;
        let until = now + Duration::from_secs(pause);
        self.paused_until = Some(self.paused_until.map_or(until, |p| p.max(until)));
        Some((previous, self.bucket.rate, pause))
    }

    fn snapshot(&self, now: Instant) -> RateSnapshot {
        RateSnapshot {
            rate: self.bucket.rate,
            ceiling: self.ceiling,
            tokens: self.bucket.tokens,
            in_flight: self.in_flight,
            max_in_flight_observed: self.max_in_flight_observed,
            max_concurrent: self.config.max_concurrent,
            consecutive_errors: self.consecutive_errors,
            paused: self.paused_until.is_some_and(|p| now < p),
            granted: self.granted,
        }
    }
}

struct Waiter {
    path: Option<String>,
    reply: oneshot::Sender<()>,
}

struct HostState {
    bucket: HostBucket,
    waiters: VecDeque<Waiter>,
    retry_at: Option<Instant>,
}

enum Command {
    Configure {
        host: String,
        config: RateLimitConfig,
    },
    Acquire {
        host: String,
        path: Option<String>,
        reply: oneshot::Sender<()>,
    },
    Release {
        host: String,
    },
    Observe {
        host: String,
        status: u16,
        reply: oneshot::Sender<Option<RateAdjustment>>,
    },
    Snapshot {
        host: String,
        reply: oneshot::Sender<Option<RateSnapshot>>,
    },
}

/// Handle to the rate limiter actor. Cheap to clone.
#[derive(Clone)]
pub struct RateLimiter {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

/// Admission to send traffic to a host. Dropping it releases the slot.
#[derive(Debug)]
pub struct RatePermit {
    host: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl RatePermit {
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Release {
            host: std::mem::take(&mut self.host),
        });
    }
}

impl RateLimiter {
    /// Start the actor on the current tokio runtime. Hosts without an explicit
    /// configuration use `defaults`.
    pub fn spawn(defaults: RateLimitConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Actor::new(defaults).run(rx));
        Self { tx }
    }

    /// Set the configuration for one host, resetting its adaptive state
    pub fn configure(&self, host: &str, config: RateLimitConfig) -> Result<(), RateLimitError> {
        self.tx
            .send(Command::Configure {
                host: host.to_ascii_lowercase(),
                config,
            })
            .map_err(|_| RateLimitError::Closed)
    }

    /// Wait for admission to send traffic to `host` (optionally to `path`)
    pub async fn acquire(&self, host: &str, path: Option<&str>) -> Result<RatePermit, RateLimitError> {
        let host = host.to_ascii_lowercase();
        let (reply, granted) = oneshot::channel();
        self.tx
            .send(Command::Acquire {
                host: host.clone(),
                path: path.map(str::to_string),
                reply,
            })
            .map_err(|_| RateLimitError::Closed)?;
        granted.await.map_err(|_| RateLimitError::Closed)?;
        Ok(RatePermit {
            host,
            tx: self.tx.clone(),
        })
    }

    /// Report an observed HTTP status for `host`
    pub async fn observe(&self, host: &str, status: u16) -> Result<Option<RateAdjustment>, RateLimitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Observe {
                host: host.to_ascii_lowercase(),
                status,
                reply,
            })
            .map_err(|_| RateLimitError::Closed)?;
        rx.await.map_err(|_| RateLimitError::Closed)
    }

    pub async fn snapshot(&self, host: &str) -> Result<Option<RateSnapshot>, RateLimitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot {
                host: host.to_ascii_lowercase(),
                reply,
            })
            .map_err(|_| RateLimitError::Closed)?;
        rx.await.map_err(|_| RateLimitError::Closed)
    }
}

struct Actor {
    defaults: RateLimitConfig,
    hosts: HashMap<String, HostState>,
}

impl Actor {
    fn new(defaults: RateLimitConfig) -> Self {
        Self {
            defaults,
            hosts: HashMap::new(),
        }
    }

    fn host(&mut self, host: &str) -> &mut HostState {
        let defaults = &self.defaults;
        self.hosts.entry(host.to_string()).or_insert_with(|| HostState {
            bucket: HostBucket::new(defaults.clone(), Instant::now()),
            waiters: VecDeque::new(),
            retry_at: None,
        })
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let next_wake = self.hosts.values().filter_map(|h| h.retry_at).min();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = tokio::time::sleep_until(next_wake.unwrap_or_else(Instant::now)), if next_wake.is_some() => {
                    self.pump_due(Instant::now());
                }
            }
        }
        tracing::debug!("rate limiter actor stopped");
    }

    fn handle(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Configure { host, config } => {
                let state = self.host(&host);
                let in_flight = state.bucket.in_flight;
                state.bucket = HostBucket::new(config, now);
                state.bucket.in_flight = in_flight;
                state.bucket.max_in_flight_observed = in_flight;
                pump(&host, state, now);
            }
            Command::Acquire { host, path, reply } => {
                let state = self.host(&host);
                state.waiters.push_back(Waiter { path, reply });
                pump(&host, state, now);
            }
            Command::Release { host } => {
                if let Some(state) = self.hosts.get_mut(&host) {
                    state.bucket.release();
                    pump(&host, state, now);
                }
            }
            Command::Observe { host, status, reply } => {
                let state = self.host(&host);
                let adjustment = state.bucket.observe(status, now).map(|(previous, new, pause)| {
                    RateAdjustment {
                        host: host.clone(),
                        status,
                        previous_rate: previous,
                        new_rate: new,
                        pause_secs: pause,
                        consecutive_errors: state.bucket.consecutive_errors,
                    }
                });
                if let Some(adj) = &adjustment {
                    tracing::warn!(
                        "HTTP {} from {}: rate {:.2} -> {:.2} req/s, pausing {}s",
                        status,
                        host,
                        adj.previous_rate,
                        adj.new_rate,
                        adj.pause_secs
                    );
                }
                pump(&host, state, now);
                let _ = reply.send(adjustment);
            }
            Command::Snapshot { host, reply } => {
                let snapshot = self.hosts.get(&host).map(|s| s.bucket.snapshot(now));
                let _ = reply.send(snapshot);
            }
        }
    }

    fn pump_due(&mut self, now: Instant) {
        for (host, state) in self.hosts.iter_mut() {
            if state.retry_at.is_some_and(|t| t <= now) {
                pump(host, state, now);
            }
        }
    }
}

/// Admit queued waiters in FIFO order until one has to wait
fn pump(host: &str, state: &mut HostState, now: Instant) {
    state.retry_at = None;
    while let Some(waiter) = state.waiters.front() {
        if waiter.reply.is_closed() {
            state.waiters.pop_front();
            continue;
        }
        match state.bucket.try_admit(waiter.path.as_deref(), now) {
            Admission::Granted => {
                if let Some(waiter) = state.waiters.pop_front() {
                    if waiter.reply.send(()).is_err() {
                        // Caller went away between admission and reply
                        state.bucket.release();
                    }
                }
            }
            Admission::AtConcurrencyLimit => {
                tracing::trace!("{}: at concurrency limit, {} waiting", host, state.waiters.len());
                break;
            }
            Admission::RetryAt(at) => {
                state.retry_at = Some(at);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(rps: f64, burst: u32, max_concurrent: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: rps,
            burst,
            max_concurrent,
            ..Default::default()
        }
    }

    #[test]
    fn bucket_halves_on_429_and_quarters_on_503() {
        let now = Instant::now();
        let mut bucket = HostBucket::new(config(8.0, 10, 2), now);

        let (prev, new, pause) = bucket.observe(429, now).unwrap();
        assert_eq!((prev, new, pause), (8.0, 4.0, 30));
        assert!(matches!(bucket.try_admit(None, now), Admission::RetryAt(_)));

        let (prev, new, pause) = bucket.observe(503, now).unwrap();
        assert_eq!((prev, new, pause), (4.0, 1.0, 60));
        assert_eq!(bucket.consecutive_errors, 2);
        assert!(bucket.observe(200, now).is_none());
    }

    #[test]
    fn bucket_recovers_additively_toward_ceiling() {
        let start = Instant::now();
        let mut bucket = HostBucket::new(config(10.0, 10, 2), start);
        bucket.observe(429, start);
        assert_eq!(bucket.bucket.rate, 5.0);

        bucket.recover(start + Duration::from_secs(29));
        assert_eq!(bucket.bucket.rate, 5.0);
        bucket.recover(start + Duration::from_secs(30));
        assert_eq!(bucket.bucket.rate, 6.0);
        bucket.recover(start + Duration::from_secs(90));
        assert_eq!(bucket.bucket.rate, 8.0);
        bucket.recover(start + Duration::from_secs(3600));
        assert_eq!(bucket.bucket.rate, 10.0);
    }

    #[test]
    fn bucket_enforces_concurrency_and_burst() {
        let now = Instant::now();
        let mut bucket = HostBucket::new(config(1.0, 2, 5), now);
        assert_eq!(bucket.try_admit(None, now), Admission::Granted);
        assert_eq!(bucket.try_admit(None, now), Admission::Granted);
        match bucket.try_admit(None, now) {
            Admission::RetryAt(at) => assert_eq!(at - now, Duration::from_secs(1)),
            other => panic!("expected retry, got {:?}", other),
        }

        let mut bucket = HostBucket::new(config(100.0, 100, 1), now);
        assert_eq!(bucket.try_admit(None, now), Admission::Granted);
        assert_eq!(bucket.try_admit(None, now), Admission::AtConcurrencyLimit);
        bucket.release();
        assert_eq!(bucket.try_admit(None, now), Admission::Granted);
    }

    #[test]
    fn endpoint_overrides_use_longest_prefix() {
        let now = Instant::now();
        let mut cfg = config(100.0, 1, 10);
        cfg.per_endpoint.insert("/api".into(), 1.0);
        cfg.per_endpoint.insert("/api/search".into(), 0.5);
        let mut bucket = HostBucket::new(cfg, now);
        assert_eq!(bucket.endpoint_key(Some("/api/search?q=1")).unwrap().0, "/api/search");
        assert_eq!(bucket.try_admit(Some("/api/search"), now), Admission::Granted);
        assert!(matches!(
            bucket.try_admit(Some("/api/search"), now + Duration::from_millis(20)),
            Admission::RetryAt(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_concurrent() {
        let limiter = RateLimiter::spawn(config(1000.0, 1000, 3));
        let current = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire("example.com", None).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let snapshot = limiter.snapshot("example.com").await.unwrap().unwrap();
        assert!(snapshot.max_in_flight_observed <= 3);
        assert_eq!(snapshot.granted, 12);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_responses_reduce_rate_and_block_callers() {
        let limiter = RateLimiter::spawn(config(10.0, 5, 5));
        drop(limiter.acquire("api.example.com", None).await.unwrap());

        let adj = limiter.observe("API.example.com", 429).await.unwrap().unwrap();
        assert_eq!(adj.previous_rate, 10.0);
        assert_eq!(adj.new_rate, 5.0);

        let start = Instant::now();
        let _permit = limiter.acquire("api.example.com", None).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));

        assert!(limiter.observe("api.example.com", 200).await.unwrap().is_none());
        let snapshot = limiter.snapshot("api.example.com").await.unwrap().unwrap();
        assert!(snapshot.rate < snapshot.ceiling);
    }
}
