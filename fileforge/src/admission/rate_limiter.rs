//! Per-client admission control for conversion requests.
//!
//! Implements a sliding-window counter: each client keeps the instants of its
//! admitted requests inside the trailing window. A request is admitted only if
//! fewer than `max_requests` remain after expiring old entries. Rejections are
//! never recorded, so a rejected burst does not push back the client's quota.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Identity used when a caller cannot be identified. All such callers share one quota.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Configuration for the admission gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Maximum admitted requests per client within `window_ms`.
    pub max_requests: u32,
    /// Trailing window length in milliseconds.
    pub window_ms: u64,
    /// Hard cap on the number of tracked clients.
    pub max_clients: usize,
    /// Interval between idle-client eviction passes in milliseconds.
    pub eviction_interval_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_ms: 60_000,
            max_clients: 100_000,
            eviction_interval_ms: 60_000,
        }
    }
}

impl RateLimiterConfig {
    /// Create a config admitting `max_requests` per `window`.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window_ms: window.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Set the tracked-client cap.
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests still available in the current window after this decision.
    pub remaining: u32,
    /// On rejection, time until the oldest in-window request expires.
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    fn denied(retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after,
        }
    }
}

/// Admission record for one client.
#[derive(Debug, Default)]
struct ClientWindow {
    /// Admitted request instants, oldest first.
    admitted: VecDeque<Instant>,
}

impl ClientWindow {
    fn expire(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn check(&mut self, now: Instant, max_requests: u32, window: Duration) -> RateDecision {
        self.expire(now, window);

        let used = self.admitted.len() as u32;
        if used >= max_requests {
            let retry_after = self
                .admitted
                .front()
                .map(|oldest| window.saturating_sub(now.saturating_duration_since(*oldest)));
            return RateDecision::denied(retry_after);
        }

        self.admitted.push_back(now);
        RateDecision {
            allowed: true,
            remaining: max_requests - used - 1,
            retry_after: None,
        }
    }

    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        match self.admitted.back() {
            Some(&newest) => now.saturating_duration_since(newest) >= window,
            None => true,
        }
    }
}

/// Sliding-window rate limiter keyed by client identity.
///
/// All state sits behind a single synchronous mutex; checks never await, so the
/// lock is never held across a suspension point.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<String, ClientWindow>>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Check a request against the configured limit and window.
    pub fn check(&self, client_id: &str) -> RateDecision {
        self.check_limit(client_id, self.config.max_requests, self.config.window())
    }

    /// Check a request against an explicit limit and window.
    ///
    /// A limit of zero or an empty window always denies.
    pub fn check_limit(&self, client_id: &str, max_requests: u32, window: Duration) -> RateDecision {
        self.check_at(client_id, max_requests, window, Instant::now())
    }

    fn check_at(
        &self,
        client_id: &str,
        max_requests: u32,
        window: Duration,
        now: Instant,
    ) -> RateDecision {
        if max_requests == 0 || window.is_zero() {
            return RateDecision::denied(None);
        }

        let client_id = if client_id.trim().is_empty() {
            ANONYMOUS_CLIENT
        } else {
            client_id
        };

        let mut windows = self.windows.lock();

        if !windows.contains_key(client_id) && windows.len() >= self.config.max_clients {
            Self::evict_idle_locked(&mut windows, now, window);
            if windows.len() >= self.config.max_clients {
                warn!(
                    client_id = %client_id,
                    tracked = windows.len(),
                    "Admission table full, rejecting new client"
                );
                return RateDecision::denied(None);
            }
        }

        let decision = windows
            .entry(client_id.to_string())
            .or_default()
            .check(now, max_requests, window);

        if decision.allowed {
            trace!(client_id = %client_id, remaining = decision.remaining, "request admitted");
        } else {
            debug!(client_id = %client_id, retry_after = ?decision.retry_after, "request rate limited");
        }

        decision
    }

    /// Drop clients whose newest admitted request is older than the window.
    ///
    /// Returns the number of clients evicted.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    fn evict_idle_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock();
        Self::evict_idle_locked(&mut windows, now, self.config.window())
    }

    fn evict_idle_locked(
        windows: &mut HashMap<String, ClientWindow>,
        now: Instant,
        window: Duration,
    ) -> usize {
        let before = windows.len();
        windows.retain(|_, client| !client.is_idle(now, window));
        before - windows.len()
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().len()
    }

    /// Start the periodic idle-client eviction task.
    pub fn start_eviction_task(self: &Arc<Self>, cancellation_token: CancellationToken) {
        let limiter = Arc::clone(self);
        let period = Duration::from_millis(self.config.eviction_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            info!(
                "Admission eviction task started (interval: {}ms)",
                period.as_millis()
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Admission eviction task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = limiter.evict_idle();
                        if evicted > 0 {
                            debug!(evicted, "Evicted idle admission records");
                        }
                    }
                }
            }
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
