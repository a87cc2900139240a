//! Rate limiting middleware.
//!
//! In-memory token-bucket admission control per client identifier. One mutex
//! guards the whole registry; the request path and the idle sweeper both take
//! it, so a client can never be admitted past its bucket's capacity.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Slowest refill rate accepted from configuration: one token every ~17 minutes.
pub const MIN_REQUESTS_PER_SECOND: f64 = 0.001;

/// Configuration for rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained refill rate in tokens per second.
    pub requests_per_second: f64,
    /// Bucket capacity; new clients start with a full bucket.
    pub burst: u32,
    /// How often the sweeper scans for idle clients.
    pub cleanup_interval: Duration,
    /// Buckets untouched for longer than this are evicted.
    pub idle_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
            cleanup_interval: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, rate: f64, capacity: f64, now: Instant) {
        // Instants older than the last refill add nothing.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn try_take(&mut self, rate: f64) -> Admission {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Admission::Allowed {
                remaining: self.tokens.floor() as u32,
            }
        } else {
            let missing = 1.0 - self.tokens;
            Admission::Denied {
                retry_after: Duration::try_from_secs_f64(missing / rate).unwrap_or(Duration::MAX),
            }
        }
    }
}

#[derive(Debug)]
struct ClientBucket {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Per-client token-bucket limiter.
pub struct ClientLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, ClientBucket>>,
}

impl ClientLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume one token for `client_id`. `false` means the request must be refused.
    pub fn allow(&self, client_id: &str) -> bool {
        self.check(client_id).is_allowed()
    }

    pub fn check(&self, client_id: &str) -> Admission {
        self.check_at(client_id, Instant::now())
    }

    pub fn check_at(&self, client_id: &str, now: Instant) -> Admission {
        let capacity = f64::from(self.config.burst);
        let rate = self.config.requests_per_second;

        let mut buckets = self.buckets.lock();
        let entry = buckets
            .entry(client_id.to_string())
            .or_insert_with(|| ClientBucket {
                bucket: TokenBucket::full(capacity, now),
                last_seen: now,
            });

        entry.bucket.refill(rate, capacity, now);
        if now > entry.last_seen {
            entry.last_seen = now;
        }
        entry.bucket.try_take(rate)
    }

    /// Tokens currently available to `client_id`, without consuming any.
    pub fn remaining(&self, client_id: &str) -> Option<f64> {
        self.buckets.lock().get(client_id).map(|c| c.bucket.tokens)
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Evict clients idle for longer than the idle timeout. Returns the number removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, client| now.saturating_duration_since(client.last_seen) <= idle_timeout);
        before - buckets.len()
    }

    /// Start the idle sweeper. The task runs until the handle is stopped or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let limiter = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let period = self.config.cleanup_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing can be idle yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!(
                                removed,
                                remaining = limiter.tracked_clients(),
                                "Evicted idle rate-limit buckets"
                            );
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }

            debug!("Rate-limit sweeper stopped");
        });

        info!(
            interval_secs = period.as_secs(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Rate-limit sweeper started"
        );

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Owns the background sweeper task.
///
/// Call [`SweeperHandle::stop`] for an orderly shutdown; dropping the handle
/// aborts the task.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!("Rate-limit sweeper ended abnormally: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}

/// Rate limiter state shared with the middleware.
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<ClientLimiter>,
    /// Use the first `X-Forwarded-For` hop as the client id.
    pub trust_forwarded_for: bool,
}

/// Client identifier the limiter charged, attached to the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

fn client_id(req: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rate limiting middleware function.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_id(&request, state.trust_forwarded_for);

    let mut response = match state.limiter.check(&client) {
        Admission::Allowed { .. } => next.run(request).await,
        Admission::Denied { retry_after } => {
            let retry_secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;

            let body = serde_json::json!({
                "error": "rate_limit_exceeded",
                "message": "Too many requests. Please slow down.",
                "retry_after_seconds": retry_secs,
            });

            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_secs.to_string())],
                axum::Json(body),
            )
                .into_response()
        }
    };

    response.extensions_mut().insert(ClientId(client));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn limiter(rate: f64, burst: u32) -> ClientLimiter {
        ClientLimiter::new(RateLimitConfig {
            requests_per_second: rate,
            burst,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn test_burst_then_deny_then_refill() {
        let limiter = limiter(2.0, 2);
        let start = Instant::now();

        let results: Vec<bool> = (0..3)
            .map(|_| limiter.check_at("1.2.3.4", start).is_allowed())
            .collect();
        assert_eq!(results, vec![true, true, false]);

        let later = start + Duration::from_secs(1);
        assert!(limiter.check_at("1.2.3.4", later).is_allowed());
    }

    #[test]
    fn test_denial_reports_retry_after() {
        let limiter = limiter(2.0, 1);
        let now = Instant::now();

        assert!(limiter.check_at("c", now).is_allowed());
        match limiter.check_at("c", now) {
            Admission::Denied { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(500));
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn test_denial_at_tiny_rate_saturates_retry_after() {
        let limiter = limiter(1e-20, 1);
        let now = Instant::now();

        assert!(limiter.check_at("slow", now).is_allowed());
        assert_eq!(
            limiter.check_at("slow", now),
            Admission::Denied {
                retry_after: Duration::MAX
            }
        );
    }

    #[test]
    fn test_refill_never_exceeds_burst() {
        let limiter = limiter(100.0, 3);
        let now = Instant::now();

        assert!(limiter.check_at("c", now).is_allowed());
        let much_later = now + Duration::from_secs(3600);
        assert_eq!(
            limiter.check_at("c", much_later),
            Admission::Allowed { remaining: 2 }
        );
    }

    #[test]
    fn test_clients_are_isolated() {
        let limiter = limiter(1.0, 2);
        let now = Instant::now();

        assert!(limiter.check_at("a", now).is_allowed());
        assert!(limiter.check_at("a", now).is_allowed());
        assert!(!limiter.check_at("a", now).is_allowed());

        assert_eq!(limiter.check_at("b", now), Admission::Allowed { remaining: 1 });
        assert_eq!(limiter.remaining("a"), Some(0.0));
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn test_concurrent_racers_never_exceed_burst() {
        let limiter = Arc::new(limiter(0.001, 5));
        let now = Instant::now();

        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let limiter = &limiter;
                    scope.spawn(move || {
                        (0..10)
                            .filter(|_| limiter.check_at("shared", now).is_allowed())
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert!(admitted <= 5, "admitted {admitted}");
    }

    #[test]
    fn test_simultaneous_bursts_do_not_interfere() {
        let limiter = Arc::new(limiter(0.001, 10));
        let now = Instant::now();

        let counts: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = ["10.0.0.1", "10.0.0.2"]
                .into_iter()
                .map(|client| {
                    let limiter = &limiter;
                    scope.spawn(move || {
                        (0..10)
                            .filter(|_| limiter.check_at(client, now).is_allowed())
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(counts, vec![10, 10]);
    }

    #[test]
    fn test_sweep_evicts_only_idle_clients() {
        let limiter = limiter(1.0, 1);
        let start = Instant::now();

        limiter.check_at("stale", start);
        limiter.check_at("fresh", start + Duration::from_secs(9 * 60));

        let removed = limiter.sweep_at(start + Duration::from_secs(11 * 60));
        assert_eq!(removed, 1);
        assert_eq!(limiter.remaining("stale"), None);
        assert!(limiter.remaining("fresh").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_evicts_and_stops() {
        let limiter = Arc::new(limiter(1.0, 1));
        let handle = limiter.spawn_sweeper();

        assert!(limiter.allow("1.2.3.4"));
        assert_eq!(limiter.tracked_clients(), 1);

        // Idle timeout is 10 min, sweeps every 5 min.
        tokio::time::sleep(Duration::from_secs(16 * 60)).await;
        assert_eq!(limiter.tracked_clients(), 0);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_aborts_sweeper() {
        let limiter = Arc::new(limiter(1.0, 1));
        let handle = limiter.spawn_sweeper();
        drop(handle);

        tokio::time::sleep(Duration::from_millis(10)).await;
        // The task held the only other reference.
        assert_eq!(Arc::strong_count(&limiter), 1);
    }

    #[test]
    fn test_client_id_prefers_forwarded_when_trusted() {
        let mut req = HttpRequest::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));

        assert_eq!(client_id(&req, true), "203.0.113.7");
        assert_eq!(client_id(&req, false), "127.0.0.1");
    }

    #[test]
    fn test_client_id_without_connect_info() {
        let req = HttpRequest::builder().body(Body::empty()).unwrap();
        assert_eq!(client_id(&req, false), "unknown");
    }
}
