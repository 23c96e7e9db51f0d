use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tracing::debug;

use super::{RequestSender, ResilienceContext, ResilienceStrategy, StrategyKind};
use crate::MigrxResult;
use crate::request::TransportRequest;
use crate::response::Response;
use crate::util::{duration_millis, lock_unpoisoned, sleep_cancellable};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimitPolicy {
    requests_per_second: f64,
    burst: usize,
    max_throttle_delay: Duration,
}

impl RateLimitPolicy {
    pub const fn standard() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 1,
            max_throttle_delay: Duration::from_secs(60),
        }
    }

    pub fn requests_per_second(mut self, requests_per_second: f64) -> Self {
        self.requests_per_second = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second
        } else {
            1.0
        };
        self
    }

    /// Tokens available at once; `1` enforces a minimum spacing between requests.
    pub const fn burst(mut self, burst: usize) -> Self {
        self.burst = burst;
        self
    }

    /// Upper bound on a server-imposed pause fed in through [`RateLimiter::observe_server_throttle`].
    pub const fn max_throttle_delay(mut self, max_throttle_delay: Duration) -> Self {
        self.max_throttle_delay = max_throttle_delay;
        self
    }

    fn normalize(self) -> Self {
        Self {
            requests_per_second: if self.requests_per_second.is_finite()
                && self.requests_per_second > 0.0
            {
                self.requests_per_second
            } else {
                1.0
            },
            burst: self.burst.max(1),
            max_throttle_delay: self.max_throttle_delay,
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug)]
struct TokenBucket {
    policy: RateLimitPolicy,
    tokens: f64,
    last_refill_at: Instant,
    throttle_until: Option<Instant>,
}

impl TokenBucket {
    fn new(policy: RateLimitPolicy, now: Instant) -> Self {
        let policy = policy.normalize();
        Self {
            policy,
            tokens: policy.burst as f64,
            last_refill_at: now,
            throttle_until: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed_secs = now.duration_since(self.last_refill_at).as_secs_f64();
        self.last_refill_at = now;
        let replenished = elapsed_secs * self.policy.requests_per_second;
        self.tokens = (self.tokens + replenished).min(self.policy.burst as f64);
        if let Some(throttle_until) = self.throttle_until
            && now >= throttle_until
        {
            self.throttle_until = None;
        }
    }

    /// Consumes a token and returns zero, or returns how long to wait before trying again.
    fn try_acquire(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if let Some(throttle_until) = self.throttle_until
            && now < throttle_until
        {
            return throttle_until.saturating_duration_since(now);
        }
        if self.tokens >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return Duration::ZERO;
        }

        let needed_tokens = (1.0 - self.tokens).max(0.0);
        let delay_secs = needed_tokens / self.policy.requests_per_second;
        if delay_secs <= f64::EPSILON {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    fn apply_throttle(&mut self, now: Instant, delay: Duration) {
        let capped_delay = delay.min(self.policy.max_throttle_delay);
        if capped_delay.is_zero() {
            return;
        }
        let throttle_until = now + capped_delay;
        self.throttle_until = Some(match self.throttle_until {
            Some(existing) => existing.max(throttle_until),
            None => throttle_until,
        });
    }
}

/// Token-bucket rate state shared by every call of one client scope.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(policy, Instant::now()))),
        }
    }

    /// Takes a token when one is ready; otherwise returns the wait before the next try.
    pub fn acquire_delay(&self) -> Duration {
        lock_unpoisoned(&self.bucket).try_acquire(Instant::now())
    }

    /// Pauses the whole scope for `delay` (capped by the policy) after server backpressure.
    pub fn observe_server_throttle(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        lock_unpoisoned(&self.bucket).apply_throttle(Instant::now(), delay);
    }
}

/// Paces requests of the scope through a shared [`RateLimiter`]; a no-op without one.
#[derive(Clone, Debug, Default)]
pub struct ClientThrottle {
    rate_limiter: Option<RateLimiter>,
}

impl ClientThrottle {
    pub fn new(rate_limiter: Option<RateLimiter>) -> Self {
        Self { rate_limiter }
    }
}

impl ResilienceStrategy for ClientThrottle {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ClientThrottle
    }

    fn wrap(&self, inner: Arc<dyn RequestSender>) -> Arc<dyn RequestSender> {
        match &self.rate_limiter {
            Some(rate_limiter) => Arc::new(ClientThrottleSender {
                rate_limiter: rate_limiter.clone(),
                inner,
            }),
            None => inner,
        }
    }
}

struct ClientThrottleSender {
    rate_limiter: RateLimiter,
    inner: Arc<dyn RequestSender>,
}

impl RequestSender for ClientThrottleSender {
    fn send(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> BoxFuture<'_, MigrxResult<Response>> {
        Box::pin(async move {
            loop {
                let delay = self.rate_limiter.acquire_delay();
                if delay.is_zero() {
                    break;
                }
                context.metrics().record_client_throttle_wait();
                debug!(delay_ms = duration_millis(delay), "client throttle wait");
                sleep_cancellable(context.cancellation(), delay).await?;
            }
            self.inner.send(request, context).await
        })
    }
}
