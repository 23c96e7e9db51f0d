use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::client_throttle::RateLimiter;
use super::{RequestSender, ResilienceContext, ResilienceStrategy, StrategyKind};
use crate::MigrxResult;
use crate::error::Error;
use crate::request::TransportRequest;
use crate::response::Response;
use crate::util::{duration_millis, parse_retry_after, sleep_cancellable, truncate_body};

/// How a server-throttled attempt is charged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerThrottleAccounting {
    /// Re-issued by the server-throttle strategy under its own budget.
    #[default]
    Independent,
    /// Surfaced as [`Error::ServerThrottled`] so the retry strategy re-attempts it.
    ConsumesRetryAttempt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerThrottlePolicy {
    accounting: ServerThrottleAccounting,
    max_throttle_retries: usize,
    default_delay: Duration,
    max_delay: Duration,
}

impl ServerThrottlePolicy {
    pub const fn standard() -> Self {
        Self {
            accounting: ServerThrottleAccounting::Independent,
            max_throttle_retries: 5,
            default_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }

    pub const fn accounting(mut self, accounting: ServerThrottleAccounting) -> Self {
        self.accounting = accounting;
        self
    }

    pub const fn max_throttle_retries(mut self, max_throttle_retries: usize) -> Self {
        self.max_throttle_retries = max_throttle_retries;
        self
    }

    /// Wait used when a 429 carries no usable `Retry-After`.
    pub const fn default_delay(mut self, default_delay: Duration) -> Self {
        self.default_delay = default_delay;
        self
    }

    pub const fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub(crate) fn delay_for(&self, headers: &HeaderMap, now: SystemTime) -> Duration {
        parse_retry_after(headers, now)
            .unwrap_or(self.default_delay)
            .min(self.max_delay)
    }
}

impl Default for ServerThrottlePolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Reacts to `429 Too Many Requests` by pausing the scope and re-issuing.
#[derive(Clone, Debug, Default)]
pub struct ServerThrottle {
    policy: ServerThrottlePolicy,
    rate_limiter: Option<RateLimiter>,
}

impl ServerThrottle {
    pub fn new(policy: ServerThrottlePolicy) -> Self {
        Self {
            policy,
            rate_limiter: None,
        }
    }

    /// Shares observed delays with the client-throttle bucket so sibling calls back off too.
    pub fn with_rate_limiter(mut self, rate_limiter: Option<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }
}

impl ResilienceStrategy for ServerThrottle {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ServerThrottle
    }

    fn wrap(&self, inner: Arc<dyn RequestSender>) -> Arc<dyn RequestSender> {
        Arc::new(ServerThrottleSender {
            policy: self.policy,
            rate_limiter: self.rate_limiter.clone(),
            inner,
        })
    }
}

struct ServerThrottleSender {
    policy: ServerThrottlePolicy,
    rate_limiter: Option<RateLimiter>,
    inner: Arc<dyn RequestSender>,
}

impl ServerThrottleSender {
    async fn send_throttled(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> MigrxResult<Response> {
        let mut throttled = 0_usize;
        loop {
            let response = self.inner.send(request.clone(), context.clone()).await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            context.metrics().record_server_throttle();
            let delay = self.policy.delay_for(response.headers(), SystemTime::now());
            if let Some(rate_limiter) = &self.rate_limiter {
                rate_limiter.observe_server_throttle(delay);
            }

            match self.policy.accounting {
                ServerThrottleAccounting::ConsumesRetryAttempt => {
                    warn!(
                        delay_ms = duration_millis(delay),
                        attempt = context.attempt(),
                        uri = %request.redacted_uri(),
                        "server throttled request"
                    );
                    return Err(Error::ServerThrottled {
                        method: request.method().clone(),
                        uri: request.redacted_uri(),
                        retry_after_ms: delay.as_millis(),
                        headers: Box::new(response.headers().clone()),
                        body: truncate_body(response.body()),
                    });
                }
                ServerThrottleAccounting::Independent => {
                    if throttled >= self.policy.max_throttle_retries {
                        warn!(
                            throttled,
                            uri = %request.redacted_uri(),
                            "server throttle budget exhausted"
                        );
                        return Ok(response);
                    }
                    throttled += 1;
                    warn!(
                        delay_ms = duration_millis(delay),
                        throttled,
                        attempt = context.attempt(),
                        uri = %request.redacted_uri(),
                        "server throttled request; re-issuing after delay"
                    );
                    sleep_cancellable(context.cancellation(), delay).await?;
                }
            }
        }
    }
}

impl RequestSender for ServerThrottleSender {
    fn send(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> BoxFuture<'_, MigrxResult<Response>> {
        Box::pin(self.send_throttled(request, context))
    }
}
