use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use http::{Method, StatusCode};
use rand::RngExt;
use tracing::{debug, warn};

use super::{RequestSender, ResilienceContext, ResilienceStrategy, StrategyKind};
use crate::MigrxResult;
use crate::error::{Error, TimeoutPhase, TransportErrorKind};
use crate::request::TransportRequest;
use crate::response::Response;
use crate::util::{
    cancellable, duration_millis, http_status_error, parse_retry_after, sleep_cancellable,
};

/// Outcome of one attempt, as seen by a [`RetryClassifier`].
#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub max_attempts: usize,
    pub method: Method,
    pub uri: String,
    pub status: Option<StatusCode>,
    pub transport_error_kind: Option<TransportErrorKind>,
    pub timeout_phase: Option<TimeoutPhase>,
    pub response_body_read_error: bool,
    pub server_throttled: bool,
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    max_retry_after: Duration,
    retryable_status_codes: BTreeSet<u16>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    retryable_timeout_phases: BTreeSet<TimeoutPhase>,
    retry_on_response_body_read_error: bool,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_backoff", &self.base_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("max_retry_after", &self.max_retry_after)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field(
                "retryable_transport_error_kinds",
                &self.retryable_transport_error_kinds,
            )
            .field("retryable_timeout_phases", &self.retryable_timeout_phases)
            .field("custom_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self::standard().max_attempts(1)
    }

    pub fn standard() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            jitter_ratio: 0.2,
            max_retry_after: Duration::from_secs(60),
            retryable_status_codes: Self::default_retryable_status_codes(),
            retryable_transport_error_kinds: default_retryable_transport_error_kinds(),
            retryable_timeout_phases: default_retryable_timeout_phases(),
            retry_on_response_body_read_error: true,
            retry_classifier: None,
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff.max(Duration::from_millis(1));
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Upper bound on a server-supplied `Retry-After` that replaces the backoff.
    pub fn max_retry_after(mut self, max_retry_after: Duration) -> Self {
        self.max_retry_after = max_retry_after;
        self
    }

    pub fn retry_on_timeout(mut self, retry_on_timeout: bool) -> Self {
        self.retryable_timeout_phases = if retry_on_timeout {
            default_retryable_timeout_phases()
        } else {
            BTreeSet::new()
        };
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retry_on_response_body_read_error(mut self, retry: bool) -> Self {
        self.retry_on_response_body_read_error = retry;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    /// 429 is left to the server-throttle strategy.
    pub fn default_retryable_status_codes() -> BTreeSet<u16> {
        [408_u16, 500, 502, 503, 504].into_iter().collect()
    }

    pub(crate) fn configured_max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub(crate) fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    pub(crate) fn should_retry_decision(&self, decision: &RetryDecision) -> bool {
        if let Some(retry_classifier) = &self.retry_classifier {
            return retry_classifier.should_retry(decision);
        }
        if decision.server_throttled {
            return true;
        }
        if let Some(status) = decision.status {
            return self.is_retryable_status(status);
        }
        if let Some(kind) = decision.transport_error_kind {
            return self.retryable_transport_error_kinds.contains(&kind);
        }
        if let Some(phase) = decision.timeout_phase {
            return self.retryable_timeout_phases.contains(&phase);
        }
        if decision.response_body_read_error {
            return self.retry_on_response_body_read_error;
        }
        false
    }

    /// Backoff before retry number `retry_index` (1-based): `base * 2^(n-1)`, capped, jittered.
    pub(crate) fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        let capped_exponent = retry_index.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = duration_millis(backoff);
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = duration_millis(self.max_backoff);

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let sampled_ms = rand::rng()
            .random_range(low..=high)
            .min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Dns,
        TransportErrorKind::Connect,
        TransportErrorKind::Read,
    ]
    .into_iter()
    .collect()
}

fn default_retryable_timeout_phases() -> BTreeSet<TimeoutPhase> {
    [TimeoutPhase::Attempt, TimeoutPhase::ResponseBody]
        .into_iter()
        .collect()
}

/// Outermost strategy: re-issues transient failures with exponential backoff.
#[derive(Clone, Debug)]
pub struct Retry {
    policy: RetryPolicy,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl ResilienceStrategy for Retry {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Retry
    }

    fn wrap(&self, inner: Arc<dyn RequestSender>) -> Arc<dyn RequestSender> {
        Arc::new(RetrySender {
            policy: self.policy.clone(),
            inner,
        })
    }
}

struct RetrySender {
    policy: RetryPolicy,
    inner: Arc<dyn RequestSender>,
}

/// What the attempt loop does after classifying one outcome.
enum AttemptOutcome {
    Done(MigrxResult<Response>),
    Retry {
        failure: Error,
        server_delay: Option<Duration>,
    },
}

impl RetrySender {
    fn classify(
        &self,
        outcome: MigrxResult<Response>,
        attempt: usize,
        method: &Method,
        uri: &str,
    ) -> AttemptOutcome {
        let mut decision = RetryDecision {
            attempt,
            max_attempts: self.policy.configured_max_attempts(),
            method: method.clone(),
            uri: uri.to_owned(),
            status: None,
            transport_error_kind: None,
            timeout_phase: None,
            response_body_read_error: false,
            server_throttled: false,
        };
        let mut server_delay = None;

        let terminal = match &outcome {
            Ok(response) if response.is_success() => true,
            Ok(response) => {
                decision.status = Some(response.status());
                server_delay = parse_retry_after(response.headers(), SystemTime::now());
                false
            }
            Err(error) if error.is_cancelled() => true,
            Err(Error::ServerThrottled { retry_after_ms, .. }) => {
                decision.status = Some(StatusCode::TOO_MANY_REQUESTS);
                decision.server_throttled = true;
                server_delay = Some(Duration::from_millis(
                    (*retry_after_ms).min(u64::MAX as u128) as u64,
                ));
                false
            }
            Err(Error::HttpStatus { status, .. }) => {
                decision.status = StatusCode::from_u16(*status).ok();
                false
            }
            Err(Error::Transport { kind, .. }) => {
                decision.transport_error_kind = Some(*kind);
                false
            }
            Err(Error::Timeout { phase, .. }) => {
                decision.timeout_phase = Some(*phase);
                false
            }
            Err(Error::ReadBody { .. }) => {
                decision.response_body_read_error = true;
                false
            }
            Err(_) => true,
        };

        if terminal || !self.policy.should_retry_decision(&decision) {
            return AttemptOutcome::Done(outcome);
        }

        let failure = match outcome {
            Ok(response) => http_status_error(
                response.status(),
                method,
                uri,
                response.headers(),
                response.body(),
            ),
            Err(error) => error,
        };
        AttemptOutcome::Retry {
            failure,
            server_delay,
        }
    }

    async fn send_with_retry(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> MigrxResult<Response> {
        let max_attempts = self.policy.configured_max_attempts();
        let method = request.method().clone();
        let uri = request.redacted_uri();
        let mut attempt = 1_usize;

        loop {
            if context.cancellation().is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut attempt_context = context.clone();
            attempt_context.set_attempt(attempt);
            context.metrics().record_attempt();
            debug!(attempt, max_attempts, method = %method, uri = %uri, "sending attempt");

            let outcome = cancellable(
                context.cancellation(),
                self.inner.send(request.clone(), attempt_context),
            )
            .await?;
            let (failure, server_delay) = match self.classify(outcome, attempt, &method, &uri) {
                AttemptOutcome::Done(result) => return result,
                AttemptOutcome::Retry {
                    failure,
                    server_delay,
                } => (failure, server_delay),
            };

            if attempt >= max_attempts {
                warn!(
                    attempts = attempt,
                    method = %method,
                    uri = %uri,
                    error = %failure,
                    "retry attempts exhausted"
                );
                return Err(Error::RetryExhausted {
                    attempts: attempt,
                    last: Box::new(failure),
                });
            }

            let delay = match server_delay {
                Some(server_delay) => server_delay.min(self.policy.max_retry_after),
                None => self.policy.backoff_for_retry(attempt),
            };
            warn!(
                attempt,
                max_attempts,
                delay_ms = duration_millis(delay),
                status = failure.status(),
                error = %failure,
                method = %method,
                uri = %uri,
                "retrying transient failure"
            );
            context.metrics().record_retry();
            sleep_cancellable(context.cancellation(), delay).await?;
            attempt += 1;
        }
    }
}

impl RequestSender for RetrySender {
    fn send(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> BoxFuture<'_, MigrxResult<Response>> {
        Box::pin(self.send_with_retry(request, context))
    }
}
