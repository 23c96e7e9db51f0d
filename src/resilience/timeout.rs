use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::warn;

use super::{RequestSender, ResilienceContext, ResilienceStrategy, StrategyKind};
use crate::MigrxResult;
use crate::error::{Error, TimeoutPhase};
use crate::request::TransportRequest;
use crate::response::Response;

/// Bounds one transport attempt. On expiry the attempt's child cancellation token fires.
#[derive(Clone, Copy, Debug)]
pub struct RequestTimeout {
    timeout: Duration,
}

impl RequestTimeout {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ResilienceStrategy for RequestTimeout {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RequestTimeout
    }

    fn wrap(&self, inner: Arc<dyn RequestSender>) -> Arc<dyn RequestSender> {
        if self.timeout.is_zero() {
            return inner;
        }
        Arc::new(RequestTimeoutSender {
            timeout: self.timeout,
            inner,
        })
    }
}

struct RequestTimeoutSender {
    timeout: Duration,
    inner: Arc<dyn RequestSender>,
}

impl RequestSender for RequestTimeoutSender {
    fn send(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> BoxFuture<'_, MigrxResult<Response>> {
        Box::pin(async move {
            let method = request.method().clone();
            let uri = request.redacted_uri();
            let attempt_token = context.cancellation().child_token();
            let attempt = context.attempt();
            let metrics = context.metrics().clone();
            let attempt_context = context.with_cancellation(attempt_token.clone());

            match tokio::time::timeout(self.timeout, self.inner.send(request, attempt_context)).await
            {
                Ok(result) => result,
                Err(_) => {
                    attempt_token.cancel();
                    metrics.record_attempt_timeout();
                    warn!(
                        timeout_ms = self.timeout.as_millis() as u64,
                        attempt,
                        method = %method,
                        uri = %uri,
                        "request attempt timed out"
                    );
                    Err(Error::Timeout {
                        phase: TimeoutPhase::Attempt,
                        timeout_ms: self.timeout.as_millis(),
                        method,
                        uri,
                    })
                }
            }
        })
    }
}
