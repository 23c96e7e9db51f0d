use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{RequestSender, ResilienceContext, ResilienceStrategy, StrategyKind};
use crate::MigrxResult;
use crate::error::Error;
use crate::request::TransportRequest;
use crate::response::Response;
use crate::util::cancellable;

/// Counting limiter shared by every call of one client scope.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Suspends until a permit is free. Cancellation abandons the wait.
    pub async fn acquire(&self, cancellation: &CancellationToken) -> MigrxResult<AdmissionPermit> {
        let permit = cancellable(cancellation, self.semaphore.clone().acquire_owned())
            .await?
            .map_err(|_| Error::ConcurrencyLimitClosed)?;
        Ok(AdmissionPermit { _permit: permit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.limit
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Fails every pending and future acquisition with [`Error::ConcurrencyLimitClosed`].
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Bounds concurrent inner sends by the limiter carried in the [`ResilienceContext`].
#[derive(Clone, Copy, Debug, Default)]
pub struct AdmissionControl;

impl AdmissionControl {
    pub fn new() -> Self {
        Self
    }
}

impl ResilienceStrategy for AdmissionControl {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AdmissionControl
    }

    fn wrap(&self, inner: Arc<dyn RequestSender>) -> Arc<dyn RequestSender> {
        Arc::new(AdmissionSender { inner })
    }
}

struct AdmissionSender {
    inner: Arc<dyn RequestSender>,
}

impl RequestSender for AdmissionSender {
    fn send(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> BoxFuture<'_, MigrxResult<Response>> {
        Box::pin(async move {
            let _permit = match context.limiter() {
                Some(limiter) => {
                    let permit = limiter.acquire(context.cancellation()).await?;
                    debug!(
                        in_flight = limiter.in_flight(),
                        limit = limiter.limit(),
                        "admission permit acquired"
                    );
                    Some(permit)
                }
                None => None,
            };
            let _in_flight = context.metrics().enter_in_flight();
            self.inner.send(request, context).await
        })
    }
}
