//! Send-time resilience strategies and the pipeline that composes them.
//!
//! Every strategy wraps a [`RequestSender`] and returns a new one. The pipeline applies them
//! in [`StrategyKind::PIPELINE_ORDER`] (outermost first) around the transport.

pub mod admission;
pub mod client_throttle;
pub mod retry;
pub mod server_throttle;
pub mod timeout;

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::MigrxResult;
use crate::error::Error;
use crate::metrics::TransportMetrics;
use crate::options::OptionsSnapshot;
use crate::request::TransportRequest;
use crate::response::Response;

use self::admission::{AdmissionControl, ConcurrencyLimiter};
use self::client_throttle::{ClientThrottle, RateLimiter};
use self::retry::Retry;
use self::server_throttle::ServerThrottle;
use self::timeout::RequestTimeout;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StrategyKind {
    Retry,
    AdmissionControl,
    ServerThrottle,
    ClientThrottle,
    RequestTimeout,
}

impl StrategyKind {
    /// Composition order, outermost first. Retry re-enters every later stage on each attempt;
    /// the request timeout bounds a single transport attempt.
    pub const PIPELINE_ORDER: [StrategyKind; 5] = [
        StrategyKind::Retry,
        StrategyKind::AdmissionControl,
        StrategyKind::ServerThrottle,
        StrategyKind::ClientThrottle,
        StrategyKind::RequestTimeout,
    ];

    pub fn pipeline_position(self) -> usize {
        Self::PIPELINE_ORDER
            .iter()
            .position(|kind| *kind == self)
            .unwrap_or(Self::PIPELINE_ORDER.len())
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::AdmissionControl => "admission_control",
            Self::ServerThrottle => "server_throttle",
            Self::ClientThrottle => "client_throttle",
            Self::RequestTimeout => "request_timeout",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Anything that can send one request and produce a buffered response.
///
/// The transport, every resilience strategy and the composed pipeline all implement this.
pub trait RequestSender: Send + Sync {
    fn send(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> BoxFuture<'_, MigrxResult<Response>>;
}

/// Adapts an async closure into a [`RequestSender`].
pub struct SendFn<F> {
    send: F,
}

impl<F> SendFn<F> {
    pub fn new<Fut>(send: F) -> Self
    where
        F: Fn(TransportRequest, ResilienceContext) -> Fut + Send + Sync,
        Fut: Future<Output = MigrxResult<Response>> + Send + 'static,
    {
        Self { send }
    }
}

impl<F, Fut> RequestSender for SendFn<F>
where
    F: Fn(TransportRequest, ResilienceContext) -> Fut + Send + Sync,
    Fut: Future<Output = MigrxResult<Response>> + Send + 'static,
{
    fn send(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> BoxFuture<'_, MigrxResult<Response>> {
        Box::pin((self.send)(request, context))
    }
}

pub trait ResilienceStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Wraps `inner`; a strategy without configuration returns `inner` unchanged.
    fn wrap(&self, inner: Arc<dyn RequestSender>) -> Arc<dyn RequestSender>;
}

/// Per-call state threaded through the strategy chain.
///
/// Owned by one logical call. Only the limiter and metrics handles are shared with other
/// calls of the same client scope.
#[derive(Clone, Debug)]
pub struct ResilienceContext {
    attempt: usize,
    cancellation: CancellationToken,
    limiter: Option<ConcurrencyLimiter>,
    metrics: TransportMetrics,
}

impl ResilienceContext {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            attempt: 1,
            cancellation,
            limiter: None,
            metrics: TransportMetrics::default(),
        }
    }

    pub fn with_limiter(mut self, limiter: Option<ConcurrencyLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_metrics(mut self, metrics: TransportMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replaces the cancellation signal, typically with a child of the current one.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// 1-based attempt number of the current send.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn limiter(&self) -> Option<&ConcurrencyLimiter> {
        self.limiter.as_ref()
    }

    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    pub(crate) fn set_attempt(&mut self, attempt: usize) {
        self.attempt = attempt;
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    strategies: Vec<Arc<dyn ResilienceStrategy>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The five standard strategies configured from one options snapshot.
    pub fn from_snapshot(snapshot: &OptionsSnapshot, rate_limiter: Option<RateLimiter>) -> Self {
        Self::new()
            .strategy(Retry::new(snapshot.retry_policy()))
            .strategy(AdmissionControl::new())
            .strategy(
                ServerThrottle::new(snapshot.server_throttle_policy())
                    .with_rate_limiter(rate_limiter.clone()),
            )
            .strategy(ClientThrottle::new(rate_limiter))
            .strategy(RequestTimeout::new(snapshot.request_timeout()))
    }

    pub fn strategy(mut self, strategy: impl ResilienceStrategy + 'static) -> Self {
        self.strategies.push(Arc::new(strategy));
        self
    }

    pub fn build(mut self, transport: Arc<dyn RequestSender>) -> MigrxResult<ResiliencePipeline> {
        self.strategies
            .sort_by_key(|strategy| strategy.kind().pipeline_position());
        for pair in self.strategies.windows(2) {
            if pair[0].kind() == pair[1].kind() {
                return Err(Error::DuplicateStrategy {
                    kind: pair[0].kind(),
                });
            }
        }

        let order = self
            .strategies
            .iter()
            .map(|strategy| strategy.kind())
            .collect();
        Ok(ResiliencePipeline {
            sender: compose(&self.strategies, transport),
            order,
        })
    }
}

fn compose(
    strategies: &[Arc<dyn ResilienceStrategy>],
    transport: Arc<dyn RequestSender>,
) -> Arc<dyn RequestSender> {
    strategies
        .iter()
        .rev()
        .fold(transport, |inner, strategy| strategy.wrap(inner))
}

/// One composed send function per client scope.
#[derive(Clone)]
pub struct ResiliencePipeline {
    sender: Arc<dyn RequestSender>,
    order: Vec<StrategyKind>,
}

impl std::fmt::Debug for ResiliencePipeline {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResiliencePipeline")
            .field("order", &self.order)
            .finish()
    }
}

impl ResiliencePipeline {
    pub async fn send(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> MigrxResult<Response> {
        self.sender.send(request, context).await
    }

    pub fn order(&self) -> &[StrategyKind] {
        &self.order
    }

    pub fn sender(&self) -> Arc<dyn RequestSender> {
        self.sender.clone()
    }
}

impl RequestSender for ResiliencePipeline {
    fn send(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> BoxFuture<'_, MigrxResult<Response>> {
        self.sender.send(request, context)
    }
}
