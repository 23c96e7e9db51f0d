use std::sync::Arc;

use http::header::{ACCEPT, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

use crate::MigrxResult;
use crate::chunked::{Chunk, ChunkRange, ChunkedStreamProcessor, DownloadSummary};
use crate::error::Error;
use crate::metrics::{TransportMetrics, TransportMetricsSnapshot};
use crate::options::{NetworkOptions, OptionsSnapshot, OptionsSource};
use crate::request::TransportRequest;
use crate::resilience::admission::ConcurrencyLimiter;
use crate::resilience::client_throttle::RateLimiter;
use crate::resilience::{
    PipelineBuilder, RequestSender, ResilienceContext, ResiliencePipeline, StrategyKind,
};
use crate::response::{Response, ResponseEnvelope};
use crate::serializer::SerializerRegistry;
use crate::transport::HyperTransport;
use crate::util::{join_base_path, validate_base_url};

const DEFAULT_CLIENT_NAME: &str = "migrx";

pub struct HttpClientBuilder {
    base_url: Option<String>,
    options: Arc<dyn OptionsSource>,
    transport: Option<Arc<dyn RequestSender>>,
    serializers: SerializerRegistry,
    client_name: String,
    default_headers: HeaderMap,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            base_url: None,
            options: Arc::new(NetworkOptions::default()),
            transport: None,
            serializers: SerializerRegistry::default(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            default_headers: HeaderMap::new(),
        }
    }
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix for relative paths passed to [`HttpClient::request`].
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn options(self, options: impl OptionsSource + 'static) -> Self {
        self.options_source(Arc::new(options))
    }

    pub fn options_source(mut self, options: Arc<dyn OptionsSource>) -> Self {
        self.options = options;
        self
    }

    /// Replaces the default hyper transport.
    pub fn transport(self, transport: impl RequestSender + 'static) -> Self {
        self.transport_arc(Arc::new(transport))
    }

    pub fn transport_arc(mut self, transport: Arc<dyn RequestSender>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn serializers(mut self, serializers: SerializerRegistry) -> Self {
        self.serializers = serializers;
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> MigrxResult<Self> {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|source| Error::InvalidHeaderName {
                name: name.to_owned(),
                source,
            })?;
        let header_value =
            HeaderValue::from_str(value).map_err(|source| Error::InvalidHeaderValue {
                name: name.to_owned(),
                source,
            })?;
        Ok(self.default_header(header_name, header_value))
    }

    /// Reads the options source once and builds the scope's pipeline, limiter and rate state.
    pub fn try_build(self) -> MigrxResult<HttpClient> {
        if let Some(base_url) = &self.base_url {
            validate_base_url(base_url)?;
        }

        let snapshot = OptionsSnapshot::capture(self.options.as_ref());
        snapshot.options().validate()?;

        let limiter = snapshot
            .max_concurrent_requests()
            .map(ConcurrencyLimiter::new);
        let rate_limiter = snapshot.rate_limit_policy().map(RateLimiter::new);
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HyperTransport::new()));
        let pipeline = PipelineBuilder::from_snapshot(&snapshot, rate_limiter).build(transport)?;

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                base_url: self.base_url,
                options: self.options,
                pipeline,
                limiter,
                metrics: TransportMetrics::new(),
                serializers: self.serializers,
                client_name: self.client_name,
                default_headers: self.default_headers,
            }),
        })
    }

    #[track_caller]
    pub fn build(self) -> HttpClient {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build migrx http client: {error}; use try_build() to handle configuration errors")
        })
    }
}

struct ClientInner {
    base_url: Option<String>,
    options: Arc<dyn OptionsSource>,
    pipeline: ResiliencePipeline,
    limiter: Option<ConcurrencyLimiter>,
    metrics: TransportMetrics,
    serializers: SerializerRegistry,
    client_name: String,
    default_headers: HeaderMap,
}

/// One client scope: a composed resilience pipeline plus the limiter, rate state and metrics
/// shared by every call issued through it. Cheap to clone.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("client_name", &self.inner.client_name)
            .field("base_url", &self.inner.base_url)
            .field("pipeline", &self.inner.pipeline)
            .finish()
    }
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// Builds a request for `path`, resolved against the base URL unless already absolute.
    pub fn request(&self, method: Method, path: &str) -> MigrxResult<TransportRequest> {
        if path.contains("://") {
            return TransportRequest::parse(method, path);
        }
        match &self.inner.base_url {
            Some(base_url) => TransportRequest::parse(method, &join_base_path(base_url, path)),
            None => TransportRequest::parse(method, path),
        }
    }

    pub fn get(&self, path: &str) -> MigrxResult<TransportRequest> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> MigrxResult<TransportRequest> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> MigrxResult<TransportRequest> {
        self.request(Method::PUT, path)
    }

    /// Sends one request through the pipeline. Non-success statuses that are not retried come
    /// back as a [`Response`] with `is_success() == false`.
    pub async fn send(
        &self,
        mut request: TransportRequest,
        cancellation: &CancellationToken,
    ) -> MigrxResult<Response> {
        self.apply_default_headers(&mut request);
        let span = info_span!(
            "migrx.request",
            client = %self.inner.client_name,
            method = %request.method(),
            uri = %request.redacted_uri()
        );

        let metrics = &self.inner.metrics;
        metrics.record_request_started();
        let context = ResilienceContext::new(cancellation.clone())
            .with_limiter(self.inner.limiter.clone())
            .with_metrics(metrics.clone());
        let result = self
            .inner
            .pipeline
            .send(request, context)
            .instrument(span)
            .await;
        metrics.record_request_completed(&result);
        result
    }

    /// Like [`HttpClient::send`], decoding a success body through the serializer registry.
    pub async fn send_typed<T>(
        &self,
        request: TransportRequest,
        cancellation: &CancellationToken,
    ) -> MigrxResult<ResponseEnvelope<T>>
    where
        T: DeserializeOwned,
    {
        let response = self.send(request, cancellation).await?;
        let payload = if response.is_success() && !response.body().is_empty() {
            Some(
                self.inner
                    .serializers
                    .deserialize(response.content_type(), response.body())?,
            )
        } else {
            None
        };
        Ok(ResponseEnvelope::new(response, payload))
    }

    /// Chunked upload of `reader`; see [`ChunkedStreamProcessor::process`].
    pub async fn process<T, R, F>(
        &self,
        reader: &mut R,
        request_factory: F,
        cancellation: &CancellationToken,
    ) -> MigrxResult<Vec<ResponseEnvelope<T>>>
    where
        T: DeserializeOwned + Send,
        R: AsyncRead + Unpin + Send + ?Sized,
        F: FnMut(&Chunk) -> MigrxResult<TransportRequest> + Send,
    {
        ChunkedStreamProcessor::new(self.clone())
            .process(reader, request_factory, cancellation)
            .await
    }

    /// Ranged download of `total_len` bytes into `writer`; see [`ChunkedStreamProcessor::download`].
    pub async fn download<W, F>(
        &self,
        total_len: u64,
        range_factory: F,
        writer: &mut W,
        cancellation: &CancellationToken,
    ) -> MigrxResult<DownloadSummary>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
        F: FnMut(&ChunkRange) -> MigrxResult<TransportRequest> + Send,
    {
        ChunkedStreamProcessor::new(self.clone())
            .download(total_len, range_factory, writer, cancellation)
            .await
    }

    pub fn metrics(&self) -> &TransportMetrics {
        &self.inner.metrics
    }

    pub fn metrics_snapshot(&self) -> TransportMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Fresh capture of the live options.
    pub fn options_snapshot(&self) -> OptionsSnapshot {
        OptionsSnapshot::capture(self.inner.options.as_ref())
    }

    pub fn pipeline_order(&self) -> &[StrategyKind] {
        self.inner.pipeline.order()
    }

    pub fn limiter(&self) -> Option<&ConcurrencyLimiter> {
        self.inner.limiter.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.inner
            .limiter
            .as_ref()
            .map_or(0, ConcurrencyLimiter::in_flight)
    }

    pub fn client_name(&self) -> &str {
        &self.inner.client_name
    }

    fn apply_default_headers(&self, request: &mut TransportRequest) {
        let headers = request.headers_mut();
        for (name, value) in &self.inner.default_headers {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        if !headers.contains_key(ACCEPT)
            && let Ok(accept) = HeaderValue::from_str(&self.inner.serializers.accept_header_value())
        {
            headers.insert(ACCEPT, accept);
        }
    }
}
