use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::MigrxResult;
use crate::error::Error;
use crate::request::TransportRequest;
use crate::resilience::{RequestSender, ResilienceContext};
use crate::response::Response;
use crate::util::{cancellable, classify_transport_error};

const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 64 * 1024 * 1024 + 64 * 1024;
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Pooled HTTP/1.1 + HTTP/2 transport over rustls with webpki roots.
#[derive(Clone, Debug)]
pub struct HyperTransport {
    client: HyperClient,
    max_response_body_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct HyperTransportBuilder {
    max_response_body_bytes: usize,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    http2_only: bool,
}

impl Default for HyperTransportBuilder {
    fn default() -> Self {
        Self {
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            http2_only: false,
        }
    }
}

impl HyperTransportBuilder {
    /// Default limit fits the largest chunk plus headroom for envelope metadata.
    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }

    pub fn http2_only(mut self, http2_only: bool) -> Self {
        self.http2_only = http2_only;
        self
    }

    pub fn build(self) -> HyperTransport {
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(self.pool_idle_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .http2_only(self.http2_only)
            .build(https);
        HyperTransport {
            client,
            max_response_body_bytes: self.max_response_body_bytes,
        }
    }
}

impl HyperTransport {
    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::default()
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn max_response_body_bytes(&self) -> usize {
        self.max_response_body_bytes
    }

    async fn execute(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> MigrxResult<Response> {
        let method = request.method().clone();
        let uri = request.redacted_uri();
        let http_request = request.into_http()?.map(Full::new);

        debug!(attempt = context.attempt(), method = %method, uri = %uri, "transport send");
        let response = cancellable(context.cancellation(), self.client.request(http_request))
            .await?
            .map_err(|source| Error::Transport {
                kind: classify_transport_error(&source),
                method: method.clone(),
                uri: uri.clone(),
                source: Box::new(source),
            })?;

        let (parts, body) = response.into_parts();
        let body = cancellable(
            context.cancellation(),
            read_body_limited(body, self.max_response_body_bytes),
        )
        .await?
        .map_err(|error| match error {
            ReadBodyError::Read(source) => Error::ReadBody {
                source: Box::new(source),
            },
            ReadBodyError::TooLarge => Error::ResponseBodyTooLarge {
                limit_bytes: self.max_response_body_bytes,
                method: method.clone(),
                uri: uri.clone(),
            },
        })?;

        debug!(
            status = parts.status.as_u16(),
            body_bytes = body.len(),
            method = %method,
            uri = %uri,
            "transport response"
        );
        Ok(Response::new(parts.status, parts.headers, body))
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSender for HyperTransport {
    fn send(
        &self,
        request: TransportRequest,
        context: ResilienceContext,
    ) -> BoxFuture<'_, MigrxResult<Response>> {
        Box::pin(self.execute(request, context))
    }
}

enum ReadBodyError {
    Read(hyper::Error),
    TooLarge,
}

async fn read_body_limited(mut body: Incoming, max_bytes: usize) -> Result<Bytes, ReadBodyError> {
    let mut collected = Vec::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            if collected.len().saturating_add(data.len()) > max_bytes {
                return Err(ReadBodyError::TooLarge);
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}
