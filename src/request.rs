use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;

use crate::MigrxResult;
use crate::error::Error;
use crate::util::redact_uri_for_logs;

/// One HTTP request as it travels through the resilience pipeline.
///
/// The body is a buffered [`Bytes`] so a retried attempt re-sends the identical payload
/// without copying it.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl TransportRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn parse(method: Method, uri: &str) -> MigrxResult<Self> {
        let parsed = uri.parse::<Uri>().map_err(|_| Error::InvalidUri {
            uri: redact_uri_for_logs(uri),
        })?;
        if parsed.scheme().is_none() || parsed.host().is_none() {
            return Err(Error::InvalidUri {
                uri: redact_uri_for_logs(uri),
            });
        }
        Ok(Self::new(method, parsed))
    }

    pub fn get(uri: &str) -> MigrxResult<Self> {
        Self::parse(Method::GET, uri)
    }

    pub fn post(uri: &str) -> MigrxResult<Self> {
        Self::parse(Method::POST, uri)
    }

    pub fn put(uri: &str) -> MigrxResult<Self> {
        Self::parse(Method::PUT, uri)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> MigrxResult<Self> {
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
        Ok(self.header(header_name, header_value))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T>(mut self, value: &T) -> MigrxResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value).map_err(|source| Error::Serialize { source })?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Bytes::from(body);
        Ok(self)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// URI with userinfo, query and fragment stripped, safe for logs and error values.
    pub fn redacted_uri(&self) -> String {
        redact_uri_for_logs(&self.uri.to_string())
    }

    pub(crate) fn into_http(self) -> MigrxResult<http::Request<Bytes>> {
        let mut builder = http::Request::builder().method(self.method).uri(self.uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers;
        }
        builder
            .body(self.body)
            .map_err(|source| Error::RequestBuild { source })
    }
}
