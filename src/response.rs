use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode};

use crate::MigrxResult;
use crate::util::http_status_error;

/// Untyped response envelope: status, success flag, headers and raw body.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Converts a non-success status into [`crate::Error::HttpStatus`].
    pub fn error_for_status(self, method: &Method, redacted_uri: &str) -> MigrxResult<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(http_status_error(
            self.status,
            method,
            redacted_uri,
            &self.headers,
            &self.body,
        ))
    }
}

/// Response envelope carrying an optionally deserialized payload.
///
/// The payload is only decoded for success statuses with a non-empty body; failures keep the
/// raw body so callers can extract structured error detail themselves.
#[derive(Clone, Debug)]
pub struct ResponseEnvelope<T> {
    response: Response,
    payload: Option<T>,
}

impl<T> ResponseEnvelope<T> {
    pub(crate) fn new(response: Response, payload: Option<T>) -> Self {
        Self { response, payload }
    }

    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn is_success(&self) -> bool {
        self.response.is_success()
    }

    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<T> {
        self.payload
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn into_parts(self) -> (Response, Option<T>) {
        (self.response, self.payload)
    }
}
