use http::{HeaderMap, Method};
use thiserror::Error;

use crate::resilience::StrategyKind;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    /// A single transport attempt, bounded by the request-timeout strategy.
    Attempt,
    ResponseBody,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Attempt => "attempt",
            Self::ResponseBody => "response_body",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    SerializeJson,
    RequestBuild,
    InvalidHeaderName,
    InvalidHeaderValue,
    Transport,
    Timeout,
    ReadBody,
    ResponseBodyTooLarge,
    HttpStatus,
    ServerThrottled,
    Deserialize,
    UnsupportedContentType,
    ConcurrencyLimitClosed,
    Cancelled,
    RetryExhausted,
    SourceRead,
    SinkWrite,
    ChunkSendFailed,
    ChunkLengthMismatch,
    DuplicateStrategy,
    InvalidOptions,
    ParseOptions,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::SerializeJson => "serialize_json",
            Self::RequestBuild => "request_build",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::HttpStatus => "http_status",
            Self::ServerThrottled => "server_throttled",
            Self::Deserialize => "deserialize",
            Self::UnsupportedContentType => "unsupported_content_type",
            Self::ConcurrencyLimitClosed => "concurrency_limit_closed",
            Self::Cancelled => "cancelled",
            Self::RetryExhausted => "retry_exhausted",
            Self::SourceRead => "source_read",
            Self::SinkWrite => "sink_write",
            Self::ChunkSendFailed => "chunk_send_failed",
            Self::ChunkLengthMismatch => "chunk_length_mismatch",
            Self::DuplicateStrategy => "duplicate_strategy",
            Self::InvalidOptions => "invalid_options",
            Self::ParseOptions => "parse_options",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out in {phase} after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("response body exceeds {limit_bytes} bytes for {method} {uri}")]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        headers: Box<HeaderMap>,
        body: String,
    },
    #[error("server throttled {method} {uri}; retry after {retry_after_ms}ms")]
    ServerThrottled {
        method: Method,
        uri: String,
        retry_after_ms: u128,
        headers: Box<HeaderMap>,
        body: String,
    },
    #[error("failed to decode response payload ({content_type}): {source}; body={body}")]
    Deserialize {
        content_type: String,
        #[source]
        source: BoxError,
        body: String,
    },
    #[error("no serializer registered for response content-type {content_type}")]
    UnsupportedContentType { content_type: String },
    #[error("request concurrency limiter is closed")]
    ConcurrencyLimitClosed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("retry attempts exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        last: Box<Error>,
    },
    #[error("failed to read chunk {chunk_index} from source stream: {source}")]
    SourceRead {
        chunk_index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write chunk {chunk_index} to sink: {source}")]
    SinkWrite {
        chunk_index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("chunk {chunk_index} failed after {bytes_sent} bytes were transferred: {source}")]
    ChunkSendFailed {
        chunk_index: usize,
        bytes_sent: u64,
        #[source]
        source: Box<Error>,
    },
    #[error("chunk {chunk_index} length mismatch: expected={expected} actual={actual}")]
    ChunkLengthMismatch {
        chunk_index: usize,
        expected: u64,
        actual: u64,
    },
    #[error("resilience strategy {kind} was supplied more than once")]
    DuplicateStrategy { kind: StrategyKind },
    #[error("invalid network options: {message}")]
    InvalidOptions { message: &'static str },
    #[error("failed to parse network options: {source}")]
    ParseOptions {
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::ServerThrottled { .. } => ErrorCode::ServerThrottled,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::UnsupportedContentType { .. } => ErrorCode::UnsupportedContentType,
            Self::ConcurrencyLimitClosed => ErrorCode::ConcurrencyLimitClosed,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            Self::SourceRead { .. } => ErrorCode::SourceRead,
            Self::SinkWrite { .. } => ErrorCode::SinkWrite,
            Self::ChunkSendFailed { .. } => ErrorCode::ChunkSendFailed,
            Self::ChunkLengthMismatch { .. } => ErrorCode::ChunkLengthMismatch,
            Self::DuplicateStrategy { .. } => ErrorCode::DuplicateStrategy,
            Self::InvalidOptions { .. } => ErrorCode::InvalidOptions,
            Self::ParseOptions { .. } => ErrorCode::ParseOptions,
        }
    }

    /// Cancellation is intentional abandonment, not a failure of the remote side.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Status code of the underlying HTTP failure, looking through retry and chunk wrappers.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::ServerThrottled { .. } => Some(http::StatusCode::TOO_MANY_REQUESTS.as_u16()),
            Self::RetryExhausted { last, .. } => last.status(),
            Self::ChunkSendFailed { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Raw (truncated) response body of the underlying HTTP failure, for error-payload parsing.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { body, .. } | Self::ServerThrottled { body, .. } => Some(body),
            Self::RetryExhausted { last, .. } => last.response_body(),
            Self::ChunkSendFailed { source, .. } => source.response_body(),
            _ => None,
        }
    }
}
