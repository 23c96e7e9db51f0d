//! `migrx` is the resilient HTTP transport core of a content-migration SDK.
//!
//! Every request sent through an [`HttpClient`] passes a fixed resilience pipeline
//! (retry, admission control, server throttle, client throttle, per-attempt timeout) before
//! reaching the transport. Large payloads are moved with [`ChunkedStreamProcessor`], which
//! slices a byte stream into bounded chunks and sends them in strict order.
//!
//! # Quick Start
//!
//! ```no_run
//! use migrx::prelude::{HttpClient, NetworkOptions, SharedOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = SharedOptions::new(NetworkOptions::new().with_chunk_size_kb(4096));
//!     let client = HttpClient::builder()
//!         .base_url("https://tableau.example.com/api/3.22")
//!         .options(options.clone())
//!         .try_build()?;
//!
//!     let cancellation = CancellationToken::new();
//!     let mut file = tokio::fs::File::open("workbook.twbx").await?;
//!     let responses = client
//!         .process::<serde_json::Value, _, _>(
//!             &mut file,
//!             |chunk| {
//!                 Ok(client
//!                     .put("/sites/site-1/fileUploads/session-1")?
//!                     .body(chunk.data().clone()))
//!             },
//!             &cancellation,
//!         )
//!         .await?;
//!
//!     println!("uploaded {} chunks", responses.len());
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! - Options are read from an [`OptionsSource`] once per client build and once per chunked
//!   call; updating a [`SharedOptions`] only affects work that starts afterwards.
//! - An unset `chunk_size_kb` means 512 KB; configured values are clamped to `[1, 65536]` KB.

mod chunked;
mod client;
mod error;
mod metrics;
mod options;
mod request;
pub mod resilience;
mod response;
mod serializer;
mod transport;
mod util;

pub use crate::chunked::{Chunk, ChunkRange, ChunkedStreamProcessor, DownloadSummary};
pub use crate::client::{HttpClient, HttpClientBuilder};
pub use crate::error::{Error, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::metrics::{TransportMetrics, TransportMetricsSnapshot};
pub use crate::options::{
    DEFAULT_CHUNK_SIZE_KB, MAX_CHUNK_SIZE_KB, MIN_CHUNK_SIZE_KB, NetworkOptions, OptionsSnapshot,
    OptionsSource, SharedOptions, effective_chunk_size_kb,
};
pub use crate::request::TransportRequest;
pub use crate::resilience::admission::{AdmissionControl, AdmissionPermit, ConcurrencyLimiter};
pub use crate::resilience::client_throttle::{ClientThrottle, RateLimitPolicy, RateLimiter};
pub use crate::resilience::retry::{Retry, RetryClassifier, RetryDecision, RetryPolicy};
pub use crate::resilience::server_throttle::{
    ServerThrottle, ServerThrottleAccounting, ServerThrottlePolicy,
};
pub use crate::resilience::timeout::RequestTimeout;
pub use crate::resilience::{
    PipelineBuilder, RequestSender, ResilienceContext, ResiliencePipeline, ResilienceStrategy,
    SendFn, StrategyKind,
};
pub use crate::response::{Response, ResponseEnvelope};
pub use crate::serializer::{JsonSerializer, PayloadSerializer, SerializerRegistry};
pub use crate::transport::{HyperTransport, HyperTransportBuilder};

pub type MigrxResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Chunk, ChunkRange, ChunkedStreamProcessor, DownloadSummary, Error, ErrorCode,
        HttpClient, MigrxResult, NetworkOptions, OptionsSource, RequestSender,
        ResilienceContext, Response, ResponseEnvelope, RetryPolicy, ServerThrottleAccounting,
        SharedOptions, StrategyKind, TimeoutPhase, TransportErrorKind, TransportRequest,
    };
}
