//! Network options and the per-operation snapshot taken from them.
//!
//! Live configuration is exposed through [`OptionsSource`]. Every pipeline construction and
//! every chunked transfer reads it exactly once into an [`OptionsSnapshot`]; mutating the
//! source afterwards only affects operations that start later.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::resilience::client_throttle::RateLimitPolicy;
use crate::resilience::retry::RetryPolicy;
use crate::resilience::server_throttle::{ServerThrottleAccounting, ServerThrottlePolicy};
use crate::util::lock_unpoisoned;

pub const DEFAULT_CHUNK_SIZE_KB: u64 = 512;
pub const MIN_CHUNK_SIZE_KB: u64 = 1;
pub const MAX_CHUNK_SIZE_KB: u64 = 65_536;

const DEFAULT_RETRY_LIMIT: usize = 3;
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 10;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);
const DEFAULT_JITTER_RATIO: f64 = 0.2;
const DEFAULT_MAX_SERVER_THROTTLE_RETRIES: usize = 5;
const DEFAULT_SERVER_THROTTLE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_SERVER_THROTTLE_DELAY: Duration = Duration::from_secs(60);

/// Effective chunk size in KB: the configured value clamped to `[1, 65536]`, or the
/// 512 KB default when nothing is configured.
pub fn effective_chunk_size_kb(chunk_size_kb: Option<u64>) -> u64 {
    match chunk_size_kb {
        Some(configured) => configured.clamp(MIN_CHUNK_SIZE_KB, MAX_CHUNK_SIZE_KB),
        None => DEFAULT_CHUNK_SIZE_KB,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    pub chunk_size_kb: Option<u64>,
    pub retry_limit: usize,
    /// `None` disables admission control.
    pub max_concurrent_requests: Option<usize>,
    /// Requests per second; `None` disables client-side pacing.
    pub client_throttle_rate: Option<f64>,
    pub client_throttle_burst: usize,
    #[serde(rename = "request_timeout_ms", with = "serde_millis")]
    pub request_timeout: Duration,
    #[serde(rename = "base_backoff_ms", with = "serde_millis")]
    pub base_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "serde_millis")]
    pub max_backoff: Duration,
    pub jitter_ratio: f64,
    pub retry_on_timeout: bool,
    pub retryable_status_codes: BTreeSet<u16>,
    pub server_throttle_accounting: ServerThrottleAccounting,
    pub max_server_throttle_retries: usize,
    #[serde(rename = "default_server_throttle_delay_ms", with = "serde_millis")]
    pub default_server_throttle_delay: Duration,
    #[serde(rename = "max_server_throttle_delay_ms", with = "serde_millis")]
    pub max_server_throttle_delay: Duration,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            chunk_size_kb: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
            max_concurrent_requests: Some(DEFAULT_MAX_CONCURRENT_REQUESTS),
            client_throttle_rate: None,
            client_throttle_burst: 1,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            retry_on_timeout: true,
            retryable_status_codes: RetryPolicy::default_retryable_status_codes(),
            server_throttle_accounting: ServerThrottleAccounting::default(),
            max_server_throttle_retries: DEFAULT_MAX_SERVER_THROTTLE_RETRIES,
            default_server_throttle_delay: DEFAULT_SERVER_THROTTLE_DELAY,
            max_server_throttle_delay: DEFAULT_MAX_SERVER_THROTTLE_DELAY,
        }
    }
}

impl NetworkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(text: &str) -> crate::MigrxResult<Self> {
        let options: Self =
            serde_json::from_str(text).map_err(|source| Error::ParseOptions { source })?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_chunk_size_kb(mut self, chunk_size_kb: u64) -> Self {
        self.chunk_size_kb = Some(chunk_size_kb);
        self
    }

    pub fn without_chunk_size(mut self) -> Self {
        self.chunk_size_kb = None;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: usize) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_max_concurrent_requests(mut self, max_concurrent_requests: usize) -> Self {
        self.max_concurrent_requests = Some(max_concurrent_requests);
        self
    }

    pub fn without_concurrency_limit(mut self) -> Self {
        self.max_concurrent_requests = None;
        self
    }

    pub fn with_client_throttle_rate(mut self, requests_per_second: f64) -> Self {
        self.client_throttle_rate = Some(requests_per_second);
        self
    }

    pub fn with_client_throttle_burst(mut self, burst: usize) -> Self {
        self.client_throttle_burst = burst;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_backoff(mut self, base_backoff: Duration, max_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self.max_backoff = max_backoff.max(base_backoff);
        self
    }

    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio;
        self
    }

    pub fn with_retry_on_timeout(mut self, retry_on_timeout: bool) -> Self {
        self.retry_on_timeout = retry_on_timeout;
        self
    }

    pub fn with_retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn with_server_throttle_accounting(
        mut self,
        accounting: ServerThrottleAccounting,
    ) -> Self {
        self.server_throttle_accounting = accounting;
        self
    }

    pub fn with_max_server_throttle_retries(mut self, max_retries: usize) -> Self {
        self.max_server_throttle_retries = max_retries;
        self
    }

    pub fn with_server_throttle_delays(mut self, default_delay: Duration, max_delay: Duration) -> Self {
        self.default_server_throttle_delay = default_delay;
        self.max_server_throttle_delay = max_delay;
        self
    }

    pub fn validate(&self) -> crate::MigrxResult<()> {
        if self.max_concurrent_requests == Some(0) {
            return Err(Error::InvalidOptions {
                message: "max_concurrent_requests must be >= 1",
            });
        }
        if let Some(rate) = self.client_throttle_rate
            && (!rate.is_finite() || rate <= 0.0)
        {
            return Err(Error::InvalidOptions {
                message: "client_throttle_rate must be a finite value > 0",
            });
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidOptions {
                message: "request_timeout must be > 0",
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(Error::InvalidOptions {
                message: "jitter_ratio must be within [0, 1]",
            });
        }
        Ok(())
    }
}

/// Provider of the current live options.
pub trait OptionsSource: Send + Sync {
    fn current(&self) -> NetworkOptions;
}

impl OptionsSource for NetworkOptions {
    fn current(&self) -> NetworkOptions {
        self.clone()
    }
}

/// Mutable live options shared between the configuration layer and client scopes.
#[derive(Clone, Debug, Default)]
pub struct SharedOptions {
    inner: Arc<Mutex<NetworkOptions>>,
}

impl SharedOptions {
    pub fn new(options: NetworkOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(options)),
        }
    }

    pub fn update(&self, update: impl FnOnce(&mut NetworkOptions)) {
        let mut guard = lock_unpoisoned(&self.inner);
        update(&mut guard);
    }

    pub fn replace(&self, options: NetworkOptions) {
        *lock_unpoisoned(&self.inner) = options;
    }
}

impl OptionsSource for SharedOptions {
    fn current(&self) -> NetworkOptions {
        lock_unpoisoned(&self.inner).clone()
    }
}

/// Immutable capture of [`NetworkOptions`] for the duration of one operation.
#[derive(Clone, Debug)]
pub struct OptionsSnapshot {
    options: Arc<NetworkOptions>,
}

impl OptionsSnapshot {
    pub fn capture(source: &dyn OptionsSource) -> Self {
        Self::from_options(source.current())
    }

    pub fn from_options(options: NetworkOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &NetworkOptions {
        &self.options
    }

    pub fn effective_chunk_size_kb(&self) -> u64 {
        effective_chunk_size_kb(self.options.chunk_size_kb)
    }

    pub fn effective_chunk_size_bytes(&self) -> usize {
        (self.effective_chunk_size_kb() * 1024) as usize
    }

    pub fn request_timeout(&self) -> Duration {
        self.options.request_timeout
    }

    pub fn max_concurrent_requests(&self) -> Option<usize> {
        self.options.max_concurrent_requests
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::standard()
            .max_attempts(self.options.retry_limit.saturating_add(1))
            .base_backoff(self.options.base_backoff)
            .max_backoff(self.options.max_backoff)
            .jitter_ratio(self.options.jitter_ratio)
            .max_retry_after(self.options.max_server_throttle_delay)
            .retry_on_timeout(self.options.retry_on_timeout)
            .retryable_status_codes(self.options.retryable_status_codes.iter().copied())
    }

    pub fn rate_limit_policy(&self) -> Option<RateLimitPolicy> {
        self.options.client_throttle_rate.map(|rate| {
            RateLimitPolicy::standard()
                .requests_per_second(rate)
                .burst(self.options.client_throttle_burst)
                .max_throttle_delay(self.options.max_server_throttle_delay)
        })
    }

    pub fn server_throttle_policy(&self) -> ServerThrottlePolicy {
        ServerThrottlePolicy::standard()
            .accounting(self.options.server_throttle_accounting)
            .max_throttle_retries(self.options.max_server_throttle_retries)
            .default_delay(self.options.default_server_throttle_delay)
            .max_delay(self.options.max_server_throttle_delay)
    }
}

mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(crate::util::duration_millis(*value))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_chunk_size_clamps_configured_values() {
        assert_eq!(effective_chunk_size_kb(None), 512);
        assert_eq!(effective_chunk_size_kb(Some(0)), 1);
        assert_eq!(effective_chunk_size_kb(Some(1)), 1);
        assert_eq!(effective_chunk_size_kb(Some(15 * 1024)), 15 * 1024);
        assert_eq!(effective_chunk_size_kb(Some(65_536)), 65_536);
        assert_eq!(effective_chunk_size_kb(Some(150 * 1024)), 65_536);
        assert_eq!(effective_chunk_size_kb(Some(u64::MAX)), 65_536);
    }

    #[test]
    fn effective_chunk_size_stays_within_bounds_for_all_small_values() {
        for configured in 0..=70_000_u64 {
            let effective = effective_chunk_size_kb(Some(configured));
            assert!((MIN_CHUNK_SIZE_KB..=MAX_CHUNK_SIZE_KB).contains(&effective));
        }
    }

    #[test]
    fn snapshot_is_isolated_from_later_updates() {
        let live = SharedOptions::new(NetworkOptions::new().with_chunk_size_kb(512));
        let snapshot = OptionsSnapshot::capture(&live);

        live.update(|options| options.chunk_size_kb = Some(1));

        assert_eq!(snapshot.effective_chunk_size_bytes(), 512 * 1024);
        assert_eq!(OptionsSnapshot::capture(&live).effective_chunk_size_bytes(), 1024);
    }

    #[test]
    fn options_parse_from_json_with_defaults() {
        let options = NetworkOptions::from_json_str(
            r#"{
                "chunk_size_kb": 2048,
                "retry_limit": 5,
                "request_timeout_ms": 1500,
                "server_throttle_accounting": "consumes_retry_attempt"
            }"#,
        )
        .expect("options should parse");

        assert_eq!(options.chunk_size_kb, Some(2048));
        assert_eq!(options.retry_limit, 5);
        assert_eq!(options.request_timeout, Duration::from_millis(1500));
        assert_eq!(
            options.server_throttle_accounting,
            ServerThrottleAccounting::ConsumesRetryAttempt
        );
        assert_eq!(options.max_concurrent_requests, Some(10));
        assert!(options.retryable_status_codes.contains(&503));
    }

    #[test]
    fn options_json_rejects_invalid_values() {
        let error = NetworkOptions::from_json_str(r#"{ "max_concurrent_requests": 0 }"#)
            .expect_err("zero concurrency should be rejected");
        assert_eq!(error.code(), crate::ErrorCode::InvalidOptions);

        let error = NetworkOptions::from_json_str("{ not json")
            .expect_err("malformed json should be rejected");
        assert_eq!(error.code(), crate::ErrorCode::ParseOptions);
    }

    #[test]
    fn snapshot_derives_retry_attempts_from_retry_limit() {
        let snapshot = OptionsSnapshot::from_options(NetworkOptions::new().with_retry_limit(2));
        assert_eq!(snapshot.retry_policy().configured_max_attempts(), 3);
    }
}
