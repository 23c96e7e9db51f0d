use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::response::Response;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub server_throttles: u64,
    pub client_throttle_waits: u64,
    pub attempt_timeouts: u64,
    pub cancellations: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
    pub chunks_sent: u64,
    pub chunk_bytes_sent: u64,
    pub chunks_received: u64,
    pub chunk_bytes_received: u64,
}

/// Counters shared by every call issued through one client scope.
#[derive(Clone, Debug, Default)]
pub struct TransportMetrics {
    inner: Arc<TransportMetricsInner>,
}

#[derive(Debug, Default)]
struct TransportMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    server_throttles: AtomicU64,
    client_throttle_waits: AtomicU64,
    attempt_timeouts: AtomicU64,
    cancellations: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
    chunks_sent: AtomicU64,
    chunk_bytes_sent: AtomicU64,
    chunks_received: AtomicU64,
    chunk_bytes_received: AtomicU64,
}

pub(crate) struct InFlightGuard {
    metrics: TransportMetrics,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_completed(&self, result: &crate::MigrxResult<Response>) {
        match result {
            Ok(response) if response.is_success() => {
                self.inner
                    .requests_succeeded
                    .fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) if error.is_cancelled() => {
                self.inner.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_server_throttle(&self) {
        self.inner.server_throttles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_client_throttle_wait(&self) {
        self.inner
            .client_throttle_waits
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt_timeout(&self) {
        self.inner.attempt_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk_sent(&self, bytes: usize) {
        self.inner.chunks_sent.fetch_add(1, Ordering::Relaxed);
        self.inner
            .chunk_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk_received(&self, bytes: usize) {
        self.inner.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.inner
            .chunk_bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        let now = self.inner.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub fn snapshot(&self) -> TransportMetricsSnapshot {
        let inner = &self.inner;
        TransportMetricsSnapshot {
            requests_started: inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: inner.requests_failed.load(Ordering::Relaxed),
            attempts: inner.attempts.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            server_throttles: inner.server_throttles.load(Ordering::Relaxed),
            client_throttle_waits: inner.client_throttle_waits.load(Ordering::Relaxed),
            attempt_timeouts: inner.attempt_timeouts.load(Ordering::Relaxed),
            cancellations: inner.cancellations.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Acquire),
            peak_in_flight: inner.peak_in_flight.load(Ordering::Acquire),
            chunks_sent: inner.chunks_sent.load(Ordering::Relaxed),
            chunk_bytes_sent: inner.chunk_bytes_sent.load(Ordering::Relaxed),
            chunks_received: inner.chunks_received.load(Ordering::Relaxed),
            chunk_bytes_received: inner.chunk_bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::TransportMetrics;
    use crate::response::Response;

    #[test]
    fn in_flight_guard_tracks_peak() {
        let metrics = TransportMetrics::new();
        let first = metrics.enter_in_flight();
        let second = metrics.enter_in_flight();
        assert_eq!(metrics.snapshot().in_flight, 2);
        drop(first);
        drop(second);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.peak_in_flight, 2);
    }

    #[test]
    fn cancelled_requests_are_not_counted_as_failures() {
        let metrics = TransportMetrics::new();
        metrics.record_request_completed(&Err(crate::Error::Cancelled));
        metrics.record_request_completed(&Err(crate::Error::ConcurrencyLimitClosed));
        metrics.record_request_completed(&Ok(Response::new(
            StatusCode::NOT_FOUND,
            HeaderMap::new(),
            Bytes::new(),
        )));
        metrics.record_request_completed(&Ok(Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::new(),
        )));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cancellations, 1);
        assert_eq!(snapshot.requests_failed, 2);
        assert_eq!(snapshot.requests_succeeded, 1);
    }
}
