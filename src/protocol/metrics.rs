use std::sync::atomic::{AtomicU64, Ordering};

/// Track wirecall runtime metrics without external dependencies.
pub(crate) struct Metrics;

static CALLS_SENT: AtomicU64 = AtomicU64::new(0);
static RESPONSES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static CALLS_FAILED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_SERVED: AtomicU64 = AtomicU64::new(0);
static ERROR_RESPONSES: AtomicU64 = AtomicU64::new(0);
static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static REJECTED_HANDSHAKES: AtomicU64 = AtomicU64::new(0);

impl Metrics {
    #[inline]
    pub(crate) fn record_call_sent() {
        CALLS_SENT.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_response_received() {
        RESPONSES_RECEIVED.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_call_failed() {
        CALLS_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_request_served(is_error: bool) {
        REQUESTS_SERVED.fetch_add(1, Ordering::Relaxed);
        if is_error {
            ERROR_RESPONSES.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_connection_open() {
        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connection_close() {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_rejected_handshake() {
        REJECTED_HANDSHAKES.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn totals() -> MetricsSnapshot {
        MetricsSnapshot {
            calls_sent: CALLS_SENT.load(Ordering::Relaxed),
            responses_received: RESPONSES_RECEIVED.load(Ordering::Relaxed),
            calls_failed: CALLS_FAILED.load(Ordering::Relaxed),
            requests_served: REQUESTS_SERVED.load(Ordering::Relaxed),
            error_responses: ERROR_RESPONSES.load(Ordering::Relaxed),
            active_connections: ACTIVE_CONNECTIONS.load(Ordering::Relaxed),
            rejected_handshakes: REJECTED_HANDSHAKES.load(Ordering::Relaxed),
        }
    }
}

/// Process-wide counters at a point in time.
#[derive(Default, Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    /// Requests written by clients
    pub calls_sent: u64,
    /// Responses matched to a pending call
    pub responses_received: u64,
    /// Calls completed with an error of any kind
    pub calls_failed: u64,
    /// Responses written by servers
    pub requests_served: u64,
    /// Server responses that carried an error header
    pub error_responses: u64,
    /// Server connections currently being served
    pub active_connections: u64,
    /// Connections dropped during negotiation
    pub rejected_handshakes: u64,
}

impl MetricsSnapshot {
    /// Fraction of served requests that failed, if any were served.
    #[must_use]
    pub fn error_ratio(&self) -> Option<f64> {
        if self.requests_served == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some(self.error_responses as f64 / self.requests_served as f64)
    }
}

/// Snapshot of the process-wide counters.
#[must_use]
pub fn snapshot() -> MetricsSnapshot {
    Metrics::totals()
}
