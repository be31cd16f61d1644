use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide counters and gauges for one subscriber stream.
///
/// All fields are atomics so probes never contend with the channel
/// operation mutex.
#[derive(Debug, Default)]
pub struct SubscriberMetrics {
    processed_success: AtomicU64,
    processed_transient_error: AtomicU64,
    processed_permanent_error: AtomicU64,
    processed_panic: AtomicU64,
    ack_errors: AtomicU64,
    nack_errors: AtomicU64,
    retry_publish_errors: AtomicU64,
    worker_in_flight: AtomicU64,
    connected: AtomicBool,
    last_connect_ns: AtomicU64,
    last_delivery_ns: AtomicU64,
}

impl SubscriberMetrics {
    pub(crate) fn inc_success(&self) {
        self.processed_success.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_transient_error(&self) {
        self.processed_transient_error.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_permanent_error(&self) {
        self.processed_permanent_error.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_panic(&self) {
        self.processed_panic.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_ack_error(&self) {
        self.ack_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_nack_error(&self) {
        self.nack_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_retry_publish_error(&self) {
        self.retry_publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_started(&self) {
        self.worker_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn worker_finished(&self) {
        self.worker_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn record_connect_now(&self) {
        self.last_connect_ns.store(now_ns(), Ordering::SeqCst);
    }

    pub(crate) fn record_delivery_now(&self) {
        self.last_delivery_ns.store(now_ns(), Ordering::SeqCst);
    }

    pub(crate) fn last_connect_ns(&self) -> u64 {
        self.last_connect_ns.load(Ordering::SeqCst)
    }

    pub(crate) fn last_delivery_ns(&self) -> u64 {
        self.last_delivery_ns.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed_success_total: self.processed_success.load(Ordering::Relaxed),
            processed_transient_error_total: self.processed_transient_error.load(Ordering::Relaxed),
            processed_permanent_error_total: self.processed_permanent_error.load(Ordering::Relaxed),
            processed_panic_total: self.processed_panic.load(Ordering::Relaxed),
            ack_error_total: self.ack_errors.load(Ordering::Relaxed),
            nack_error_total: self.nack_errors.load(Ordering::Relaxed),
            retry_publish_error_total: self.retry_publish_errors.load(Ordering::Relaxed),
            worker_in_flight: self.worker_in_flight.load(Ordering::SeqCst),
            rabbitmq_connected: self.connected(),
            rabbitmq_last_connect_seconds: self.last_connect_ns() / 1_000_000_000,
            rabbitmq_last_delivery_seconds: self.last_delivery_ns() / 1_000_000_000,
        }
    }
}

/// Point-in-time copy of [`SubscriberMetrics`], suitable for health
/// endpoints and log-based dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub processed_success_total: u64,
    pub processed_transient_error_total: u64,
    pub processed_permanent_error_total: u64,
    pub processed_panic_total: u64,
    pub ack_error_total: u64,
    pub nack_error_total: u64,
    pub retry_publish_error_total: u64,
    pub worker_in_flight: u64,
    pub rabbitmq_connected: bool,
    pub rabbitmq_last_connect_seconds: u64,
    pub rabbitmq_last_delivery_seconds: u64,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
