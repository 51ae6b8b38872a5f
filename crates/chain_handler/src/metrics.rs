//! Prometheus metrics for the handler and its message queues

use crate::error::ChainResult;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, HistogramOpts,
    HistogramVec, IntCounter, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::time::Duration;

/// Buckets (seconds) for message handling latencies
const LATENCY_BUCKETS: &[f64] = &[
    0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0,
];

/// Dispatcher metrics
#[derive(Debug, Clone)]
pub struct HandlerMetrics {
    /// Sync messages dropped because their deadline passed
    pub expired: IntCounter,
    /// Async messages dropped because their deadline passed
    pub async_expired: IntCounter,
    /// Time a message spent queued before a dispatcher picked it up
    queue_wait_time: HistogramVec,
    /// Time from dequeue until the engine could be invoked
    message_handling_time: HistogramVec,
    /// Time from dequeue until the engine returned
    processing_time: HistogramVec,
    /// Messages handled during normal operation that exceeded the warn limit
    pub slow_processing: IntCounter,
    /// Registered timeouts that have neither fired nor been abandoned
    pub pending_timeouts: IntGauge,
}

impl HandlerMetrics {
    pub fn new(namespace: &str, registry: &Registry) -> ChainResult<Self> {
        Ok(Self {
            expired: register_int_counter_with_registry!(
                Opts::new("expired", "Incoming sync messages dropped because the message deadline expired")
                    .namespace(namespace),
                registry
            )?,
            async_expired: register_int_counter_with_registry!(
                Opts::new("async_expired", "Incoming async messages dropped because the message deadline expired")
                    .namespace(namespace),
                registry
            )?,
            queue_wait_time: register_histogram_vec_with_registry!(
                HistogramOpts::new("queue_wait_time", "Seconds a message spent queued before dispatch")
                    .namespace(namespace)
                    .buckets(LATENCY_BUCKETS.to_vec()),
                &["op"],
                registry
            )?,
            message_handling_time: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "message_handling_time",
                    "Seconds spent waiting for the consensus lock before handling a message"
                )
                .namespace(namespace)
                .buckets(LATENCY_BUCKETS.to_vec()),
                &["op"],
                registry
            )?,
            processing_time: register_histogram_vec_with_registry!(
                HistogramOpts::new("processing_time", "Seconds spent handling a message")
                    .namespace(namespace)
                    .buckets(LATENCY_BUCKETS.to_vec()),
                &["op"],
                registry
            )?,
            slow_processing: register_int_counter_with_registry!(
                Opts::new("slow_msgs", "Messages whose processing exceeded the warn limit during normal operation")
                    .namespace(namespace),
                registry
            )?,
            pending_timeouts: register_int_gauge_with_registry!(
                Opts::new("pending_timeouts", "Registered timeouts not yet delivered or abandoned")
                    .namespace(namespace),
                registry
            )?,
        })
    }

    /// Record latencies of one handled message
    pub fn observe(&self, op: &str, queue_wait: Duration, handling: Duration, processing: Duration) {
        self.queue_wait_time
            .with_label_values(&[op])
            .observe(queue_wait.as_secs_f64());
        self.message_handling_time
            .with_label_values(&[op])
            .observe(handling.as_secs_f64());
        self.processing_time
            .with_label_values(&[op])
            .observe(processing.as_secs_f64());
    }

    /// Number of messages observed for `op`
    pub fn handled(&self, op: &str) -> u64 {
        self.processing_time.with_label_values(&[op]).get_sample_count()
    }
}

/// Message queue metrics
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    /// Messages waiting in the queue
    pub len: IntGauge,
    /// Messages waiting in the queue, by operation
    pub ops: IntGaugeVec,
    /// Distinct nodes with at least one queued message
    pub nodes_with_messages: IntGauge,
    /// Times a message was skipped because its sender used too much CPU
    pub excessive_cpu: IntCounter,
}

impl QueueMetrics {
    pub fn new(namespace: &str, registry: &Registry) -> ChainResult<Self> {
        Ok(Self {
            len: register_int_gauge_with_registry!(
                Opts::new("unprocessed_msgs_len", "Messages in the queue").namespace(namespace),
                registry
            )?,
            ops: register_int_gauge_vec_with_registry!(
                Opts::new("unprocessed_msgs", "Messages in the queue by operation").namespace(namespace),
                &["op"],
                registry
            )?,
            nodes_with_messages: register_int_gauge_with_registry!(
                Opts::new("nodes_with_msgs", "Nodes with at least one queued message").namespace(namespace),
                registry
            )?,
            excessive_cpu: register_int_counter_with_registry!(
                Opts::new(
                    "excessive_cpu",
                    "Times a message was passed over because its sender exceeded its CPU share"
                )
                .namespace(namespace),
                registry
            )?,
        })
    }
}
