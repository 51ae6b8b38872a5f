//! Per-peer resource accounting consumed by the handler

use crate::ids::NodeId;
use std::sync::Arc;
use tokio::time::Instant;

/// Estimates recent CPU usage caused by each peer
pub trait CpuTracker: Send + Sync {
    /// Recent CPU usage attributed to `node_id`, as a fraction of one core
    fn usage(&self, node_id: NodeId, now: Instant) -> f64;
}

/// Records when processing on behalf of a peer starts and stops
pub trait ResourceTracker: Send + Sync {
    fn start_processing(&self, node_id: NodeId, now: Instant);

    fn stop_processing(&self, node_id: NodeId, now: Instant);

    /// Tracker feeding the message queue's fairness policy
    fn cpu_tracker(&self) -> Arc<dyn CpuTracker>;
}
