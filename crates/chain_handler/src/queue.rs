//! Fair message queue feeding a dispatcher
//!
//! Messages are kept in arrival order. `pop` hands out the oldest message
//! whose sender is within its CPU share; senders above their share are
//! passed over as a whole, which keeps each sender's own messages in order.
//! When every sender is over its share the oldest message is popped anyway.

use crate::error::ChainResult;
use crate::ids::NodeId;
use crate::message::Message;
use crate::metrics::QueueMetrics;
use crate::tracker::CpuTracker;
use crate::validators::ValidatorSet;
use parking_lot::Mutex;
use prometheus::Registry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    msgs: VecDeque<Message>,
    /// Number of queued messages per sender
    node_to_unprocessed: HashMap<NodeId, usize>,
    closed: bool,
}

/// Unbounded, peer-fair queue with blocking pop and explicit shutdown
pub struct MessageQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    validators: Arc<dyn ValidatorSet>,
    cpu_tracker: Arc<dyn CpuTracker>,
    metrics: QueueMetrics,
}

impl MessageQueue {
    /// Create a queue registering its metrics under `namespace`
    pub fn new(
        validators: Arc<dyn ValidatorSet>,
        cpu_tracker: Arc<dyn CpuTracker>,
        namespace: &str,
        registry: &Registry,
    ) -> ChainResult<Self> {
        Ok(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            validators,
            cpu_tracker,
            metrics: QueueMetrics::new(namespace, registry)?,
        })
    }

    /// Add a message and wake a waiting `pop`. Messages pushed after
    /// shutdown are dropped and their completion runs immediately.
    pub fn push(&self, msg: Message) {
        {
            let mut state = self.state.lock();
            if !state.closed {
                let op = msg.op().name();
                *state.node_to_unprocessed.entry(msg.node_id()).or_insert(0) += 1;
                state.msgs.push_back(msg);

                self.metrics.ops.with_label_values(&[op]).inc();
                self.metrics.len.set(state.msgs.len() as i64);
                self.metrics
                    .nodes_with_messages
                    .set(state.node_to_unprocessed.len() as i64);
                drop(state);
                self.notify.notify_one();
                return;
            }
        }

        debug!(
            node_id = %msg.node_id(),
            op = msg.op().name(),
            "dropping message pushed after queue shutdown"
        );
        msg.on_finished_handling();
    }

    /// Wait for the next message. Returns `None` once the queue is shut down
    /// and drained.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(msg) = self.pop_fair(&mut state) {
                    return Some(msg);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.state.lock().msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting messages and wake every waiter. Already queued
    /// messages stay poppable.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
        // A popper between its emptiness check and its wait still needs a permit
        self.notify.notify_one();
    }

    fn pop_fair(&self, state: &mut QueueState) -> Option<Message> {
        if state.msgs.is_empty() {
            return None;
        }

        let now = Instant::now();
        let num_nodes = state.node_to_unprocessed.len();
        // Once a sender is passed over, its later messages are too
        let mut passed_over: HashSet<NodeId> = HashSet::new();
        let mut selected = None;
        for (index, msg) in state.msgs.iter().enumerate() {
            if passed_over.contains(&msg.node_id()) {
                continue;
            }
            if self.can_pop(msg, num_nodes, now) {
                selected = Some(index);
                break;
            }
            passed_over.insert(msg.node_id());
            self.metrics.excessive_cpu.inc();
        }

        let index = selected.unwrap_or_else(|| {
            debug!(
                num_messages = state.msgs.len(),
                "no unprocessed message can be popped fairly"
            );
            0
        });
        let msg = state.msgs.remove(index)?;
        self.on_popped(state, &msg);
        Some(msg)
    }

    fn can_pop(&self, msg: &Message, num_nodes: usize, now: Instant) -> bool {
        if msg.op().is_connectivity() {
            return true;
        }

        // Expired messages are cheap, they are dropped by the dispatcher
        if msg.is_expired(now) {
            return true;
        }

        let node_id = msg.node_id();
        let recent_cpu_usage = self.cpu_tracker.usage(node_id, now);

        let total_weight = self.validators.total_weight();
        let portion_weight = if total_weight == 0 {
            0.0
        } else {
            self.validators.weight(node_id) as f64 / total_weight as f64
        };

        // Share of a node without stake, validators may use more
        let base_max_cpu = 1.0 / num_nodes.max(1) as f64;
        let max_cpu = base_max_cpu + (1.0 - base_max_cpu) * portion_weight;
        recent_cpu_usage <= max_cpu
    }

    fn on_popped(&self, state: &mut QueueState, msg: &Message) {
        let node_id = msg.node_id();
        if let Some(count) = state.node_to_unprocessed.get_mut(&node_id) {
            *count -= 1;
            if *count == 0 {
                state.node_to_unprocessed.remove(&node_id);
            }
        }

        self.metrics.ops.with_label_values(&[msg.op().name()]).dec();
        self.metrics.len.set(state.msgs.len() as i64);
        self.metrics
            .nodes_with_messages
            .set(state.node_to_unprocessed.len() as i64);
    }
}
