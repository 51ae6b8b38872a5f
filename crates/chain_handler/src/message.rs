//! Inbound chain messages
//!
//! Every protocol operation is a variant of [`Op`] carrying its own payload,
//! so dispatch is an exhaustive `match` rather than a runtime type switch.
//! Identifiers arrive as raw bytes and are decoded at dispatch time so a
//! malformed field can be answered with the matching failure callback.

use crate::context::EngineType;
use crate::ids::{ChainId, NodeId, SubnetId, Version};
use std::fmt;
use std::time::Duration;
use strum::IntoStaticStr;
use tokio::time::Instant;

/// Lifetime given to internally generated messages, which never expire
const INTERNAL_MESSAGE_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Notification raised by the VM towards the consensus engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmNotification {
    /// The VM has transactions ready to be issued
    PendingTxs,
    /// The VM finished syncing to a state summary
    StateSyncDone,
}

/// Protocol operation and its payload
#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Op {
    // State sync
    GetStateSummaryFrontier { request_id: u32 },
    StateSummaryFrontier { request_id: u32, summary: Vec<u8> },
    GetStateSummaryFrontierFailed { request_id: u32 },
    GetAcceptedStateSummary { request_id: u32, heights: Vec<u64> },
    AcceptedStateSummary { request_id: u32, summary_ids: Vec<Vec<u8>> },
    GetAcceptedStateSummaryFailed { request_id: u32 },

    // Bootstrapping
    GetAcceptedFrontier { request_id: u32 },
    AcceptedFrontier { request_id: u32, container_ids: Vec<Vec<u8>> },
    GetAcceptedFrontierFailed { request_id: u32 },
    GetAccepted { request_id: u32, container_ids: Vec<Vec<u8>> },
    Accepted { request_id: u32, container_ids: Vec<Vec<u8>> },
    GetAcceptedFailed { request_id: u32 },
    GetAncestors { request_id: u32, container_id: Vec<u8> },
    GetAncestorsFailed { request_id: u32 },
    Ancestors { request_id: u32, containers: Vec<Vec<u8>> },

    // Consensus
    Get { request_id: u32, container_id: Vec<u8> },
    GetFailed { request_id: u32 },
    Put { request_id: u32, container: Vec<u8> },
    PushQuery { request_id: u32, container: Vec<u8> },
    PullQuery { request_id: u32, container_id: Vec<u8> },
    Chits {
        request_id: u32,
        preferred_container_ids: Vec<Vec<u8>>,
        accepted_container_ids: Vec<Vec<u8>>,
    },
    QueryFailed { request_id: u32 },

    // Connectivity
    Connected { node_version: Version },
    ConnectedSubnet { subnet_id: SubnetId },
    Disconnected,

    // Application level
    AppRequest { request_id: u32, app_bytes: Vec<u8> },
    AppRequestFailed { request_id: u32 },
    AppResponse { request_id: u32, app_bytes: Vec<u8> },
    AppGossip { app_bytes: Vec<u8> },
    CrossChainAppRequest { source_chain_id: ChainId, request_id: u32, message: Vec<u8> },
    CrossChainAppRequestFailed { source_chain_id: ChainId, request_id: u32 },
    CrossChainAppResponse { source_chain_id: ChainId, request_id: u32, message: Vec<u8> },

    // Internal
    Notify(VmNotification),
    GossipRequest,
    Timeout,
}

impl Op {
    /// Stable snake_case name used in logs and metric labels
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Application messages that are handled off the consensus lock
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            Op::AppRequest { .. }
                | Op::AppRequestFailed { .. }
                | Op::AppResponse { .. }
                | Op::AppGossip { .. }
                | Op::CrossChainAppRequest { .. }
                | Op::CrossChainAppRequestFailed { .. }
                | Op::CrossChainAppResponse { .. }
        )
    }

    /// Connectivity changes bypass CPU fairness in the message queue
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Op::Connected { .. } | Op::ConnectedSubnet { .. } | Op::Disconnected
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type OnFinished = Box<dyn FnOnce() + Send + Sync + 'static>;

/// A message waiting to be handled by the chain.
///
/// The completion callback runs exactly once: either through
/// [`Message::on_finished_handling`] or, if the message is dropped unhandled,
/// from `Drop`.
pub struct Message {
    node_id: NodeId,
    op: Op,
    expiration: Instant,
    received: Instant,
    engine_type: EngineType,
    on_finished: Option<OnFinished>,
}

impl Message {
    /// Create a message from `node_id` that must be handled before `expiration`
    pub fn new(node_id: NodeId, op: Op, expiration: Instant) -> Self {
        Self {
            node_id,
            op,
            expiration,
            received: Instant::now(),
            engine_type: EngineType::Unspecified,
            on_finished: None,
        }
    }

    /// Create a message generated by this node for the chan dispatcher
    pub fn internal(node_id: NodeId, op: Op) -> Self {
        Self::new(node_id, op, Instant::now() + INTERNAL_MESSAGE_TTL)
    }

    /// Engine type the sender asked to handle this message
    pub fn with_engine_type(mut self, engine_type: EngineType) -> Self {
        self.engine_type = engine_type;
        self
    }

    /// Callback to run once the message is done with
    pub fn with_on_finished<F>(mut self, on_finished: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.on_finished = Some(Box::new(on_finished));
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    /// When the message was created
    pub fn received(&self) -> Instant {
        self.received
    }

    pub fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expiration
    }

    /// Run the completion callback
    pub fn on_finished_handling(mut self) {
        if let Some(on_finished) = self.on_finished.take() {
            on_finished();
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(on_finished) = self.on_finished.take() {
            on_finished();
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("node_id", &self.node_id)
            .field("op", &self.op)
            .field("engine_type", &self.engine_type)
            .field("expiration", &self.expiration)
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.op, self.node_id)
    }
}
