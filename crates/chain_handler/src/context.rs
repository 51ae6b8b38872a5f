//! Per-chain consensus context shared between the handler and its engines

use crate::ids::{ChainId, NodeId, SubnetId};
use parking_lot::RwLock;
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Consensus engine family running a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EngineType {
    /// No preference expressed
    #[default]
    Unspecified,
    /// DAG-based engine
    Avalanche,
    /// Linear chain engine
    Snowman,
}

impl EngineType {
    /// Map a wire value to an engine type. Unknown values are treated as
    /// [`EngineType::Unspecified`].
    pub fn from_wire(value: i32) -> Self {
        match value {
            1 => EngineType::Avalanche,
            2 => EngineType::Snowman,
            _ => EngineType::Unspecified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Unspecified => "unspecified",
            EngineType::Avalanche => "avalanche",
            EngineType::Snowman => "snowman",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    StateSyncing,
    Bootstrapping,
    NormalOp,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::StateSyncing => "state_syncing",
            State::Bootstrapping => "bootstrapping",
            State::NormalOp => "normal_op",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the engine type and lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    pub engine_type: EngineType,
    pub state: State,
}

impl EngineState {
    pub fn new(engine_type: EngineType, state: State) -> Self {
        Self { engine_type, state }
    }
}

/// Context shared by the handler and every engine of one chain.
///
/// `lock` is the consensus lock: it must be held while any engine method
/// that mutates consensus or VM state runs. It is not reentrant.
pub struct ConsensusContext {
    /// This node's identifier
    pub node_id: NodeId,
    /// Chain being validated
    pub chain_id: ChainId,
    /// Subnet validating the chain
    pub subnet_id: SubnetId,
    /// Consensus lock
    pub lock: Arc<Mutex<()>>,
    state: RwLock<EngineState>,
    registry: Registry,
}

impl ConsensusContext {
    /// Create a context starting in `initial`
    pub fn new(
        node_id: NodeId,
        chain_id: ChainId,
        subnet_id: SubnetId,
        initial: EngineState,
    ) -> Self {
        Self {
            node_id,
            chain_id,
            subnet_id,
            lock: Arc::new(Mutex::new(())),
            state: RwLock::new(initial),
            registry: Registry::new(),
        }
    }

    /// Current engine type and lifecycle phase
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Advance the lifecycle. Called by engines while holding [`Self::lock`].
    pub fn set_state(&self, state: EngineState) {
        *self.state.write() = state;
    }

    /// Registry the handler and its queues register metrics with
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl fmt::Debug for ConsensusContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusContext")
            .field("node_id", &self.node_id)
            .field("chain_id", &self.chain_id)
            .field("subnet_id", &self.subnet_id)
            .field("state", &self.state())
            .finish()
    }
}
