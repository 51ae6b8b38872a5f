//! Validator membership and subnet policy consumed by the handler

use crate::error::ChainResult;
use crate::ids::{NodeId, SubnetId};
use async_trait::async_trait;
use tokio::sync::watch;

/// Stake-weighted validator set of the chain's subnet
pub trait ValidatorSet: Send + Sync {
    fn contains(&self, node_id: NodeId) -> bool;

    /// Stake of `node_id`, zero for non-validators
    fn weight(&self, node_id: NodeId) -> u64;

    fn total_weight(&self) -> u64;
}

/// Subnet-level policy for a chain
pub trait Subnet: Send + Sync {
    /// Whether `node_id` may send messages to chains of this subnet
    fn is_allowed(&self, node_id: NodeId, is_validator: bool) -> bool;

    /// Flips to `true` once every chain of the subnet finished bootstrapping.
    /// Pending timeouts fire immediately from then on.
    fn on_bootstrap_completed(&self) -> watch::Receiver<bool>;
}

/// Receives subnet connectivity notifications that bypass the engine
#[async_trait]
pub trait SubnetConnector: Send + Sync {
    async fn connected_subnet(&self, node_id: NodeId, subnet_id: SubnetId) -> ChainResult<()>;
}
