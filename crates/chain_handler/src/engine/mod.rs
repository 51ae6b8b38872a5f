//! Consensus engine capability
//!
//! The handler never looks inside an engine. It resolves which engine is
//! current through the [`EngineManager`] and calls the method matching the
//! message's operation. Message handlers default to accepting and ignoring
//! the message so engines only implement what their phase understands.

pub mod manager;

pub use manager::{EngineManager, Engines};

use crate::error::ChainResult;
use crate::ids::{ChainId, Id, NodeId, Version};
use crate::message::VmNotification;
use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

/// A consensus engine: state syncer, bootstrapper or normal-operation engine
#[async_trait]
pub trait Engine: Send + Sync {
    // === Lifecycle ===

    /// Start the engine. `start_request_id` seeds its request ids.
    async fn start(&self, start_request_id: u32) -> ChainResult<()>;

    /// Abort long running work as soon as possible. Called without the
    /// consensus lock while the chain is stopping.
    fn halt(&self);

    /// Release resources. Called once, after all dispatchers exited.
    async fn shutdown(&self) -> ChainResult<()>;

    async fn health_check(&self) -> ChainResult<Value>;

    // === State sync ===

    async fn get_state_summary_frontier(&self, _node_id: NodeId, _request_id: u32) -> ChainResult<()> {
        Ok(())
    }

    async fn state_summary_frontier(
        &self,
        _node_id: NodeId,
        _request_id: u32,
        _summary: &[u8],
    ) -> ChainResult<()> {
        Ok(())
    }

    async fn get_state_summary_frontier_failed(&self, _node_id: NodeId, _request_id: u32) -> ChainResult<()> {
        Ok(())
    }

    async fn get_accepted_state_summary(
        &self,
        _node_id: NodeId,
        _request_id: u32,
        _heights: &[u64],
    ) -> ChainResult<()> {
        Ok(())
    }

    async fn accepted_state_summary(
        &self,
        _node_id: NodeId,
        _request_id: u32,
        _summary_ids: Vec<Id>,
    ) -> ChainResult<()> {
        Ok(())
    }

    async fn get_accepted_state_summary_failed(&self, _node_id: NodeId, _request_id: u32) -> ChainResult<()> {
        Ok(())
    }

    // === Bootstrapping ===

    async fn get_accepted_frontier(&self, _node_id: NodeId, _request_id: u32) -> ChainResult<()> {
        Ok(())
    }

    async fn accepted_frontier(
        &self,
        _node_id: NodeId,
        _request_id: u32,
        _container_ids: Vec<Id>,
    ) -> ChainResult<()> {
        Ok(())
    }

    async fn get_accepted_frontier_failed(&self, _node_id: NodeId, _request_id: u32) -> ChainResult<()> {
        Ok(())
    }

    async fn get_accepted(
        &self,
        _node_id: NodeId,
        _request_id: u32,
        _container_ids: Vec<Id>,
    ) -> ChainResult<()> {
        Ok(())
    }

    async fn accepted(
        &self,
        _node_id: NodeId,
        _request_id: u32,
        _container_ids: Vec<Id>,
    ) -> ChainResult<()> {
        Ok(())
    }

    async fn get_accepted_failed(&self, _node_id: NodeId, _request_id: u32) -> ChainResult<()> {
        Ok(())
    }

    async fn get_ancestors(&self, _node_id: NodeId, _request_id: u32, _container_id: Id) -> ChainResult<()> {
        Ok(())
    }

    async fn get_ancestors_failed(&self, _node_id: NodeId, _request_id: u32) -> ChainResult<()> {
        Ok(())
    }

    async fn ancestors(
        &self,
        _node_id: NodeId,
        _request_id: u32,
        _containers: &[Vec<u8>],
    ) -> ChainResult<()> {
        Ok(())
    }

    // === Consensus ===

    async fn get(&self, _node_id: NodeId, _request_id: u32, _container_id: Id) -> ChainResult<()> {
        Ok(())
    }

    async fn get_failed(&self, _node_id: NodeId, _request_id: u32) -> ChainResult<()> {
        Ok(())
    }

    async fn put(&self, _node_id: NodeId, _request_id: u32, _container: &[u8]) -> ChainResult<()> {
        Ok(())
    }

    async fn push_query(&self, _node_id: NodeId, _request_id: u32, _container: &[u8]) -> ChainResult<()> {
        Ok(())
    }

    async fn pull_query(&self, _node_id: NodeId, _request_id: u32, _container_id: Id) -> ChainResult<()> {
        Ok(())
    }

    async fn chits(
        &self,
        _node_id: NodeId,
        _request_id: u32,
        _preferred: Vec<Id>,
        _accepted: Vec<Id>,
    ) -> ChainResult<()> {
        Ok(())
    }

    async fn query_failed(&self, _node_id: NodeId, _request_id: u32) -> ChainResult<()> {
        Ok(())
    }

    // === Application level ===

    async fn app_request(
        &self,
        _node_id: NodeId,
        _request_id: u32,
        _deadline: Instant,
        _app_bytes: &[u8],
    ) -> ChainResult<()> {
        Ok(())
    }

    async fn app_response(&self, _node_id: NodeId, _request_id: u32, _app_bytes: &[u8]) -> ChainResult<()> {
        Ok(())
    }

    async fn app_request_failed(&self, _node_id: NodeId, _request_id: u32) -> ChainResult<()> {
        Ok(())
    }

    async fn app_gossip(&self, _node_id: NodeId, _app_bytes: &[u8]) -> ChainResult<()> {
        Ok(())
    }

    async fn cross_chain_app_request(
        &self,
        _chain_id: ChainId,
        _request_id: u32,
        _deadline: Instant,
        _message: &[u8],
    ) -> ChainResult<()> {
        Ok(())
    }

    async fn cross_chain_app_response(
        &self,
        _chain_id: ChainId,
        _request_id: u32,
        _message: &[u8],
    ) -> ChainResult<()> {
        Ok(())
    }

    async fn cross_chain_app_request_failed(&self, _chain_id: ChainId, _request_id: u32) -> ChainResult<()> {
        Ok(())
    }

    // === Connectivity ===

    async fn connected(&self, _node_id: NodeId, _version: &Version) -> ChainResult<()> {
        Ok(())
    }

    async fn disconnected(&self, _node_id: NodeId) -> ChainResult<()> {
        Ok(())
    }

    // === Internal ===

    /// Periodic gossip of this node's preferences
    async fn gossip(&self) -> ChainResult<()> {
        Ok(())
    }

    /// A registered timeout elapsed
    async fn timeout(&self) -> ChainResult<()> {
        Ok(())
    }

    /// Notification from the VM
    async fn notify(&self, _notification: VmNotification) -> ChainResult<()> {
        Ok(())
    }
}

/// Engine fetching the chain from peers before normal operation
#[async_trait]
pub trait Bootstrapper: Engine {
    /// Drop progress persisted by a previous run
    async fn clear(&self) -> ChainResult<()>;
}

/// Engine syncing VM state to a recent summary before bootstrapping
#[async_trait]
pub trait StateSyncer: Engine {
    /// Whether the VM supports and wants state sync
    async fn is_enabled(&self) -> ChainResult<bool>;
}
