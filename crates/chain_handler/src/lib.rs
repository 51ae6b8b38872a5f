//! Chain message handler
//!
//! Routes inbound network messages and internal events of one chain to the
//! consensus engine currently driving it. Consensus messages are serialized
//! under the chain's consensus lock, application messages run on a bounded
//! worker pool, and a three-dispatcher shutdown protocol guarantees the
//! current engine is shut down exactly once.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handler;
pub mod ids;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod tracker;
pub mod validators;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::HandlerConfig;
pub use context::{ConsensusContext, EngineState, EngineType, State};
pub use engine::{Bootstrapper, Engine, EngineManager, Engines, StateSyncer};
pub use error::{ChainError, ChainResult};
pub use handler::Handler;
pub use ids::{ChainId, Id, NodeId, SubnetId, Version};
pub use message::{Message, Op, VmNotification};
pub use queue::MessageQueue;
pub use tracker::{CpuTracker, ResourceTracker};
pub use validators::{Subnet, SubnetConnector, ValidatorSet};
pub use worker::WorkerPool;
