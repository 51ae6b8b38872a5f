//! Chain handler error types

use crate::context::{EngineType, State};
use thiserror::Error;

/// Result type for chain handler operations
pub type ChainResult<T> = Result<T, ChainError>;

/// Errors surfaced by the chain handler and the engines it drives
#[derive(Debug, Error)]
pub enum ChainError {
    /// No engine is registered for the chain's recorded engine type
    #[error("failed to select starting gear")]
    NoStartingGear,

    /// `start` was called before an engine manager was installed
    #[error("engine manager has not been set")]
    EngineManagerNotSet,

    /// The engine manager can only be installed once
    #[error("engine manager has already been set")]
    EngineManagerAlreadySet,

    /// No engine is registered for the current lifecycle state
    #[error("missing engine {state} running {engine_type}")]
    MissingEngine { state: State, engine_type: EngineType },

    /// A peer-supplied identifier could not be decoded
    #[error("invalid {field}: {reason}")]
    InvalidId { field: &'static str, reason: String },

    /// Error reported by an engine while processing a message
    #[error("engine error: {reason}")]
    Engine { reason: String },

    /// An operation reached a dispatcher that cannot handle it
    #[error("attempt to submit unhandled {kind} message {op}")]
    UnexpectedOp { kind: &'static str, op: &'static str },

    /// Engine error annotated with the message that triggered it
    #[error("{source} while processing {kind} message: {op}")]
    Dispatch {
        kind: &'static str,
        op: &'static str,
        #[source]
        source: Box<ChainError>,
    },

    /// Metrics registration failed
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Invalid handler configuration
    #[error("invalid configuration: {parameter} - {reason}")]
    InvalidConfig { parameter: &'static str, reason: String },
}

impl ChainError {
    /// Shorthand used by engine implementations
    pub fn engine(reason: impl Into<String>) -> Self {
        ChainError::Engine {
            reason: reason.into(),
        }
    }

    /// Wrap an error with the dispatch context it escaped from
    pub(crate) fn dispatch(self, kind: &'static str, op: &'static str) -> Self {
        ChainError::Dispatch {
            kind,
            op,
            source: Box::new(self),
        }
    }

    /// Get error category for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            ChainError::NoStartingGear => "startup",
            ChainError::EngineManagerNotSet => "startup",
            ChainError::EngineManagerAlreadySet => "startup",
            ChainError::MissingEngine { .. } => "engine",
            ChainError::InvalidId { .. } => "protocol",
            ChainError::Engine { .. } => "engine",
            ChainError::UnexpectedOp { .. } => "dispatch",
            ChainError::Dispatch { source, .. } => source.category(),
            ChainError::Metrics(_) => "metrics",
            ChainError::InvalidConfig { .. } => "config",
        }
    }
}
