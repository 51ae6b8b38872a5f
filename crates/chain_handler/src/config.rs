//! Chain handler configuration

use crate::error::{ChainError, ChainResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a chain's message handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Interval between internal gossip requests
    pub gossip_frequency: Duration,

    /// Maximum number of application messages handled concurrently
    pub thread_pool_size: usize,

    /// Consensus messages taking longer than this during normal operation
    /// are reported
    pub processing_time_warn_limit: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            gossip_frequency: Duration::from_secs(10),
            thread_pool_size: 8,
            processing_time_warn_limit: Duration::from_secs(30),
        }
    }
}

impl HandlerConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> ChainResult<()> {
        if self.gossip_frequency.is_zero() {
            return Err(ChainError::InvalidConfig {
                parameter: "gossip_frequency",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.thread_pool_size == 0 {
            return Err(ChainError::InvalidConfig {
                parameter: "thread_pool_size",
                reason: "must be at least 1".to_string(),
            });
        }

        if u32::try_from(self.thread_pool_size).is_err() {
            return Err(ChainError::InvalidConfig {
                parameter: "thread_pool_size",
                reason: format!("must not exceed {}", u32::MAX),
            });
        }

        Ok(())
    }
}
