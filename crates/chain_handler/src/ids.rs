//! Identifiers carried by chain messages

use crate::error::{ChainError, ChainResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a node identifier in bytes
pub const NODE_ID_LEN: usize = 20;

/// Length of a container/chain/subnet identifier in bytes
pub const ID_LEN: usize = 32;

/// Identifier of a peer node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

/// Identifier of a container, chain or subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Id(pub [u8; ID_LEN]);

/// Chains are addressed by a plain [`Id`]
pub type ChainId = Id;

/// Subnets are addressed by a plain [`Id`]
pub type SubnetId = Id;

impl NodeId {
    /// Build a node id whose last byte is `n`, handy for fixtures
    pub fn from_index(n: u8) -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[NODE_ID_LEN - 1] = n;
        NodeId(bytes)
    }
}

impl Id {
    /// Decode an id from raw peer-supplied bytes
    pub fn from_slice(field: &'static str, bytes: &[u8]) -> ChainResult<Self> {
        let arr: [u8; ID_LEN] = bytes.try_into().map_err(|_| ChainError::InvalidId {
            field,
            reason: format!("expected {} bytes, got {}", ID_LEN, bytes.len()),
        })?;
        Ok(Id(arr))
    }

    /// Decode every id in `raw`, failing on the first malformed entry
    pub fn from_slices(field: &'static str, raw: &[Vec<u8>]) -> ChainResult<Vec<Self>> {
        raw.iter().map(|bytes| Id::from_slice(field, bytes)).collect()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeID-{}", hex::encode(self.0))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Application version reported by a connecting peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}.{}", self.name, self.major, self.minor, self.patch)
    }
}
