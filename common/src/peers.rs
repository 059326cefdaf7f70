//! Peer identities and the block-body transport seam

use std::{fmt, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::hash::BlockHash;

/// Opaque identifier of a connected peer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Reasons a body fetch did not produce the requested block
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum FetchError {
    /// No connected peer announced the block
    #[error("no peer has the block")]
    PeerUnavailable,

    #[error("request timed out")]
    Timeout,

    #[error("{0} disconnected")]
    Disconnected(PeerId),

    /// Response could not be decoded as a block
    #[error("malformed block: {0}")]
    Malformed(String),

    /// Response decoded to a different block
    #[error("expected block {expected}, received {received}")]
    HashMismatch {
        expected: BlockHash,
        received: BlockHash,
    },
}

/// Lower transport layer: who has a block, and fetching it from them
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Peers that advertised the block. May be empty.
    async fn candidates(&self, hash: &BlockHash) -> Vec<PeerId>;

    /// Fetch the serialized block from one peer, giving up after `timeout`
    async fn fetch_body(
        &self,
        peer: PeerId,
        hash: &BlockHash,
        timeout: Duration,
    ) -> Result<Vec<u8>, FetchError>;
}

/// Requests to the peer layer over the bus
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum PeerNetworkRequest {
    Candidates {
        hash: BlockHash,
    },
    FetchBody {
        peer: PeerId,
        hash: BlockHash,
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum PeerNetworkResponse {
    Candidates(Vec<PeerId>),
    Body(Vec<u8>),
    Failed(FetchError),
}
