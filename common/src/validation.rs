//! Validation results and the consensus-rules seam

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::block::{Block, BlockHeader};
use crate::hash::BlockHash;

/// Validation error
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Error)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationError {
    /// Consensus rules refused the block, with their reason code
    #[error("rejected by consensus rules: {0}")]
    Rejected(String),

    /// An ancestor failed validation
    #[error("descends from invalid block {0}")]
    InvalidAncestor(BlockHash),
}

/// Validation status
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ValidationStatus {
    /// All good
    Go,

    /// Error
    NoGo(ValidationError),
}

/// Contextual validation of a block against its validated parent.
///
/// An `Err` means the rules could not be evaluated at all (engine down,
/// transport failure); the block is left untouched so it can be retried.
#[async_trait]
pub trait ConsensusRules: Send + Sync {
    async fn check(&self, block: &Block, parent: &BlockHeader) -> Result<ValidationStatus>;
}

/// Request to a validator over the bus
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationRequest {
    /// Serialized block
    pub block: Vec<u8>,

    /// Header of the already validated parent
    pub parent: BlockHeader,
}
