//! Error types for block synchronization operations.

use auxblocks_common::commands::block_requests::{BlockRequestsError, FetchState};
use auxblocks_common::BlockHash;

/// Errors returned by the chain-tip index, block store, request queue and
/// validation gate.
#[derive(Debug, thiserror::Error)]
pub enum BlockSyncError {
    /// The header's parent is not in the index.
    #[error("orphan header {hash}: parent {parent} unknown")]
    OrphanHeader { hash: BlockHash, parent: BlockHash },

    /// The header failed header-level checks.
    #[error("invalid header {hash}: {reason}")]
    InvalidHeader { hash: BlockHash, reason: String },

    /// A request named a hash with no accepted header.
    #[error("no header known for block {hash}")]
    UnknownHash { hash: BlockHash },

    #[error("block {hash} not found")]
    NotFound { hash: BlockHash },

    /// A body arrived for a block whose header was never accepted.
    #[error("no header record for body {hash}")]
    UnknownHeader { hash: BlockHash },

    /// Benign: the body was stored by an earlier fetch.
    #[error("body for block {hash} already present")]
    AlreadyPresent { hash: BlockHash },

    #[error("body does not match block {expected}, it hashes to {received}")]
    BodyMismatch {
        expected: BlockHash,
        received: BlockHash,
    },

    /// No body stored for the block.
    #[error("block {hash} not available")]
    NotAvailable { hash: BlockHash },

    #[error("block {hash} cannot be marked {action} while {from:?}")]
    IllegalTransition {
        hash: BlockHash,
        from: FetchState,
        action: &'static str,
    },

    /// The consensus rules engine could not be reached.
    #[error("consensus rules unavailable: {0}")]
    RulesUnavailable(String),

    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<BlockSyncError> for BlockRequestsError {
    fn from(error: BlockSyncError) -> Self {
        match error {
            BlockSyncError::UnknownHash { hash } => BlockRequestsError::UnknownHash { hash },
            BlockSyncError::NotFound { hash } | BlockSyncError::UnknownHeader { hash } => {
                BlockRequestsError::NotFound { hash }
            }
            BlockSyncError::NotAvailable { hash } => BlockRequestsError::NotAvailable { hash },
            error @ (BlockSyncError::RulesUnavailable(_) | BlockSyncError::Storage(_)) => {
                BlockRequestsError::Internal {
                    message: error.to_string(),
                }
            }
            error => BlockRequestsError::InvalidRequest {
                message: error.to_string(),
            },
        }
    }
}
