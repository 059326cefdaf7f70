//! Definition of bus messages

use crate::commands::block_requests::{
    BlockRequestsCommand, BlockRequestsEvent, BlockRequestsResponse,
};
use crate::peers::{PeerNetworkRequest, PeerNetworkResponse};
use crate::validation::{ValidationRequest, ValidationStatus};

/// Header accepted by the header-sync layer
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeaderMessage {
    /// Raw 80-byte header
    pub raw: Vec<u8>,
}

/// Global message enum
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Header sync
    Header(HeaderMessage), // Header accepted upstream

    // Block requests control surface
    BlockRequests(BlockRequestsCommand),
    BlockRequestsResponse(BlockRequestsResponse),
    BlockRequestsEvent(BlockRequestsEvent),

    // Peer layer
    PeerNetwork(PeerNetworkRequest),
    PeerNetworkResponse(PeerNetworkResponse),

    // Consensus rules
    Validation(ValidationRequest),
    ValidationResponse(ValidationStatus),
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<HeaderMessage> for Message {
    fn from(msg: HeaderMessage) -> Self {
        Message::Header(msg)
    }
}

impl From<BlockRequestsCommand> for Message {
    fn from(msg: BlockRequestsCommand) -> Self {
        Message::BlockRequests(msg)
    }
}

impl From<BlockRequestsResponse> for Message {
    fn from(msg: BlockRequestsResponse) -> Self {
        Message::BlockRequestsResponse(msg)
    }
}

impl From<BlockRequestsEvent> for Message {
    fn from(msg: BlockRequestsEvent) -> Self {
        Message::BlockRequestsEvent(msg)
    }
}
