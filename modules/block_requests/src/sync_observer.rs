//! Lifecycle notifications out of the sync core.

use auxblocks_common::commands::block_requests::{BlockRequestsEvent, ChainTipInfo};
use auxblocks_common::{BlockHash, ValidationError};
use tokio::sync::mpsc;
use tracing::debug;

/// Told about every block lifecycle change. Called from the fetch tasks
/// and the validation gate, so implementations must not block.
pub trait BlockSyncObserver: Send + Sync {
    fn body_stored(&self, _hash: BlockHash, _height: u64) {}
    fn block_validated(&self, _hash: BlockHash, _height: u64) {}
    fn block_rejected(&self, _hash: BlockHash, _height: u64, _error: &ValidationError) {}
    fn fetch_abandoned(&self, _hash: BlockHash, _attempts: u32) {}
    fn active_tip_changed(&self, _tip: &ChainTipInfo) {}
}

pub struct NoOpObserver;

impl BlockSyncObserver for NoOpObserver {}

/// Turns notifications into events on a channel, for a publisher task to
/// put on the bus
pub struct EventForwarder {
    sender: mpsc::UnboundedSender<BlockRequestsEvent>,
}

impl EventForwarder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BlockRequestsEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn forward(&self, event: BlockRequestsEvent) {
        if self.sender.send(event).is_err() {
            debug!("Event receiver gone, dropping event");
        }
    }
}

impl BlockSyncObserver for EventForwarder {
    fn body_stored(&self, hash: BlockHash, height: u64) {
        self.forward(BlockRequestsEvent::BodyStored { hash, height });
    }

    fn block_validated(&self, hash: BlockHash, height: u64) {
        self.forward(BlockRequestsEvent::BlockValidated { hash, height });
    }

    fn block_rejected(&self, hash: BlockHash, height: u64, error: &ValidationError) {
        self.forward(BlockRequestsEvent::BlockRejected {
            hash,
            height,
            error: error.clone(),
        });
    }

    fn fetch_abandoned(&self, hash: BlockHash, attempts: u32) {
        self.forward(BlockRequestsEvent::FetchAbandoned { hash, attempts });
    }

    fn active_tip_changed(&self, tip: &ChainTipInfo) {
        self.forward(BlockRequestsEvent::ActiveTipChanged {
            hash: tip.hash,
            height: tip.height,
        });
    }
}
