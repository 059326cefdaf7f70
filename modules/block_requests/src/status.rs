//! Read-only view used by the command surface and by tests.

use std::sync::Arc;

use auxblocks_common::commands::block_requests::{
    BlockData, BlockView, ChainTipInfo, HeaderData, HeaderView, RequestStatus,
};
use auxblocks_common::BlockHash;

use crate::block_store::{BlockRecord, BlockStore};
use crate::chain_tips::ChainTipIndex;
use crate::request_queue::RequestQueue;
use crate::sync_error::BlockSyncError;

#[derive(Clone)]
pub struct StatusFacade {
    store: Arc<BlockStore>,
    index: Arc<ChainTipIndex>,
    queue: Arc<RequestQueue>,
}

impl StatusFacade {
    pub fn new(store: Arc<BlockStore>, index: Arc<ChainTipIndex>, queue: Arc<RequestQueue>) -> Self {
        Self {
            store,
            index,
            queue,
        }
    }

    pub fn status(&self) -> RequestStatus {
        RequestStatus {
            request_present: self.queue.outstanding_count(),
        }
    }

    pub fn list_tips(&self) -> Vec<ChainTipInfo> {
        self.index.list_tips()
    }

    pub fn best_active(&self) -> ChainTipInfo {
        self.index.best_active()
    }

    pub fn has_body(&self, hash: &BlockHash) -> bool {
        self.store.has_body(hash)
    }

    pub fn is_validated(&self, hash: &BlockHash) -> bool {
        self.store.is_validated(hash)
    }

    /// Fails with `NotAvailable` while only the header is known.
    pub fn get_block(&self, hash: &BlockHash, verbose: bool) -> Result<BlockData, BlockSyncError> {
        let record = self.store.get(hash)?;
        let Some(body) = record.body.clone() else {
            return Err(BlockSyncError::NotAvailable { hash: *hash });
        };
        if !verbose {
            return Ok(BlockData::Raw {
                hex: hex::encode(body.as_bytes()),
                validated: record.validated(),
            });
        }
        Ok(BlockData::Verbose(BlockView {
            header: header_view(&record),
            size: body.size(),
            n_tx: body.tx_count(),
        }))
    }

    pub fn get_header(&self, hash: &BlockHash, verbose: bool) -> Result<HeaderData, BlockSyncError> {
        let record = self.store.get(hash)?;
        if !verbose {
            return Ok(HeaderData::Raw {
                hex: hex::encode(record.header.header.to_bytes()),
                validated: record.validated(),
            });
        }
        Ok(HeaderData::Verbose(header_view(&record)))
    }

    /// Resolves once nothing is queued or in flight
    pub async fn wait_for_drain(&self) {
        let mut outstanding = self.queue.subscribe();
        // The sender lives as long as the queue, which we hold
        let _ = outstanding.wait_for(|count| *count == 0).await;
    }
}

fn header_view(record: &BlockRecord) -> HeaderView {
    let header = &record.header.header;
    HeaderView {
        hash: record.hash(),
        height: record.height(),
        version: header.version,
        previous_block_hash: record.header.parent(),
        merkle_root: header.merkle_root,
        time: header.time,
        bits: format!("{:08x}", header.bits),
        nonce: header.nonce,
        chain_work: format!("{:064x}", record.header.chain_work),
        has_body: record.has_body(),
        validated: record.validated(),
        fetch_state: record.state.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryStore;
    use auxblocks_common::commands::block_requests::FetchState;
    use auxblocks_test_utils::ChainBuilder;

    fn facade(chain: &ChainBuilder) -> (Arc<BlockStore>, Arc<RequestQueue>, StatusFacade) {
        let store = Arc::new(
            BlockStore::open(Arc::new(MemoryStore::new()), chain.genesis().clone()).unwrap(),
        );
        let index = Arc::new(ChainTipIndex::new(store.clone()).unwrap());
        for block in chain.blocks() {
            index.accept_header(block.header().clone()).unwrap();
        }
        let queue = Arc::new(RequestQueue::new(store.clone(), 3));
        (store.clone(), queue.clone(), StatusFacade::new(store, index, queue))
    }

    #[test]
    fn header_only_blocks_are_not_available() {
        let chain = ChainBuilder::regtest().extend(1, 0);
        let (_, _, facade) = facade(&chain);
        let hash = chain.blocks()[0].hash();

        assert!(matches!(
            facade.get_block(&hash, true),
            Err(BlockSyncError::NotAvailable { .. })
        ));
        assert!(matches!(
            facade.get_block(&BlockHash::new([4; 32]), true),
            Err(BlockSyncError::NotFound { .. })
        ));

        let HeaderData::Verbose(view) = facade.get_header(&hash, true).unwrap() else {
            panic!("verbose header expected");
        };
        assert_eq!(view.height, 1);
        assert_eq!(view.previous_block_hash, Some(chain.genesis().hash()));
        assert!(!view.has_body);
        assert_eq!(view.fetch_state, FetchState::NotRequested);
        assert_eq!(view.bits, "207fffff");
        assert_eq!(view.chain_work, format!("{:064x}", 4));
    }

    #[test]
    fn stored_block_reports_validation() {
        let chain = ChainBuilder::regtest().extend(1, 0);
        let (store, _, facade) = facade(&chain);
        let block = chain.blocks()[0].clone();
        store.put_body(&block.hash(), block.clone()).unwrap();

        let data = facade.get_block(&block.hash(), false).unwrap();
        assert_eq!(
            data,
            BlockData::Raw {
                hex: hex::encode(block.as_bytes()),
                validated: false
            }
        );

        store.mark_validated(&block.hash()).unwrap();
        let BlockData::Verbose(view) = facade.get_block(&block.hash(), true).unwrap() else {
            panic!("verbose block expected");
        };
        assert!(view.header.validated);
        assert_eq!(view.n_tx, 1);
        assert_eq!(view.size, block.size());
    }

    #[tokio::test]
    async fn drain_wait_returns_when_queue_empties() {
        let chain = ChainBuilder::regtest().extend(2, 0);
        let (_, queue, facade) = facade(&chain);
        facade.wait_for_drain().await;

        queue.enqueue(&chain.hashes(), false).unwrap();
        assert_eq!(facade.status().request_present, 2);

        let waiter = tokio::spawn({
            let facade = facade.clone();
            async move { facade.wait_for_drain().await }
        });
        for hash in chain.hashes() {
            queue.dequeue_next().unwrap();
            queue.complete(&hash).unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(facade.status().request_present, 0);
    }
}
