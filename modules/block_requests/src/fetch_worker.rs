//! Drains the request queue against the peer network.
//!
//! Up to `max_in_flight` bodies are fetched at once. Each fetch picks a
//! peer that advertises the block, rotating between candidates on retry.
//! A delivered body is checked against the requested hash, and its
//! transactions against the header's merkle root, before it is stored;
//! anything else counts as a failed attempt.

use std::sync::Arc;
use std::time::Duration;

use auxblocks_common::{Block, BlockHash, FetchError, PeerId, PeerNetwork};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::block_store::BlockStore;
use crate::chain_tips::ChainTipIndex;
use crate::request_queue::{RequestEntry, RequestQueue, RequeueOutcome};
use crate::sync_error::BlockSyncError;
use crate::sync_observer::BlockSyncObserver;
use crate::validation_gate::ValidationGate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    /// Concurrent body requests
    pub max_in_flight: usize,
    pub request_timeout: Duration,
    /// Pause before a failed request goes back on the queue
    pub retry_backoff: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            request_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Choose who to ask for a body. Candidates are taken in a stable order,
/// starting further along on each attempt, and the peer that just failed
/// is avoided when anyone else has the block.
pub fn select_peer(
    candidates: &[PeerId],
    attempts: u32,
    last_peer: Option<PeerId>,
) -> Option<PeerId> {
    let mut sorted = candidates.to_vec();
    sorted.sort();
    sorted.dedup();
    if sorted.is_empty() {
        return None;
    }

    let start = attempts as usize % sorted.len();
    let peer = sorted[start];
    if Some(peer) == last_peer && sorted.len() > 1 {
        return Some(sorted[(start + 1) % sorted.len()]);
    }
    Some(peer)
}

fn decode_body(hash: &BlockHash, raw: Vec<u8>) -> Result<Block, FetchError> {
    let block = Block::from_bytes(raw).map_err(|e| FetchError::Malformed(e.to_string()))?;
    if block.hash() != *hash {
        return Err(FetchError::HashMismatch {
            expected: *hash,
            received: block.hash(),
        });
    }
    Ok(block)
}

pub struct FetchWorker {
    queue: Arc<RequestQueue>,
    store: Arc<BlockStore>,
    index: Arc<ChainTipIndex>,
    gate: Arc<ValidationGate>,
    peers: Arc<dyn PeerNetwork>,
    observer: Arc<dyn BlockSyncObserver>,
    settings: FetchSettings,
}

impl FetchWorker {
    pub fn new(
        queue: Arc<RequestQueue>,
        store: Arc<BlockStore>,
        index: Arc<ChainTipIndex>,
        gate: Arc<ValidationGate>,
        peers: Arc<dyn PeerNetwork>,
        observer: Arc<dyn BlockSyncObserver>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            queue,
            store,
            index,
            gate,
            peers,
            observer,
            settings,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(Arc::new(self).run())
    }

    /// Serve the queue until the task is dropped
    pub async fn run(self: Arc<Self>) {
        let permits = Arc::new(Semaphore::new(self.settings.max_in_flight.max(1)));
        info!(
            max_in_flight = self.settings.max_in_flight,
            timeout = ?self.settings.request_timeout,
            "Fetch worker started"
        );

        loop {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                error!("Fetch permits closed");
                return;
            };
            let entry = loop {
                if let Some(entry) = self.queue.dequeue_next() {
                    break entry;
                }
                self.queue.wait_for_work().await;
            };

            let span = info_span!("block_fetch", hash = %entry.hash, attempt = entry.attempts + 1);
            let worker = self.clone();
            tokio::spawn(async move { worker.fetch(entry, permit).await }.instrument(span));
        }
    }

    async fn fetch(&self, entry: RequestEntry, permit: OwnedSemaphorePermit) {
        let hash = entry.hash;
        let candidates = self.peers.candidates(&hash).await;
        let Some(peer) = select_peer(&candidates, entry.attempts, entry.last_peer) else {
            drop(permit);
            debug!("No peer advertises this block");
            self.retry(hash, entry.last_peer).await;
            return;
        };

        let request_timeout = self.settings.request_timeout;
        let result = match timeout(request_timeout, self.peers.fetch_body(peer, &hash, request_timeout))
            .await
        {
            Ok(result) => result.and_then(|raw| decode_body(&hash, raw)),
            Err(_) => Err(FetchError::Timeout),
        };
        drop(permit);

        let block = match result {
            Ok(block) => block,
            Err(e) => {
                warn!(%peer, "Body fetch failed: {e}");
                self.retry(hash, Some(peer)).await;
                return;
            }
        };

        let height = match self.store_body(&hash, block) {
            Ok(height) => height,
            Err(e) => {
                error!("Could not store body: {e}");
                self.retry(hash, Some(peer)).await;
                return;
            }
        };
        debug!(%peer, height, "Body stored");

        // The flag is read now, not at dequeue time, so an escalation that
        // arrived while the fetch was in flight is honoured
        let mut validated = false;
        if self.queue.validate_requested(&hash) {
            self.run_validation(&hash).await;
            validated = true;
        }
        if let Some(entry) = self.queue.complete(&hash) {
            if entry.validate && !validated {
                self.run_validation(&hash).await;
            }
        }
    }

    fn store_body(&self, hash: &BlockHash, block: Block) -> Result<u64, BlockSyncError> {
        match self.store.put_body(hash, block) {
            Ok(()) => {
                let height = self.store.header(hash).map(|h| h.height).unwrap_or_default();
                self.observer.body_stored(*hash, height);
                if let Some(active) = self.index.record_changed(hash) {
                    self.observer.active_tip_changed(&active);
                }
                Ok(height)
            }
            Err(BlockSyncError::AlreadyPresent { .. }) => {
                Ok(self.store.header(hash).map(|h| h.height).unwrap_or_default())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_validation(&self, hash: &BlockHash) {
        match self.gate.validate(hash).await {
            Ok(outcome) => debug!(?outcome, "Validation finished"),
            Err(e) => warn!("Validation could not run: {e}"),
        }
    }

    async fn retry(&self, hash: BlockHash, peer: Option<PeerId>) {
        tokio::time::sleep(self.settings.retry_backoff).await;
        match self.queue.requeue_on_failure(&hash, peer) {
            RequeueOutcome::Requeued { attempts } => debug!(attempts, "Request requeued"),
            RequeueOutcome::Abandoned { attempts } => {
                warn!(attempts, "Giving up on block body");
                self.observer.fetch_abandoned(hash, attempts);
            }
            RequeueOutcome::Unknown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auxblocks_test_utils::{coinbase_tx, ChainBuilder};

    #[test]
    fn no_candidates_no_peer() {
        assert_eq!(select_peer(&[], 0, None), None);
    }

    #[test]
    fn rotates_through_candidates() {
        let peers = [PeerId(3), PeerId(1), PeerId(2)];
        let picks: Vec<_> = (0..4).map(|attempt| select_peer(&peers, attempt, None)).collect();
        assert_eq!(
            picks,
            vec![Some(PeerId(1)), Some(PeerId(2)), Some(PeerId(3)), Some(PeerId(1))]
        );
    }

    #[test]
    fn avoids_the_peer_that_just_failed() {
        let peers = [PeerId(1), PeerId(2)];
        assert_eq!(select_peer(&peers, 2, Some(PeerId(1))), Some(PeerId(2)));
        // Nobody else to ask
        assert_eq!(select_peer(&[PeerId(1)], 1, Some(PeerId(1))), Some(PeerId(1)));
    }

    #[test]
    fn delivered_body_must_match_the_request() {
        let chain = ChainBuilder::regtest().extend(2, 0);
        let [first, second] = chain.blocks() else {
            panic!("two blocks expected");
        };

        let block = decode_body(&first.hash(), first.as_bytes().to_vec()).unwrap();
        assert_eq!(block.hash(), first.hash());

        assert_eq!(
            decode_body(&first.hash(), second.as_bytes().to_vec()).unwrap_err(),
            FetchError::HashMismatch {
                expected: first.hash(),
                received: second.hash()
            }
        );
        assert!(matches!(
            decode_body(&first.hash(), vec![1, 2, 3]),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn right_header_over_other_transactions_is_malformed() {
        let chain = ChainBuilder::regtest().extend(1, 0);
        let block = &chain.blocks()[0];
        let header = block.header().to_bytes();

        let mut junk = header.to_vec();
        junk.extend_from_slice(&[0x01, 0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(decode_body(&block.hash(), junk), Err(FetchError::Malformed(_))));

        let mut swapped = header.to_vec();
        swapped.push(1);
        swapped.extend_from_slice(&coinbase_tx(b"pays someone else"));
        assert!(matches!(decode_body(&block.hash(), swapped), Err(FetchError::Malformed(_))));
    }
}
