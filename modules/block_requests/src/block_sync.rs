//! Wires the store, tip index, queue, gate and worker together and maps
//! control commands onto them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use auxblocks_common::commands::block_requests::{
    BlockRequestsCommand, BlockRequestsResponse, EnqueueSummary, RequestOptions, ValidationOutcome,
};
use auxblocks_common::{Block, BlockHash, BlockHeader, ConsensusRules, PeerNetwork};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::block_store::BlockStore;
use crate::chain_tips::{ChainTipIndex, HeaderAcceptance};
use crate::fetch_worker::{FetchSettings, FetchWorker};
use crate::request_queue::RequestQueue;
use crate::status::StatusFacade;
use crate::stores::Store;
use crate::sync_error::BlockSyncError;
use crate::sync_observer::BlockSyncObserver;
use crate::validation_gate::ValidationGate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Fetch, and validate, the body of every newly accepted header
    pub auto_request: bool,

    /// Fetch attempts per block before giving up
    pub max_attempts: u32,
    pub fetch: FetchSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_request: true,
            max_attempts: 5,
            fetch: FetchSettings::default(),
        }
    }
}

pub struct BlockSync {
    store: Arc<BlockStore>,
    index: Arc<ChainTipIndex>,
    queue: Arc<RequestQueue>,
    gate: Arc<ValidationGate>,
    status: StatusFacade,
    peers: Arc<dyn PeerNetwork>,
    observer: Arc<dyn BlockSyncObserver>,
    fetch: FetchSettings,
    auto_request: AtomicBool,
}

impl BlockSync {
    /// Open over `backend`, restoring any block records it holds. Pending
    /// requests from a previous run are not restored.
    pub fn open(
        settings: SyncSettings,
        genesis: Block,
        backend: Arc<dyn Store>,
        peers: Arc<dyn PeerNetwork>,
        rules: Arc<dyn ConsensusRules>,
        observer: Arc<dyn BlockSyncObserver>,
    ) -> Result<Self, BlockSyncError> {
        let store = Arc::new(BlockStore::open(backend, genesis)?);
        let index = Arc::new(ChainTipIndex::new(store.clone())?);
        let queue = Arc::new(RequestQueue::new(store.clone(), settings.max_attempts));
        let gate = Arc::new(ValidationGate::new(
            store.clone(),
            index.clone(),
            rules,
            observer.clone(),
        ));
        let status = StatusFacade::new(store.clone(), index.clone(), queue.clone());

        let active = index.best_active();
        info!(
            blocks = store.len(),
            active = %active.hash,
            height = active.height,
            auto_request = settings.auto_request,
            "Block sync opened"
        );

        Ok(Self {
            store,
            index,
            queue,
            gate,
            status,
            peers,
            observer,
            fetch: settings.fetch,
            auto_request: AtomicBool::new(settings.auto_request),
        })
    }

    /// Start draining the request queue
    pub fn start_fetching(&self) -> JoinHandle<()> {
        FetchWorker::new(
            self.queue.clone(),
            self.store.clone(),
            self.index.clone(),
            self.gate.clone(),
            self.peers.clone(),
            self.observer.clone(),
            self.fetch.clone(),
        )
        .spawn()
    }

    /// Accept a header from header sync. With auto-request on, its body is
    /// queued for fetch and validation.
    pub fn accept_header(&self, header: BlockHeader) -> Result<HeaderAcceptance, BlockSyncError> {
        let acceptance = self.index.accept_header(header)?;
        if let HeaderAcceptance::Accepted(record) = &acceptance {
            if self.auto_request() {
                if let Err(e) = self.queue.enqueue(&[record.hash], true) {
                    warn!(hash = %record.hash, "Could not auto-request body: {e}");
                }
            }
        }
        Ok(acceptance)
    }

    pub fn request_blocks(
        &self,
        hashes: &[BlockHash],
        options: &RequestOptions,
    ) -> Result<EnqueueSummary, BlockSyncError> {
        let summary = self.queue.enqueue(hashes, options.validate)?;
        info!(
            requested = hashes.len(),
            enqueued = summary.enqueued,
            validate = options.validate,
            "Block bodies requested"
        );
        Ok(summary)
    }

    pub async fn validate(&self, hash: &BlockHash) -> Result<ValidationOutcome, BlockSyncError> {
        self.gate.validate(hash).await
    }

    /// Turning auto-request on catches up on bodies missing between the
    /// active chain and the best header.
    pub fn set_auto_request(&self, enabled: bool) -> Result<EnqueueSummary, BlockSyncError> {
        let was = self.auto_request.swap(enabled, Ordering::SeqCst);
        if !enabled || was {
            return Ok(EnqueueSummary::default());
        }
        let missing = self.index.missing_bodies_on_best_chain();
        let summary = self.queue.enqueue(&missing, true)?;
        info!(enqueued = summary.enqueued, "Auto-request enabled");
        Ok(summary)
    }

    pub fn auto_request(&self) -> bool {
        self.auto_request.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> &StatusFacade {
        &self.status
    }

    /// Execute one control command
    pub async fn handle(&self, command: BlockRequestsCommand) -> BlockRequestsResponse {
        let result = match command {
            BlockRequestsCommand::Start { hashes, options } => {
                self.request_blocks(&hashes, &options).map(BlockRequestsResponse::Started)
            }
            BlockRequestsCommand::Status => Ok(BlockRequestsResponse::Status(self.status.status())),
            BlockRequestsCommand::GetBlock { hash, verbose } => {
                self.status.get_block(&hash, verbose).map(BlockRequestsResponse::Block)
            }
            BlockRequestsCommand::GetHeader { hash, verbose } => {
                self.status.get_header(&hash, verbose).map(BlockRequestsResponse::Header)
            }
            BlockRequestsCommand::ListTips => Ok(BlockRequestsResponse::Tips(self.status.list_tips())),
            BlockRequestsCommand::Validate { hash } => {
                self.validate(&hash).await.map(BlockRequestsResponse::Validation)
            }
            BlockRequestsCommand::SetAutoRequest { enabled } => self
                .set_auto_request(enabled)
                .map(|_| BlockRequestsResponse::AutoRequest { enabled }),
        };
        result.unwrap_or_else(|e| BlockRequestsResponse::Error(e.into()))
    }
}
