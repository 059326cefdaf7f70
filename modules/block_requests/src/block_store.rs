//! Per-block records: header, body once fetched, and where the block
//! stands between header acceptance and validation.
//!
//! Records are created when a header is accepted and never removed. The
//! body is attached once; a validated block never loses that status.

use std::sync::Arc;

use anyhow::anyhow;
use auxblocks_common::commands::block_requests::{FailureReason, FetchState};
use auxblocks_common::{Block, BlockHash, BlockHeader, ValidationError};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::stores::Store;
use crate::sync_error::BlockSyncError;

/// Immutable header facts, shared between the store and the tip index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub hash: BlockHash,
    pub height: u64,
    /// Cumulative work from genesis up to and including this block
    pub chain_work: u128,
    pub header: BlockHeader,
}

impl HeaderRecord {
    /// Parent hash, or `None` for the genesis block.
    pub fn parent(&self) -> Option<BlockHash> {
        (self.height > 0).then_some(self.header.prev_hash)
    }
}

#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub header: Arc<HeaderRecord>,
    pub body: Option<Arc<Block>>,
    pub state: FetchState,
}

impl BlockRecord {
    pub fn hash(&self) -> BlockHash {
        self.header.hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn validated(&self) -> bool {
        self.state == FetchState::Validated
    }

    /// Failed validation itself or through an ancestor
    pub fn invalid(&self) -> bool {
        matches!(self.state, FetchState::Failed(FailureReason::Invalid(_)))
    }
}

pub struct BlockStore {
    records: DashMap<BlockHash, BlockRecord>,
    backend: Arc<dyn Store>,
}

impl BlockStore {
    /// Open over a persistence backend, replaying whatever it holds.
    ///
    /// An empty backend is seeded with `genesis`, stored and validated. A
    /// populated one must have been seeded with the same genesis.
    pub fn open(backend: Arc<dyn Store>, genesis: Block) -> Result<Self, BlockSyncError> {
        let records = DashMap::new();
        let persisted = backend.load()?;

        if let Some(first) = persisted.first() {
            if first.header.height != 0 || first.header.hash != genesis.hash() {
                return Err(anyhow!(
                    "store was seeded with genesis {} at height {}, expected {}",
                    first.header.hash,
                    first.header.height,
                    genesis.hash()
                )
                .into());
            }
        }

        if persisted.is_empty() {
            let header = HeaderRecord {
                hash: genesis.hash(),
                height: 0,
                chain_work: genesis.header().work(),
                header: genesis.header().clone(),
            };
            backend.insert_header(&header)?;
            backend.insert_body(&header.hash, genesis.as_bytes())?;
            backend.set_validated(&header.hash)?;
            records.insert(
                header.hash,
                BlockRecord {
                    header: Arc::new(header),
                    body: Some(Arc::new(genesis)),
                    state: FetchState::Validated,
                },
            );
        } else {
            let count = persisted.len();
            for block in persisted {
                let body = match block.body {
                    Some(raw) => Some(Arc::new(
                        Block::from_bytes(raw).map_err(anyhow::Error::from)?,
                    )),
                    None => None,
                };
                let state = match (&body, block.validated) {
                    (Some(_), true) => FetchState::Validated,
                    (Some(_), false) => FetchState::Available,
                    (None, _) => FetchState::NotRequested,
                };
                records.insert(
                    block.header.hash,
                    BlockRecord {
                        header: Arc::new(block.header),
                        body,
                        state,
                    },
                );
            }
            info!(blocks = count, "Restored block records; pending requests are not kept");
        }

        Ok(Self { records, backend })
    }

    /// Insert the record for a newly accepted header, returning the stored
    /// header. An existing record is left untouched and returned.
    pub(crate) fn insert_header(
        &self,
        header: HeaderRecord,
    ) -> Result<Arc<HeaderRecord>, BlockSyncError> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(header.hash) {
            Entry::Occupied(existing) => Ok(existing.get().header.clone()),
            Entry::Vacant(vacant) => {
                self.backend.insert_header(&header)?;
                let header = Arc::new(header);
                vacant.insert(BlockRecord {
                    header: header.clone(),
                    body: None,
                    state: FetchState::NotRequested,
                });
                Ok(header)
            }
        }
    }

    pub fn get(&self, hash: &BlockHash) -> Result<BlockRecord, BlockSyncError> {
        self.records
            .get(hash)
            .map(|record| record.clone())
            .ok_or(BlockSyncError::NotFound { hash: *hash })
    }

    pub fn header(&self, hash: &BlockHash) -> Option<Arc<HeaderRecord>> {
        self.records.get(hash).map(|record| record.header.clone())
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.records.contains_key(hash)
    }

    pub fn has_body(&self, hash: &BlockHash) -> bool {
        self.records.get(hash).is_some_and(|record| record.has_body())
    }

    pub fn is_validated(&self, hash: &BlockHash) -> bool {
        self.records.get(hash).is_some_and(|record| record.validated())
    }

    pub fn is_invalid(&self, hash: &BlockHash) -> bool {
        self.records.get(hash).is_some_and(|record| record.invalid())
    }

    pub fn fetch_state(&self, hash: &BlockHash) -> Option<FetchState> {
        self.records.get(hash).map(|record| record.state.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All header records, parents before children.
    pub fn headers_by_height(&self) -> Vec<Arc<HeaderRecord>> {
        let mut headers: Vec<_> =
            self.records.iter().map(|record| record.header.clone()).collect();
        headers.sort_by_key(|header| (header.height, header.hash));
        headers
    }

    /// Attach a fetched body to a header-only record.
    pub fn put_body(&self, hash: &BlockHash, block: Block) -> Result<(), BlockSyncError> {
        if block.hash() != *hash {
            return Err(BlockSyncError::BodyMismatch {
                expected: *hash,
                received: block.hash(),
            });
        }
        let mut record =
            self.records.get_mut(hash).ok_or(BlockSyncError::UnknownHeader { hash: *hash })?;
        if record.body.is_some() {
            return Err(BlockSyncError::AlreadyPresent { hash: *hash });
        }

        self.backend.insert_body(hash, block.as_bytes())?;
        record.body = Some(Arc::new(block));
        record.state = FetchState::Available;
        debug!(%hash, height = record.height(), "Stored block body");
        Ok(())
    }

    /// Promote an available block to validated. Returns `false` when it
    /// already was.
    pub fn mark_validated(&self, hash: &BlockHash) -> Result<bool, BlockSyncError> {
        let mut record = self.record_mut(hash)?;
        match &record.state {
            FetchState::Validated => Ok(false),
            FetchState::Available => {
                self.backend.set_validated(hash)?;
                record.state = FetchState::Validated;
                Ok(true)
            }
            other => Err(illegal(hash, other, "validated")),
        }
    }

    /// Record a validation failure for an available block. Failures are
    /// sticky; a second failure keeps the first reason.
    pub fn mark_failed(&self, hash: &BlockHash, error: ValidationError) -> Result<(), BlockSyncError> {
        let mut record = self.record_mut(hash)?;
        match &record.state {
            FetchState::Available => {
                record.state = FetchState::Failed(FailureReason::Invalid(error));
                Ok(())
            }
            FetchState::Failed(FailureReason::Invalid(_)) => Ok(()),
            other => Err(illegal(hash, other, "invalid")),
        }
    }

    pub(crate) fn mark_queued(&self, hash: &BlockHash) -> Result<(), BlockSyncError> {
        let mut record = self.record_mut(hash)?;
        match &record.state {
            FetchState::NotRequested
            | FetchState::Queued
            | FetchState::InFlight
            | FetchState::Failed(FailureReason::FetchAbandoned) => {
                record.state = FetchState::Queued;
                Ok(())
            }
            other => Err(illegal(hash, other, "queued")),
        }
    }

    pub(crate) fn mark_in_flight(&self, hash: &BlockHash) -> Result<(), BlockSyncError> {
        let mut record = self.record_mut(hash)?;
        match &record.state {
            FetchState::Queued => {
                record.state = FetchState::InFlight;
                Ok(())
            }
            other => Err(illegal(hash, other, "in flight")),
        }
    }

    pub(crate) fn mark_fetch_abandoned(&self, hash: &BlockHash) -> Result<(), BlockSyncError> {
        let mut record = self.record_mut(hash)?;
        match &record.state {
            FetchState::Queued | FetchState::InFlight => {
                record.state = FetchState::Failed(FailureReason::FetchAbandoned);
                Ok(())
            }
            other => Err(illegal(hash, other, "abandoned")),
        }
    }

    fn record_mut(
        &self,
        hash: &BlockHash,
    ) -> Result<dashmap::mapref::one::RefMut<'_, BlockHash, BlockRecord>, BlockSyncError> {
        self.records.get_mut(hash).ok_or(BlockSyncError::NotFound { hash: *hash })
    }
}

fn illegal(hash: &BlockHash, from: &FetchState, action: &'static str) -> BlockSyncError {
    BlockSyncError::IllegalTransition {
        hash: *hash,
        from: from.clone(),
        action,
    }
}
