//! Contextual validation, gated on ancestry.
//!
//! A block is only checked once its parent is validated. A block whose
//! parent is not yet validated is parked against that parent and checked
//! when the parent passes; if the parent fails, everything parked on it
//! fails with it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use auxblocks_common::commands::block_requests::{FetchState, FailureReason, ValidationOutcome};
use auxblocks_common::{BlockHash, ConsensusRules, ValidationError, ValidationStatus};
use tracing::{debug, info, warn};

use crate::block_store::{BlockStore, HeaderRecord};
use crate::chain_tips::ChainTipIndex;
use crate::sync_error::BlockSyncError;
use crate::sync_observer::BlockSyncObserver;

/// Whether a block can be checked right now
enum Readiness {
    Ready(Arc<HeaderRecord>),
    Deferred(BlockHash),
    InvalidAncestor(BlockHash),
}

pub struct ValidationGate {
    store: Arc<BlockStore>,
    index: Arc<ChainTipIndex>,
    rules: Arc<dyn ConsensusRules>,
    observer: Arc<dyn BlockSyncObserver>,

    /// Parent hash -> children waiting for it
    deferred: Mutex<HashMap<BlockHash, Vec<BlockHash>>>,
}

impl ValidationGate {
    pub fn new(
        store: Arc<BlockStore>,
        index: Arc<ChainTipIndex>,
        rules: Arc<dyn ConsensusRules>,
        observer: Arc<dyn BlockSyncObserver>,
    ) -> Self {
        Self {
            store,
            index,
            rules,
            observer,
            deferred: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a stored block, then anything that was waiting on it.
    ///
    /// Fails with `NotAvailable` if the body is not stored and with
    /// `RulesUnavailable` if the rules could not be consulted; in both
    /// cases the block is left as it was.
    pub async fn validate(&self, hash: &BlockHash) -> Result<ValidationOutcome, BlockSyncError> {
        let outcome = self.validate_one(hash).await?;
        match &outcome {
            ValidationOutcome::Validated => self.release_children(*hash).await,
            ValidationOutcome::Rejected(_) => self.fail_descendants(*hash),
            _ => {}
        }
        Ok(outcome)
    }

    /// Blocks waiting on an unvalidated parent
    pub fn deferred_count(&self) -> usize {
        self.lock_deferred().values().map(Vec::len).sum()
    }

    async fn validate_one(&self, hash: &BlockHash) -> Result<ValidationOutcome, BlockSyncError> {
        let record = self.store.get(hash)?;
        match &record.state {
            FetchState::Validated => return Ok(ValidationOutcome::AlreadyValidated),
            FetchState::Failed(FailureReason::Invalid(error)) => {
                return Ok(ValidationOutcome::Rejected(error.clone()))
            }
            _ => {}
        }
        let Some(block) = record.body.clone() else {
            return Err(BlockSyncError::NotAvailable { hash: *hash });
        };
        // Only genesis has no parent, and genesis is stored validated
        let Some(parent_hash) = record.header.parent() else {
            return Ok(ValidationOutcome::AlreadyValidated);
        };

        let parent = match self.readiness(hash, parent_hash)? {
            Readiness::Ready(parent) => parent,
            Readiness::Deferred(waiting_on) => {
                debug!(%hash, %waiting_on, "Validation deferred until parent is validated");
                return Ok(ValidationOutcome::Deferred { waiting_on });
            }
            Readiness::InvalidAncestor(ancestor) => {
                let error = ValidationError::InvalidAncestor(ancestor);
                self.reject(hash, record.height(), error.clone())?;
                return Ok(ValidationOutcome::Rejected(error));
            }
        };

        let status = self
            .rules
            .check(&block, &parent.header)
            .await
            .map_err(|e| BlockSyncError::RulesUnavailable(format!("{e:#}")))?;

        match status {
            ValidationStatus::Go => {
                if self.store.mark_validated(hash)? {
                    info!(%hash, height = record.height(), "Block validated");
                    self.observer.block_validated(*hash, record.height());
                }
                if let Some(active) = self.index.record_changed(hash) {
                    self.observer.active_tip_changed(&active);
                }
                Ok(ValidationOutcome::Validated)
            }
            ValidationStatus::NoGo(error) => {
                self.reject(hash, record.height(), error.clone())?;
                Ok(ValidationOutcome::Rejected(error))
            }
        }
    }

    /// Decide under the deferral lock, so a parent finishing concurrently
    /// either sees this block parked or this block sees the parent done.
    fn readiness(
        &self,
        hash: &BlockHash,
        parent_hash: BlockHash,
    ) -> Result<Readiness, BlockSyncError> {
        let mut deferred = self.lock_deferred();
        if let Some(ancestor) = self.invalid_ancestor(parent_hash) {
            return Ok(Readiness::InvalidAncestor(ancestor));
        }
        if !self.store.is_validated(&parent_hash) {
            let waiting = deferred.entry(parent_hash).or_default();
            if !waiting.contains(hash) {
                waiting.push(*hash);
            }
            return Ok(Readiness::Deferred(parent_hash));
        }
        let parent = self
            .store
            .header(&parent_hash)
            .ok_or(BlockSyncError::NotFound { hash: parent_hash })?;
        Ok(Readiness::Ready(parent))
    }

    /// Nearest invalid block at or above `from`, stopping at the validated
    /// part of the chain
    fn invalid_ancestor(&self, from: BlockHash) -> Option<BlockHash> {
        let mut cursor = from;
        loop {
            if self.store.is_validated(&cursor) {
                return None;
            }
            if self.store.is_invalid(&cursor) {
                return Some(cursor);
            }
            cursor = self.store.header(&cursor)?.parent()?;
        }
    }

    fn reject(
        &self,
        hash: &BlockHash,
        height: u64,
        error: ValidationError,
    ) -> Result<(), BlockSyncError> {
        self.store.mark_failed(hash, error.clone())?;
        warn!(%hash, height, %error, "Block failed validation");
        self.observer.block_rejected(*hash, height, &error);
        if let Some(active) = self.index.record_changed(hash) {
            self.observer.active_tip_changed(&active);
        }
        Ok(())
    }

    async fn release_children(&self, parent: BlockHash) {
        let mut ready: VecDeque<BlockHash> = self.take_deferred(&parent).into();
        while let Some(child) = ready.pop_front() {
            match self.validate_one(&child).await {
                Ok(ValidationOutcome::Validated) => ready.extend(self.take_deferred(&child)),
                Ok(ValidationOutcome::Rejected(_)) => self.fail_descendants(child),
                Ok(_) => {}
                Err(e) => warn!(hash = %child, "Deferred validation could not run: {e}"),
            }
        }
    }

    fn fail_descendants(&self, root: BlockHash) {
        let mut pending = self.take_deferred(&root);
        while let Some(child) = pending.pop() {
            match self.store.get(&child) {
                Ok(record) if record.has_body() && !record.validated() && !record.invalid() => {
                    let error = ValidationError::InvalidAncestor(root);
                    if let Err(e) = self.reject(&child, record.height(), error) {
                        warn!(hash = %child, "Could not fail descendant: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(hash = %child, "Deferred block vanished: {e}"),
            }
            pending.extend(self.take_deferred(&child));
        }
    }

    fn take_deferred(&self, parent: &BlockHash) -> Vec<BlockHash> {
        self.lock_deferred().remove(parent).unwrap_or_default()
    }

    fn lock_deferred(&self) -> MutexGuard<'_, HashMap<BlockHash, Vec<BlockHash>>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
