//! Ordered, deduplicated body-fetch requests.
//!
//! At most one entry exists per hash. Entries are served oldest first; a
//! failed fetch goes to the back of the line so one stubborn block cannot
//! starve the rest. The outstanding count is pushed to a watch channel on
//! every change, which is what status polls and drain waits read.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use auxblocks_common::commands::block_requests::EnqueueSummary;
use auxblocks_common::{BlockHash, PeerId};
use tokio::sync::{watch, Notify};
use tracing::{debug, error};

use crate::block_store::BlockStore;
use crate::sync_error::BlockSyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEntry {
    pub hash: BlockHash,
    /// Validate as soon as the body is stored
    pub validate: bool,
    /// Position in the queue; lower is served first
    pub seq: u64,
    /// Failed fetches so far
    pub attempts: u32,
    pub last_peer: Option<PeerId>,
    pub in_flight: bool,
}

/// What happened to an entry after a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued { attempts: u32 },
    /// Retry limit reached; the block is marked failed
    Abandoned { attempts: u32 },
    /// No such entry
    Unknown,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<BlockHash, RequestEntry>,
    order: BTreeMap<u64, BlockHash>,
    next_seq: u64,
}

impl QueueState {
    fn push_back(&mut self, hash: BlockHash) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, hash);
        seq
    }
}

pub struct RequestQueue {
    store: Arc<BlockStore>,
    state: Mutex<QueueState>,
    wake: Notify,
    outstanding: watch::Sender<usize>,
    max_attempts: u32,
}

impl RequestQueue {
    pub fn new(store: Arc<BlockStore>, max_attempts: u32) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            store,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            outstanding,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Request bodies for `hashes`, in order.
    ///
    /// Fails with `UnknownHash`, changing nothing, if any hash has no
    /// accepted header. Hashes whose body is already stored are skipped;
    /// hashes already queued keep their entry with the validate flags
    /// OR-ed together.
    pub fn enqueue(
        &self,
        hashes: &[BlockHash],
        validate: bool,
    ) -> Result<EnqueueSummary, BlockSyncError> {
        let mut state = self.lock();
        if let Some(unknown) = hashes.iter().find(|hash| !self.store.contains(hash)) {
            return Err(BlockSyncError::UnknownHash { hash: *unknown });
        }

        let mut summary = EnqueueSummary::default();
        for hash in hashes {
            if let Some(entry) = state.entries.get_mut(hash) {
                entry.validate |= validate;
                summary.merged += 1;
                continue;
            }
            if self.store.has_body(hash) {
                summary.skipped += 1;
                continue;
            }

            self.store.mark_queued(hash)?;
            let seq = state.push_back(*hash);
            state.entries.insert(
                *hash,
                RequestEntry {
                    hash: *hash,
                    validate,
                    seq,
                    attempts: 0,
                    last_peer: None,
                    in_flight: false,
                },
            );
            summary.enqueued += 1;
        }

        self.publish(&state);
        if summary.enqueued > 0 {
            self.wake.notify_one();
        }
        debug!(?summary, validate, "Enqueued body requests");
        Ok(summary)
    }

    /// Take the oldest queued entry and mark it in flight
    pub fn dequeue_next(&self) -> Option<RequestEntry> {
        let mut guard = self.lock();
        let state = &mut *guard;
        while let Some((_, hash)) = state.order.pop_first() {
            let Some(entry) = state.entries.get_mut(&hash) else {
                continue;
            };
            entry.in_flight = true;
            if let Err(e) = self.store.mark_in_flight(&hash) {
                error!(%hash, "Queue and store disagree: {e}");
            }
            return Some(entry.clone());
        }
        None
    }

    /// Whether the live entry for `hash` asks for validation
    pub fn validate_requested(&self, hash: &BlockHash) -> bool {
        self.lock().entries.get(hash).is_some_and(|entry| entry.validate)
    }

    /// Remove the entry after its body was stored
    pub fn complete(&self, hash: &BlockHash) -> Option<RequestEntry> {
        let mut state = self.lock();
        let entry = state.entries.remove(hash)?;
        state.order.remove(&entry.seq);
        self.publish(&state);
        Some(entry)
    }

    /// Put a failed entry back at the end of the queue, or drop it and mark
    /// the block failed once the retry limit is reached.
    pub fn requeue_on_failure(&self, hash: &BlockHash, peer: Option<PeerId>) -> RequeueOutcome {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(entry) = state.entries.get_mut(hash) else {
            return RequeueOutcome::Unknown;
        };
        entry.attempts += 1;
        entry.last_peer = peer;
        let attempts = entry.attempts;

        if attempts >= self.max_attempts {
            state.entries.remove(hash);
            if let Err(e) = self.store.mark_fetch_abandoned(hash) {
                error!(%hash, "Could not mark abandoned fetch: {e}");
            }
            self.publish(state);
            return RequeueOutcome::Abandoned { attempts };
        }

        entry.in_flight = false;
        let seq = state.next_seq;
        state.next_seq += 1;
        entry.seq = seq;
        state.order.insert(seq, *hash);
        if let Err(e) = self.store.mark_queued(hash) {
            error!(%hash, "Could not requeue: {e}");
        }
        self.wake.notify_one();
        RequeueOutcome::Requeued { attempts }
    }

    /// Entries queued or in flight
    pub fn outstanding_count(&self) -> usize {
        *self.outstanding.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.outstanding.subscribe()
    }

    pub fn entry(&self, hash: &BlockHash) -> Option<RequestEntry> {
        self.lock().entries.get(hash).cloned()
    }

    /// Resolves once work may be available
    pub async fn wait_for_work(&self) {
        self.wake.notified().await
    }

    fn publish(&self, state: &QueueState) {
        self.outstanding.send_replace(state.entries.len());
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
