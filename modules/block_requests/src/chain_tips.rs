//! Header tree and chain-tip projection.
//!
//! Every accepted header is a node, whether or not its body has been
//! fetched. The active block is the most-worked block whose whole ancestry
//! is validated; ties keep the current active block.
//!
//! Each node caches the worst status on its path from genesis. Blocks on
//! the active chain are all validated, so that cached value is also the
//! tip status relative to whichever chain is active, and a record change
//! only touches the descendants whose cached value actually moves. Fork
//! points are found through skip pointers rather than by walking parents.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use auxblocks_common::commands::block_requests::{ChainTipInfo, FailureReason, FetchState, TipStatus};
use auxblocks_common::{BlockHash, BlockHeader};
use tracing::{debug, info};

use crate::block_store::{BlockStore, HeaderRecord};
use crate::sync_error::BlockSyncError;

/// Result of offering a header to the index
#[derive(Debug, Clone)]
pub enum HeaderAcceptance {
    Accepted(Arc<HeaderRecord>),
    AlreadyKnown(Arc<HeaderRecord>),
}

impl HeaderAcceptance {
    pub fn record(&self) -> &Arc<HeaderRecord> {
        match self {
            HeaderAcceptance::Accepted(record) | HeaderAcceptance::AlreadyKnown(record) => record,
        }
    }
}

struct TipNode {
    height: u64,
    chain_work: u128,
    parent: Option<BlockHash>,
    /// Ancestor at `skip_height(height)`
    skip: Option<BlockHash>,
    children: Vec<BlockHash>,
    /// Status of this block alone
    own: TipStatus,
    /// Worst `own` from genesis down to here
    path: TipStatus,
    /// This block and every ancestor are validated
    linked: bool,
}

struct TipTree {
    nodes: HashMap<BlockHash, TipNode>,
    leaves: HashSet<BlockHash>,
    active: BlockHash,
}

pub struct ChainTipIndex {
    store: Arc<BlockStore>,
    tree: RwLock<TipTree>,
}

fn own_status(store: &BlockStore, hash: &BlockHash) -> TipStatus {
    if store.is_invalid(hash) {
        TipStatus::Invalid
    } else if !store.has_body(hash) {
        TipStatus::HeadersOnly
    } else if !store.is_validated(hash) {
        TipStatus::ValidHeaders
    } else {
        TipStatus::ValidFork
    }
}

fn invert_lowest_one(n: u64) -> u64 {
    n & n.wrapping_sub(1)
}

/// Height a node's skip pointer targets. Any ancestor is reachable in a
/// logarithmic number of skip and parent steps.
fn skip_height(height: u64) -> u64 {
    if height < 2 {
        0
    } else if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

impl ChainTipIndex {
    /// Build the index from every header record in the store.
    pub fn new(store: Arc<BlockStore>) -> Result<Self, BlockSyncError> {
        let headers = store.headers_by_height();
        let Some(genesis) = headers.first().filter(|header| header.height == 0) else {
            return Err(anyhow::anyhow!("block store has no genesis record").into());
        };

        let mut tree = TipTree {
            nodes: HashMap::new(),
            leaves: HashSet::new(),
            active: genesis.hash,
        };
        let mut linked = Vec::new();
        for header in &headers {
            if tree.insert(header, own_status(&store, &header.hash)) {
                linked.push(header.hash);
            }
        }
        tree.promote(linked);
        debug!(headers = headers.len(), active = %tree.active, "Built chain tip index");

        Ok(Self {
            store,
            tree: RwLock::new(tree),
        })
    }

    /// Accept a header whose parent is known, creating its block record.
    ///
    /// Acceptance is linearized under the index write lock, so concurrent
    /// offers of the same header produce exactly one record.
    pub fn accept_header(&self, header: BlockHeader) -> Result<HeaderAcceptance, BlockSyncError> {
        let hash = header.hash();
        let mut tree = self.write();

        if tree.nodes.contains_key(&hash) {
            if let Some(record) = self.store.header(&hash) {
                return Ok(HeaderAcceptance::AlreadyKnown(record));
            }
        }

        let Some(parent) = tree.nodes.get(&header.prev_hash) else {
            return Err(BlockSyncError::OrphanHeader {
                hash,
                parent: header.prev_hash,
            });
        };
        let work = header.work();
        if work == 0 {
            return Err(BlockSyncError::InvalidHeader {
                hash,
                reason: format!("bits {:#010x} do not encode a usable target", header.bits),
            });
        }

        let record = HeaderRecord {
            hash,
            height: parent.height + 1,
            chain_work: parent.chain_work.saturating_add(work),
            header,
        };
        let record = self.store.insert_header(record)?;
        if tree.insert(&record, own_status(&self.store, &hash)) {
            tree.promote(vec![hash]);
        }

        Ok(HeaderAcceptance::Accepted(record))
    }

    /// Pick up a change to the record of `hash` (body stored, validated or
    /// failed). Returns the new active tip if it moved.
    pub fn record_changed(&self, hash: &BlockHash) -> Option<ChainTipInfo> {
        let mut tree = self.write();
        let previous = tree.active;

        let node = tree.nodes.get_mut(hash)?;
        node.own = own_status(&self.store, hash);
        tree.refresh_paths(*hash);
        let linked = tree.link_from(*hash);
        tree.promote(linked);

        if tree.active == previous {
            return None;
        }
        let active = tree.active_tip();
        info!(hash = %active.hash, height = active.height, "Active tip changed");
        Some(active)
    }

    /// Every tip, highest first, ties by hash
    pub fn list_tips(&self) -> Vec<ChainTipInfo> {
        self.read().tips()
    }

    pub fn best_active(&self) -> ChainTipInfo {
        self.read().active_tip()
    }

    /// Most-worked tip not known to be invalid
    pub fn best_header(&self) -> BlockHash {
        self.read().best_header()
    }

    /// Blocks between the active chain and the best header with no body
    /// and no outstanding request, ancestors first.
    pub fn missing_bodies_on_best_chain(&self) -> Vec<BlockHash> {
        let tree = self.read();
        let best = tree.best_header();
        let fork = tree.fork_height(best, tree.active);

        let mut missing = Vec::new();
        let mut cursor = Some(best);
        while let Some(hash) = cursor {
            let Some(node) = tree.nodes.get(&hash).filter(|node| node.height > fork) else {
                break;
            };
            if matches!(
                self.store.fetch_state(&hash),
                Some(FetchState::NotRequested | FetchState::Failed(FailureReason::FetchAbandoned))
            ) {
                missing.push(hash);
            }
            cursor = node.parent;
        }
        missing.reverse();
        missing
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().nodes.is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, TipTree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TipTree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TipTree {
    /// Add a node under its parent. Returns whether it is linked.
    fn insert(&mut self, record: &HeaderRecord, own: TipStatus) -> bool {
        let parent = record.parent();
        let skip = parent.and_then(|parent| self.ancestor(parent, skip_height(record.height)));
        let (path, linked) = match parent.and_then(|parent| self.nodes.get_mut(&parent)) {
            Some(parent) => {
                parent.children.push(record.hash);
                (parent.path.max(own), parent.linked && own == TipStatus::ValidFork)
            }
            None => (own, own == TipStatus::ValidFork),
        };
        if let Some(parent) = parent {
            self.leaves.remove(&parent);
        }
        self.leaves.insert(record.hash);

        self.nodes.insert(
            record.hash,
            TipNode {
                height: record.height,
                chain_work: record.chain_work,
                parent,
                skip,
                children: Vec::new(),
                own,
                path,
                linked,
            },
        );
        linked
    }

    /// Recompute cached path statuses below `from`, stopping wherever the
    /// value does not change
    fn refresh_paths(&mut self, from: BlockHash) {
        let mut pending = VecDeque::from([from]);
        while let Some(hash) = pending.pop_front() {
            let parent_path = self
                .nodes
                .get(&hash)
                .and_then(|node| node.parent)
                .and_then(|parent| self.nodes.get(&parent))
                .map(|parent| parent.path);
            let Some(node) = self.nodes.get_mut(&hash) else {
                continue;
            };
            let path = parent_path.map_or(node.own, |parent| parent.max(node.own));
            if path == node.path && hash != from {
                continue;
            }
            node.path = path;
            pending.extend(node.children.iter().copied());
        }
    }

    /// Link `from` if it and its parent allow it, then every validated
    /// descendant reachable through validated blocks. Returns the newly
    /// linked blocks.
    fn link_from(&mut self, from: BlockHash) -> Vec<BlockHash> {
        let parent_linked = |tree: &Self, hash: &BlockHash| {
            tree.nodes
                .get(hash)
                .and_then(|node| node.parent)
                .map_or(true, |parent| tree.nodes.get(&parent).is_some_and(|p| p.linked))
        };
        if !parent_linked(self, &from) {
            return Vec::new();
        }

        let mut linked = Vec::new();
        let mut pending = vec![from];
        while let Some(hash) = pending.pop() {
            let Some(node) = self.nodes.get_mut(&hash) else {
                continue;
            };
            if node.linked || node.own != TipStatus::ValidFork {
                continue;
            }
            node.linked = true;
            linked.push(hash);
            pending.extend(node.children.iter().copied());
        }
        linked
    }

    /// Move the active block to the most-worked of `candidates` if it beats
    /// the current one. Equal work keeps the current block, otherwise the
    /// lower hash wins.
    fn promote(&mut self, candidates: Vec<BlockHash>) {
        let incumbent = self.active;
        let work = |hash: &BlockHash| self.nodes.get(hash).map_or(0, |node| node.chain_work);
        let mut best = incumbent;
        for candidate in candidates {
            let (candidate_work, best_work) = (work(&candidate), work(&best));
            if candidate_work > best_work
                || (candidate_work == best_work && best != incumbent && candidate < best)
            {
                best = candidate;
            }
        }
        self.active = best;
    }

    /// Ancestor of `from` at `height`
    fn ancestor(&self, from: BlockHash, height: u64) -> Option<BlockHash> {
        let mut hash = from;
        let mut node = self.nodes.get(&hash)?;
        if height > node.height {
            return None;
        }
        let mut walk_height = node.height;
        while walk_height > height {
            let skip_to = skip_height(walk_height);
            let skip_prev = skip_height(walk_height - 1);
            let use_skip = skip_to == height
                || (skip_to > height && !(skip_prev + 2 < skip_to && skip_prev >= height));
            match node.skip {
                Some(skip) if use_skip => {
                    hash = skip;
                    walk_height = skip_to;
                }
                _ => {
                    hash = node.parent?;
                    walk_height -= 1;
                }
            }
            node = self.nodes.get(&hash)?;
        }
        Some(hash)
    }

    /// Height of the last block `a` and `b` have in common
    fn fork_height(&self, a: BlockHash, b: BlockHash) -> u64 {
        let height = |hash: &BlockHash| self.nodes.get(hash).map_or(0, |node| node.height);
        let mut low = 0;
        let mut high = height(&a).min(height(&b));
        while low < high {
            let mid = low + (high - low + 1) / 2;
            if self.ancestor(a, mid) == self.ancestor(b, mid) {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        low
    }

    fn active_tip(&self) -> ChainTipInfo {
        ChainTipInfo {
            hash: self.active,
            height: self.nodes.get(&self.active).map(|node| node.height).unwrap_or_default(),
            branch_len: 0,
            status: TipStatus::Active,
        }
    }

    fn tips(&self) -> Vec<ChainTipInfo> {
        let mut tips = vec![self.active_tip()];
        for hash in self.leaves.iter().filter(|hash| **hash != self.active) {
            let Some(node) = self.nodes.get(hash) else {
                continue;
            };
            tips.push(ChainTipInfo {
                hash: *hash,
                height: node.height,
                branch_len: node.height - self.fork_height(*hash, self.active),
                status: node.path,
            });
        }
        tips.sort_by(|a, b| b.height.cmp(&a.height).then_with(|| a.hash.cmp(&b.hash)));
        tips
    }

    fn best_header(&self) -> BlockHash {
        self.tips()
            .iter()
            .filter(|tip| tip.status != TipStatus::Invalid)
            .filter_map(|tip| self.nodes.get(&tip.hash).map(|node| (tip.hash, node.chain_work)))
            .fold(None, |best: Option<(BlockHash, u128)>, (hash, work)| match best {
                Some((_, best_work)) if best_work >= work => best,
                _ => Some((hash, work)),
            })
            .map(|(hash, _)| hash)
            .unwrap_or(self.active)
    }
}
