use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use auxblocks_common::BlockHash;

use crate::block_store::HeaderRecord;
use crate::stores::PersistedBlock;

/// Store that lives as long as the process. Reopening a `BlockStore` over
/// the same instance replays it, as a disk store would after a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    headers: BTreeMap<(u64, BlockHash), HeaderRecord>,
    bodies: HashMap<BlockHash, Vec<u8>>,
    validated: HashSet<BlockHash>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl super::Store for MemoryStore {
    fn insert_header(&self, record: &HeaderRecord) -> Result<()> {
        self.lock()?.headers.insert((record.height, record.hash), record.clone());
        Ok(())
    }

    fn insert_body(&self, hash: &BlockHash, block: &[u8]) -> Result<()> {
        self.lock()?.bodies.insert(*hash, block.to_vec());
        Ok(())
    }

    fn set_validated(&self, hash: &BlockHash) -> Result<()> {
        self.lock()?.validated.insert(*hash);
        Ok(())
    }

    fn load(&self) -> Result<Vec<PersistedBlock>> {
        let inner = self.lock()?;
        Ok(inner
            .headers
            .values()
            .map(|header| PersistedBlock {
                header: header.clone(),
                body: inner.bodies.get(&header.hash).cloned(),
                validated: inner.validated.contains(&header.hash),
            })
            .collect())
    }
}
