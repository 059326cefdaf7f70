use std::sync::Arc;

use anyhow::Result;
use auxblocks_common::BlockHash;

use crate::block_store::HeaderRecord;
use crate::configuration::{BlockRequestsConfig, StoreKind};

pub mod fjall;
pub mod memory;

/// Durable side of the block store. Writes happen before the in-memory
/// record changes, so a failed write leaves the record untouched.
pub trait Store: Send + Sync {
    fn insert_header(&self, record: &HeaderRecord) -> Result<()>;
    fn insert_body(&self, hash: &BlockHash, block: &[u8]) -> Result<()>;
    fn set_validated(&self, hash: &BlockHash) -> Result<()>;

    /// Everything persisted, parents before children
    fn load(&self) -> Result<Vec<PersistedBlock>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedBlock {
    pub header: HeaderRecord,
    pub body: Option<Vec<u8>>,
    pub validated: bool,
}

/// On-disk form of a header record. The hash is the key.
#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub(crate) struct PersistedHeader {
    #[n(0)]
    pub height: u64,
    #[n(1)]
    pub work_hi: u64,
    #[n(2)]
    pub work_lo: u64,
    #[cbor(n(3), with = "minicbor::bytes")]
    pub header: Vec<u8>,
}

impl PersistedHeader {
    pub(crate) fn from_record(record: &HeaderRecord) -> Self {
        Self {
            height: record.height,
            work_hi: (record.chain_work >> 64) as u64,
            work_lo: record.chain_work as u64,
            header: record.header.to_bytes().to_vec(),
        }
    }

    pub(crate) fn into_record(self) -> Result<HeaderRecord> {
        let header = auxblocks_common::BlockHeader::from_bytes(&self.header)?;
        Ok(HeaderRecord {
            hash: header.hash(),
            height: self.height,
            chain_work: ((self.work_hi as u128) << 64) | self.work_lo as u128,
            header,
        })
    }
}

pub fn open_store(cfg: &BlockRequestsConfig) -> Result<Arc<dyn Store>> {
    match cfg.store {
        StoreKind::Memory => Ok(Arc::new(memory::MemoryStore::new())),
        StoreKind::Fjall => Ok(Arc::new(fjall::FjallStore::new(
            &cfg.database_path,
            cfg.clear_on_start,
        )?)),
    }
}
