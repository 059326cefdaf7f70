use std::{fs, path::Path};

use anyhow::{anyhow, Result};
use auxblocks_common::BlockHash;
use fjall::{Database, Keyspace};

use crate::block_store::HeaderRecord;
use crate::stores::{PersistedBlock, PersistedHeader};

const HEADERS_KEYSPACE: &str = "headers";
const BODIES_KEYSPACE: &str = "bodies";
const VALIDATED_KEYSPACE: &str = "validated";

/// Headers are keyed by height then hash, so a scan replays parents first
pub struct FjallStore {
    database: Database,
    headers: Keyspace,
    bodies: Keyspace,
    validated: Keyspace,
}

impl FjallStore {
    pub fn new(path: &Path, clear: bool) -> Result<Self> {
        if clear && path.exists() {
            fs::remove_dir_all(path)?;
        }
        let database = Database::builder(path).open()?;
        let headers = database.keyspace(HEADERS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let bodies = database.keyspace(BODIES_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let validated =
            database.keyspace(VALIDATED_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;

        Ok(Self {
            database,
            headers,
            bodies,
            validated,
        })
    }
}

impl super::Store for FjallStore {
    fn insert_header(&self, record: &HeaderRecord) -> Result<()> {
        let encoded = minicbor::to_vec(PersistedHeader::from_record(record))
            .map_err(|e| anyhow!("could not encode header {}: {e}", record.hash))?;

        let mut batch = self.database.batch();
        batch.insert(&self.headers, header_key(record.height, &record.hash), encoded);
        batch.commit()?;
        Ok(())
    }

    fn insert_body(&self, hash: &BlockHash, block: &[u8]) -> Result<()> {
        let mut batch = self.database.batch();
        batch.insert(&self.bodies, hash.as_ref(), block);
        batch.commit()?;
        Ok(())
    }

    fn set_validated(&self, hash: &BlockHash) -> Result<()> {
        let mut batch = self.database.batch();
        batch.insert(&self.validated, hash.as_ref(), [1u8]);
        batch.commit()?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<PersistedBlock>> {
        let mut blocks = Vec::new();
        for res in self.headers.iter() {
            let value = res.value()?;
            let persisted: PersistedHeader = minicbor::decode(&value)?;
            let header = persisted.into_record()?;
            let body = self.bodies.get(header.hash.as_ref())?.map(|body| body.to_vec());
            let validated = self.validated.get(header.hash.as_ref())?.is_some();
            blocks.push(PersistedBlock {
                header,
                body,
                validated,
            });
        }
        Ok(blocks)
    }
}

fn header_key(height: u64, hash: &BlockHash) -> [u8; 40] {
    let mut key = [0; 40];
    key[..8].copy_from_slice(height.to_be_bytes().as_slice());
    key[8..].copy_from_slice(hash.as_ref());
    key
}
