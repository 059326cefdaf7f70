use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use auxblocks_common::{
    Block, BlockHash, BlockHeader, ConsensusRules, ValidationError, ValidationStatus,
};

/// Accepts every block that links to its parent, except those told to
/// reject
#[derive(Default)]
pub struct MockRules {
    rejected: Mutex<HashMap<BlockHash, String>>,
    checked: Mutex<Vec<BlockHash>>,
    unavailable: AtomicBool,
}

impl MockRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, hash: BlockHash, reason: &str) {
        self.rejected.lock().unwrap().insert(hash, reason.to_string());
    }

    /// Blocks the rules were consulted for, in order
    pub fn checked(&self) -> Vec<BlockHash> {
        self.checked.lock().unwrap().clone()
    }

    /// Make every check fail as if the engine were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConsensusRules for MockRules {
    async fn check(&self, block: &Block, parent: &BlockHeader) -> Result<ValidationStatus> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("validator offline");
        }
        self.checked.lock().unwrap().push(block.hash());

        if block.header().prev_hash != parent.hash() {
            return Ok(ValidationStatus::NoGo(ValidationError::Rejected(
                "bad-prevblk".to_string(),
            )));
        }
        Ok(match self.rejected.lock().unwrap().get(&block.hash()) {
            Some(reason) => ValidationStatus::NoGo(ValidationError::Rejected(reason.clone())),
            None => ValidationStatus::Go,
        })
    }
}
