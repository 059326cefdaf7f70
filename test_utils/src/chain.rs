use auxblocks_common::{Block, BlockHash, BlockHeader};

/// Easiest possible target; any nonce meets it
pub const REGTEST_BITS: u32 = 0x207f_ffff;

/// A coinbase-shaped transaction whose input script is `tag`
pub fn coinbase_tx(tag: &[u8]) -> Vec<u8> {
    let mut tx = Vec::with_capacity(64 + tag.len());
    tx.extend_from_slice(&1u32.to_le_bytes());
    tx.push(1);
    tx.extend_from_slice(&[0u8; 32]);
    tx.extend_from_slice(&u32::MAX.to_le_bytes());
    tx.push(tag.len() as u8);
    tx.extend_from_slice(tag);
    tx.extend_from_slice(&u32::MAX.to_le_bytes());
    tx.push(1);
    tx.extend_from_slice(&5_000_000_000u64.to_le_bytes());
    tx.push(0);
    tx.extend_from_slice(&0u32.to_le_bytes());
    tx
}

/// A block extending `parent`. `branch` distinguishes siblings, so two
/// branches off the same parent never collide.
pub fn child_block(parent: &BlockHeader, branch: u32) -> Block {
    let parent_hash = parent.hash();
    let mut tag = parent_hash.as_ref().to_vec();
    tag.extend_from_slice(&branch.to_le_bytes());
    let tx = coinbase_tx(&tag);

    let mut payload = vec![1u8];
    payload.extend_from_slice(&tx);

    let header = BlockHeader {
        version: 0x2000_0000,
        prev_hash: parent_hash,
        merkle_root: BlockHash::sha256d(&tx),
        time: parent.time + 600,
        bits: REGTEST_BITS,
        nonce: branch,
    };
    Block::new(header, &payload).expect("generated block is well formed")
}

/// `count` blocks extending `parent`, in order
pub fn build_chain(parent: &BlockHeader, count: usize, branch: u32) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(count);
    for _ in 0..count {
        let block = match blocks.last() {
            Some(last) => child_block(last.header(), branch),
            None => child_block(parent, branch),
        };
        blocks.push(block);
    }
    blocks
}

/// A linear chain on top of the regtest genesis block
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    genesis: Block,
    blocks: Vec<Block>,
}

impl ChainBuilder {
    pub fn regtest() -> Self {
        Self {
            genesis: Block::regtest_genesis().expect("regtest genesis decodes"),
            blocks: Vec::new(),
        }
    }

    pub fn extend(mut self, count: usize, branch: u32) -> Self {
        let parent = self.tip().header().clone();
        self.blocks.extend(build_chain(&parent, count, branch));
        self
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    /// Blocks above genesis; index `i` is at height `i + 1`
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn tip(&self) -> &Block {
        self.blocks.last().unwrap_or(&self.genesis)
    }

    pub fn hashes(&self) -> Vec<BlockHash> {
        self.blocks.iter().map(Block::hash).collect()
    }
}
