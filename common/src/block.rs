//! Block and header wire formats
//!
//! Headers are the classic 80-byte layout: little-endian version, previous
//! block hash, merkle root, little-endian time, compact difficulty bits and
//! nonce. A block is its header followed by the transaction payload (a
//! compact-size transaction count and the serialized transactions). A
//! decoded block always carries the transactions its header commits to.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{BlockHash, MerkleRoot};

/// Serialized size of a block header
pub const HEADER_SIZE: usize = 80;

/// Regtest genesis block, serialized
pub const REGTEST_GENESIS_BLOCK: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff7f20020000000101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";

/// Errors decoding headers and blocks from raw bytes
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BlockDecodeError {
    #[error("header must be {HEADER_SIZE} bytes, got {0}")]
    HeaderLength(usize),

    #[error("block of {0} bytes is too short to hold a header and transaction count")]
    Truncated(usize),

    #[error("malformed transaction count")]
    BadTxCount,

    #[error("block carries no transactions")]
    NoTransactions,

    #[error("transaction {index} is malformed")]
    BadTransaction { index: usize },

    #[error("{0} bytes follow the last transaction")]
    TrailingData(usize),

    #[error("transactions hash to {computed}, header commits to {expected}")]
    MerkleMismatch {
        expected: MerkleRoot,
        computed: MerkleRoot,
    },

    #[error("transaction list repeats a merkle leaf")]
    MutatedMerkle,

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Decoded block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: BlockHash,
    pub merkle_root: MerkleRoot,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, BlockDecodeError> {
        if raw.len() != HEADER_SIZE {
            return Err(BlockDecodeError::HeaderLength(raw.len()));
        }
        let u32_at = |offset: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&raw[offset..offset + 4]);
            u32::from_le_bytes(word)
        };
        let hash_at = |offset: usize| {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&raw[offset..offset + 32]);
            BlockHash::new(bytes)
        };

        Ok(Self {
            version: u32_at(0) as i32,
            prev_hash: hash_at(4),
            merkle_root: hash_at(36),
            time: u32_at(68),
            bits: u32_at(72),
            nonce: u32_at(76),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.version.to_le_bytes());
        raw[4..36].copy_from_slice(self.prev_hash.as_ref());
        raw[36..68].copy_from_slice(self.merkle_root.as_ref());
        raw[68..72].copy_from_slice(&self.time.to_le_bytes());
        raw[72..76].copy_from_slice(&self.bits.to_le_bytes());
        raw[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        raw
    }

    pub fn hash(&self) -> BlockHash {
        BlockHash::sha256d(&self.to_bytes())
    }

    /// Expected number of hashes needed to meet this header's target,
    /// `2^256 / (target + 1)`, saturating at `u128::MAX`.
    ///
    /// Returns zero for a negative or zero target, which no valid header has.
    pub fn work(&self) -> u128 {
        let exponent = (self.bits >> 24) as i32;
        let mantissa = self.bits & 0x007f_ffff;
        if mantissa == 0 || self.bits & 0x0080_0000 != 0 {
            return 0;
        }

        // target = mantissa * 2^(8 * (exponent - 3)), so work ~= 2^shift / mantissa
        let shift = 256 - 8 * (exponent - 3);
        if shift <= 0 {
            return 0;
        }
        let mantissa_bits = 32 - mantissa.leading_zeros() as i32;
        if shift - mantissa_bits + 1 > 127 {
            return u128::MAX;
        }
        if shift <= 127 {
            (1u128 << shift) / mantissa as u128
        } else {
            ((1u128 << 127) / mantissa as u128) << (shift - 127)
        }
    }
}

/// A full block: header plus transaction payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    header: BlockHeader,
    hash: BlockHash,
    raw: Vec<u8>,
}

impl Block {
    /// Build a block from a header and its serialized transaction payload
    pub fn new(header: BlockHeader, payload: &[u8]) -> Result<Self, BlockDecodeError> {
        let mut raw = Vec::with_capacity(HEADER_SIZE + payload.len());
        raw.extend_from_slice(&header.to_bytes());
        raw.extend_from_slice(payload);
        Self::from_bytes(raw)
    }

    /// Decode a serialized block.
    ///
    /// The transactions are split out and hashed, and their merkle root has
    /// to match the header. Whether they are valid is left to the consensus
    /// rules.
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self, BlockDecodeError> {
        if raw.len() <= HEADER_SIZE {
            return Err(BlockDecodeError::Truncated(raw.len()));
        }
        let header = BlockHeader::from_bytes(&raw[..HEADER_SIZE])?;
        let txids = read_txids(&raw[HEADER_SIZE..])?;
        let computed = merkle_root(&txids)?;
        if computed != header.merkle_root {
            return Err(BlockDecodeError::MerkleMismatch {
                expected: header.merkle_root,
                computed,
            });
        }
        let hash = header.hash();
        Ok(Self { header, hash, raw })
    }

    pub fn from_hex(text: &str) -> Result<Self, BlockDecodeError> {
        Self::from_bytes(hex::decode(text)?)
    }

    pub fn regtest_genesis() -> Result<Self, BlockDecodeError> {
        Self::from_hex(REGTEST_GENESIS_BLOCK)
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Hash computed from the header bytes carried by this block
    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_SIZE..]
    }

    pub fn tx_count(&self) -> u64 {
        read_compact_size(self.payload()).map(|(count, _)| count).unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }
}

/// Read a compact-size integer, returning the value and the bytes consumed
pub fn read_compact_size(bytes: &[u8]) -> Result<(u64, usize), BlockDecodeError> {
    let (&first, rest) = bytes.split_first().ok_or(BlockDecodeError::BadTxCount)?;
    let width = match first {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        n => return Ok((n as u64, 1)),
    };
    if rest.len() < width {
        return Err(BlockDecodeError::BadTxCount);
    }
    let mut value = [0u8; 8];
    value[..width].copy_from_slice(&rest[..width]);
    Ok((u64::from_le_bytes(value), width + 1))
}

/// Cursor over a transaction payload
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn compact_size(&mut self) -> Option<u64> {
        let (value, used) = read_compact_size(self.bytes.get(self.pos..)?).ok()?;
        self.pos += used;
        Some(value)
    }

    /// A compact-size length followed by that many bytes
    fn skip_var_bytes(&mut self) -> Option<()> {
        let len = usize::try_from(self.compact_size()?).ok()?;
        self.take(len).map(|_| ())
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }
}

/// Identifier of the transaction at the reader's position: double SHA-256
/// of its serialization without witness data.
fn read_txid(reader: &mut Reader<'_>) -> Option<BlockHash> {
    let version = reader.take(4)?;
    let segwit = reader.peek(0) == Some(0) && reader.peek(1).is_some_and(|flag| flag != 0);
    if segwit {
        reader.take(2)?;
    }

    let body_start = reader.pos;
    let inputs = reader.compact_size()?;
    for _ in 0..inputs {
        reader.take(36)?; // outpoint
        reader.skip_var_bytes()?;
        reader.take(4)?; // sequence
    }
    let outputs = reader.compact_size()?;
    for _ in 0..outputs {
        reader.take(8)?; // value
        reader.skip_var_bytes()?;
    }
    let body_end = reader.pos;

    if segwit {
        for _ in 0..inputs {
            let items = reader.compact_size()?;
            for _ in 0..items {
                reader.skip_var_bytes()?;
            }
        }
    }
    let lock_time = reader.take(4)?;

    let mut stripped = Vec::with_capacity(8 + body_end - body_start);
    stripped.extend_from_slice(version);
    stripped.extend_from_slice(&reader.bytes[body_start..body_end]);
    stripped.extend_from_slice(lock_time);
    Some(BlockHash::sha256d(&stripped))
}

fn read_txids(payload: &[u8]) -> Result<Vec<BlockHash>, BlockDecodeError> {
    let (tx_count, used) = read_compact_size(payload)?;
    if tx_count == 0 {
        return Err(BlockDecodeError::NoTransactions);
    }

    let mut reader = Reader {
        bytes: payload,
        pos: used,
    };
    // A transaction takes at least 60 bytes, so a lying count cannot force
    // a large allocation
    let mut txids = Vec::with_capacity((tx_count as usize).min(payload.len() / 60 + 1));
    for index in 0..tx_count as usize {
        let txid = read_txid(&mut reader).ok_or(BlockDecodeError::BadTransaction { index })?;
        txids.push(txid);
    }
    match payload.len() - reader.pos {
        0 => Ok(txids),
        extra => Err(BlockDecodeError::TrailingData(extra)),
    }
}

/// Merkle root over transaction ids, duplicating the last entry of odd
/// levels.
///
/// Two equal hashes paired at the same level mean the list was padded with
/// a copy of its own tail, which would give a second transaction list the
/// same root; that is refused.
pub fn merkle_root(txids: &[BlockHash]) -> Result<MerkleRoot, BlockDecodeError> {
    let Some(first) = txids.first() else {
        return Err(BlockDecodeError::NoTransactions);
    };
    let mut level = txids.to_vec();
    if level.len() == 1 {
        return Ok(*first);
    }

    while level.len() > 1 {
        for pair in level.chunks_exact(2) {
            if pair[0] == pair[1] {
                return Err(BlockDecodeError::MutatedMerkle);
            }
        }
        if level.len() % 2 == 1 {
            if let Some(&last) = level.last() {
                level.push(last);
            }
        }
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut joined = [0u8; 64];
                joined[..32].copy_from_slice(pair[0].as_ref());
                joined[32..].copy_from_slice(pair[1].as_ref());
                BlockHash::sha256d(&joined)
            })
            .collect();
    }
    Ok(level[0])
}
