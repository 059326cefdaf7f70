use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

/// A `BYTES` long digest.
///
/// Bytes are held in the order the hash function produced them, which is
/// the order they travel in on the wire and in storage keys. Text forms
/// (display, parsing, serde) use the byte-reversed hex that RPC interfaces
/// print, so the regtest genesis block reads
/// `0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash<const BYTES: usize>([u8; BYTES]);

impl<const BYTES: usize> Default for Hash<BYTES> {
    fn default() -> Self {
        Self::new([0u8; BYTES])
    }
}

impl<const BYTES: usize> Hash<BYTES> {
    /// Wrap bytes given in wire order
    #[inline]
    pub const fn new(bytes: [u8; BYTES]) -> Self {
        Self(bytes)
    }

    fn to_hex(self) -> String {
        let mut bytes = self.0;
        bytes.reverse();
        hex::encode(bytes)
    }
}

impl Hash<32> {
    /// Double SHA-256 of `data`, the identifier function for headers and
    /// transactions.
    pub fn sha256d(data: &[u8]) -> Self {
        let once = Sha256::digest(data);
        Self::new(Sha256::digest(once).into())
    }
}

impl<const BYTES: usize> AsRef<[u8]> for Hash<BYTES> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const BYTES: usize> fmt::Debug for Hash<BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(&format!("Hash<{BYTES}>")).field(&self.to_hex()).finish()
    }
}

impl<const BYTES: usize> fmt::Display for Hash<BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl<const BYTES: usize> FromStr for Hash<BYTES> {
    type Err = hex::FromHexError;

    /// Parse byte-reversed hex of exactly `BYTES` bytes
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; BYTES];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Self::new(bytes))
    }
}

impl<const BYTES: usize> Serialize for Hash<BYTES> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de, const BYTES: usize> Deserialize<'de> for Hash<BYTES> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of a block: double SHA-256 of its 80-byte header.
pub type BlockHash = Hash<32>;

/// Merkle root committed to by a header.
pub type MerkleRoot = Hash<32>;

#[cfg(test)]
mod tests {
    use super::*;

    const REGTEST_GENESIS: &str = "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206";

    #[test]
    fn text_form_is_byte_reversed() {
        let text = "00000000000000000000000000000000000000000000000000000000000000ff";
        let hash: BlockHash = text.parse().unwrap();
        assert_eq!(hash.as_ref()[0], 0xff);
        assert_eq!(hash.as_ref()[31], 0x00);
        assert_eq!(hash.to_string(), text);
    }

    #[test]
    fn regtest_genesis_reads_as_rpc_prints_it() {
        let genesis = crate::Block::regtest_genesis().unwrap();
        assert_eq!(genesis.hash().to_string(), REGTEST_GENESIS);
        assert_eq!(REGTEST_GENESIS.parse::<BlockHash>().unwrap(), genesis.hash());
        // Wire order starts with the low byte
        assert_eq!(genesis.hash().as_ref()[0], 0x06);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("abcd".parse::<BlockHash>().is_err());
        assert!(format!("{REGTEST_GENESIS}00").parse::<BlockHash>().is_err());
    }

    #[test]
    fn serializes_as_hex_string() {
        let genesis: BlockHash = REGTEST_GENESIS.parse().unwrap();
        let json = serde_json::to_string(&genesis).unwrap();
        assert_eq!(json, format!("\"{REGTEST_GENESIS}\""));
        let back: BlockHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, genesis);
    }

    #[test]
    fn sha256d_of_empty_input() {
        // SHA256(SHA256("")), printed reversed
        let hash = BlockHash::sha256d(b"");
        assert_eq!(
            hash.to_string(),
            "56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
        );
    }
}
