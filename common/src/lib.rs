// Auxblocks common library - main library exports

pub mod block;
pub mod commands;
pub mod hash;
pub mod messages;
pub mod peers;
pub mod validation;

// Flattened re-exports
pub use self::block::{Block, BlockDecodeError, BlockHeader, HEADER_SIZE};
pub use self::hash::{BlockHash, Hash, MerkleRoot};
pub use self::peers::{FetchError, PeerId, PeerNetwork};
pub use self::validation::{ConsensusRules, ValidationError, ValidationStatus};
