//! Test helpers: deterministic header chains, a scriptable peer network
//! and consensus rules with configurable verdicts.

mod chain;
mod peers;
mod rules;

pub use chain::{build_chain, child_block, coinbase_tx, ChainBuilder, REGTEST_BITS};
pub use peers::{MockPeerNetwork, PeerBehaviour};
pub use rules::MockRules;
