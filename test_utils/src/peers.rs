use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use auxblocks_common::{Block, BlockHash, FetchError, PeerId, PeerNetwork};

use crate::chain::coinbase_tx;

/// How a mock peer answers body requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerBehaviour {
    /// Serves announced blocks immediately
    Honest,
    /// Serves announced blocks after a delay
    Slow(Duration),
    /// Never answers; the caller's timeout has to fire
    Silent,
    /// Drops the connection on every request
    Disconnects,
    /// Answers with a different, well-formed block
    WrongBlock,
    /// Answers with bytes that are not a block
    Garbage,
    /// Answers with the right header over different transactions
    Tampered,
}

#[derive(Default)]
struct MockState {
    peers: BTreeMap<PeerId, PeerBehaviour>,
    blocks: HashMap<BlockHash, Block>,
    announced: HashMap<BlockHash, BTreeSet<PeerId>>,
    scripted: HashMap<BlockHash, VecDeque<Vec<PeerId>>>,
    requests: Vec<(PeerId, BlockHash)>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Peer network whose peers follow a script
#[derive(Default, Clone)]
pub struct MockPeerNetwork {
    state: Arc<Mutex<MockState>>,
}

/// Keeps the in-flight count right when a request future is dropped by a
/// timeout
struct InFlight(Arc<Mutex<MockState>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.in_flight -= 1;
        }
    }
}

impl MockPeerNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, peer: PeerId, behaviour: PeerBehaviour) {
        self.state.lock().unwrap().peers.insert(peer, behaviour);
    }

    pub fn set_behaviour(&self, peer: PeerId, behaviour: PeerBehaviour) {
        self.add_peer(peer, behaviour);
    }

    /// `peer` advertises, and can serve, every block in `blocks`
    pub fn announce(&self, peer: PeerId, blocks: &[Block]) {
        let mut state = self.state.lock().unwrap();
        for block in blocks {
            state.blocks.insert(block.hash(), block.clone());
            state.announced.entry(block.hash()).or_default().insert(peer);
        }
    }

    /// Answer the next candidate lookups for `hash` with `rounds`, in order,
    /// before falling back to what was announced
    pub fn script_candidates(&self, hash: BlockHash, rounds: Vec<Vec<PeerId>>) {
        self.state.lock().unwrap().scripted.entry(hash).or_default().extend(rounds);
    }

    /// Every body request made so far, in order
    pub fn requests(&self) -> Vec<(PeerId, BlockHash)> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_for(&self, hash: &BlockHash) -> Vec<PeerId> {
        self.requests().into_iter().filter(|(_, h)| h == hash).map(|(peer, _)| peer).collect()
    }

    /// Highest number of simultaneous body requests seen
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

#[async_trait]
impl PeerNetwork for MockPeerNetwork {
    async fn candidates(&self, hash: &BlockHash) -> Vec<PeerId> {
        let mut state = self.state.lock().unwrap();
        if let Some(round) = state.scripted.get_mut(hash).and_then(VecDeque::pop_front) {
            return round;
        }
        state
            .announced
            .get(hash)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn fetch_body(
        &self,
        peer: PeerId,
        hash: &BlockHash,
        _timeout: Duration,
    ) -> Result<Vec<u8>, FetchError> {
        let (behaviour, block, other) = {
            let mut state = self.state.lock().unwrap();
            state.requests.push((peer, *hash));
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            let other = state.blocks.values().find(|b| b.hash() != *hash).cloned();
            (state.peers.get(&peer).cloned(), state.blocks.get(hash).cloned(), other)
        };
        let _in_flight = InFlight(self.state.clone());

        let serve = |block: Option<Block>| {
            block.map(|b| b.as_bytes().to_vec()).ok_or(FetchError::Disconnected(peer))
        };
        match behaviour {
            None | Some(PeerBehaviour::Disconnects) => Err(FetchError::Disconnected(peer)),
            Some(PeerBehaviour::Honest) => serve(block),
            Some(PeerBehaviour::Slow(delay)) => {
                tokio::time::sleep(delay).await;
                serve(block)
            }
            Some(PeerBehaviour::Silent) => std::future::pending().await,
            Some(PeerBehaviour::WrongBlock) => {
                let genesis = Block::regtest_genesis().map_err(|e| FetchError::Malformed(e.to_string()))?;
                Ok(other.unwrap_or(genesis).as_bytes().to_vec())
            }
            Some(PeerBehaviour::Garbage) => Ok(vec![0xde, 0xad, 0xbe, 0xef]),
            Some(PeerBehaviour::Tampered) => {
                let block = block.ok_or(FetchError::Disconnected(peer))?;
                let mut raw = block.header().to_bytes().to_vec();
                raw.push(1);
                raw.extend_from_slice(&coinbase_tx(b"pays someone else"));
                Ok(raw)
            }
        }
    }
}
