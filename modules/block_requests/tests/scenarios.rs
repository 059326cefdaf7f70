//! End-to-end behaviour of the block sync core against scripted peers.

use std::sync::Arc;
use std::time::Duration;

use auxblocks_common::commands::block_requests::{
    BlockRequestsCommand, BlockRequestsError, BlockRequestsEvent, BlockRequestsResponse,
    FailureReason, FetchState, RequestOptions, TipStatus,
};
use auxblocks_common::{BlockHash, PeerId};
use auxblocks_module_block_requests::stores::memory::MemoryStore;
use auxblocks_module_block_requests::stores::Store;
use auxblocks_module_block_requests::{
    BlockSync, EventForwarder, FetchSettings, HeaderAcceptance, SyncSettings,
};
use auxblocks_test_utils::{build_chain, ChainBuilder, MockPeerNetwork, MockRules, PeerBehaviour};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const HONEST: PeerId = PeerId(1);

struct Harness {
    sync: BlockSync,
    peers: MockPeerNetwork,
    rules: Arc<MockRules>,
    events: UnboundedReceiver<BlockRequestsEvent>,
    worker: JoinHandle<()>,
}

fn settings(max_attempts: u32, max_in_flight: usize) -> SyncSettings {
    SyncSettings {
        auto_request: false,
        max_attempts,
        fetch: FetchSettings {
            max_in_flight,
            request_timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(10),
        },
    }
}

impl Harness {
    fn start(chain: &ChainBuilder, settings: SyncSettings) -> Self {
        Self::start_on(chain, settings, Arc::new(MemoryStore::new()))
    }

    fn start_on(chain: &ChainBuilder, settings: SyncSettings, backend: Arc<dyn Store>) -> Self {
        let peers = MockPeerNetwork::new();
        let rules = Arc::new(MockRules::new());
        let (forwarder, events) = EventForwarder::new();
        let sync = BlockSync::open(
            settings,
            chain.genesis().clone(),
            backend,
            Arc::new(peers.clone()),
            rules.clone(),
            Arc::new(forwarder),
        )
        .unwrap();
        let worker = sync.start_fetching();
        Self {
            sync,
            peers,
            rules,
            events,
            worker,
        }
    }

    /// One honest peer serving everything in `chain`, headers accepted
    fn with_honest_peer(self, chain: &ChainBuilder) -> Self {
        self.peers.add_peer(HONEST, PeerBehaviour::Honest);
        self.peers.announce(HONEST, chain.blocks());
        self.accept(chain.blocks());
        self
    }

    fn accept(&self, blocks: &[auxblocks_common::Block]) {
        for block in blocks {
            self.sync.accept_header(block.header().clone()).unwrap();
        }
    }

    async fn request(&self, hashes: &[BlockHash], validate: bool) -> BlockRequestsResponse {
        self.sync
            .handle(BlockRequestsCommand::Start {
                hashes: hashes.to_vec(),
                options: RequestOptions { validate },
            })
            .await
    }

    async fn drained(&self) {
        timeout(Duration::from_secs(10), self.sync.status().wait_for_drain())
            .await
            .expect("requests drained");
    }

    async fn wait_for_event(&mut self, wanted: impl Fn(&BlockRequestsEvent) -> bool) -> BlockRequestsEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.expect("event channel open");
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event arrived")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[tokio::test]
async fn requested_bodies_drain_without_validation() {
    let chain = ChainBuilder::regtest().extend(10, 0);
    let harness = Harness::start(&chain, settings(3, 4)).with_honest_peer(&chain);

    let BlockRequestsResponse::Started(summary) = harness.request(&chain.hashes(), false).await
    else {
        panic!("request accepted");
    };
    assert_eq!(summary.enqueued, 10);
    harness.drained().await;

    let status = harness.sync.status();
    assert_eq!(status.status().request_present, 0);
    for hash in chain.hashes() {
        assert!(status.has_body(&hash));
        assert!(!status.is_validated(&hash));
    }
    assert!(harness.rules.checked().is_empty());
    assert_eq!(status.list_tips()[0].status, TipStatus::ValidHeaders);

    // Asking again is a no-op
    let BlockRequestsResponse::Started(summary) = harness.request(&chain.hashes(), false).await
    else {
        panic!("request accepted");
    };
    assert_eq!(summary.skipped, 10);
    assert_eq!(status.status().request_present, 0);
}

#[tokio::test]
async fn missing_first_block_defers_validation_until_it_arrives() {
    let chain = ChainBuilder::regtest().extend(103, 0);
    let harness = Harness::start(&chain, settings(3, 16)).with_honest_peer(&chain);
    let hashes = chain.hashes();

    harness.request(&hashes[1..], true).await;
    harness.drained().await;

    let status = harness.sync.status();
    for hash in &hashes[1..] {
        assert!(status.has_body(hash));
        assert!(!status.is_validated(hash));
    }
    let response = harness
        .sync
        .handle(BlockRequestsCommand::GetBlock {
            hash: hashes[50],
            verbose: true,
        })
        .await;
    let BlockRequestsResponse::Block(data) = response else {
        panic!("block data expected");
    };
    assert!(!data.validated());
    assert_eq!(
        harness
            .sync
            .handle(BlockRequestsCommand::GetBlock {
                hash: hashes[0],
                verbose: true
            })
            .await,
        BlockRequestsResponse::Error(BlockRequestsError::NotAvailable { hash: hashes[0] })
    );
    assert_eq!(status.best_active().hash, chain.genesis().hash());

    harness.request(&hashes[..1], true).await;
    harness.drained().await;

    assert!(hashes.iter().all(|hash| status.is_validated(hash)));
    assert_eq!(status.best_active().hash, chain.tip().hash());
    assert_eq!(harness.rules.checked().len(), 103);
}

#[tokio::test]
async fn unknown_hash_enqueues_nothing() {
    let chain = ChainBuilder::regtest().extend(2, 0);
    let harness = Harness::start(&chain, settings(3, 4)).with_honest_peer(&chain);
    let unknown = BlockHash::new([0xee; 32]);

    let response = harness.request(&[chain.hashes()[0], unknown], true).await;
    assert_eq!(
        response,
        BlockRequestsResponse::Error(BlockRequestsError::UnknownHash { hash: unknown })
    );
    assert_eq!(harness.sync.status().status().request_present, 0);
    assert!(harness.peers.requests().is_empty());
}

#[tokio::test]
async fn heavier_fork_becomes_active_once_validated() {
    let chain = ChainBuilder::regtest().extend(3, 0);
    let fork = build_chain(chain.blocks()[0].header(), 4, 1);
    let harness = Harness::start(&chain, settings(3, 4)).with_honest_peer(&chain);
    harness.peers.announce(HONEST, &fork);

    harness.request(&chain.hashes(), true).await;
    harness.drained().await;
    let status = harness.sync.status();
    assert_eq!(status.best_active().hash, chain.tip().hash());

    harness.accept(&fork);
    let tips = status.list_tips();
    assert_eq!(tips[0].hash, fork[3].hash());
    assert_eq!(tips[0].status, TipStatus::HeadersOnly);
    assert_eq!(tips[0].branch_len, 4);

    let fork_hashes: Vec<_> = fork.iter().map(|block| block.hash()).collect();
    harness.request(&fork_hashes, true).await;
    harness.drained().await;

    let tips = status.list_tips();
    assert_eq!(tips[0].hash, fork[3].hash());
    assert_eq!(tips[0].status, TipStatus::Active);
    assert_eq!(tips[0].branch_len, 0);
    assert_eq!(tips[1].hash, chain.tip().hash());
    assert_eq!(tips[1].status, TipStatus::ValidFork);
    assert_eq!(tips[1].branch_len, 2);
}

#[tokio::test]
async fn failed_peer_is_not_asked_twice_in_a_row() {
    let chain = ChainBuilder::regtest().extend(1, 0);
    let harness = Harness::start(&chain, settings(5, 4)).with_honest_peer(&chain);
    let flaky = PeerId(0);
    harness.peers.add_peer(flaky, PeerBehaviour::Disconnects);
    harness.peers.announce(flaky, chain.blocks());
    let hash = chain.hashes()[0];

    harness.request(&[hash], false).await;
    harness.drained().await;

    assert_eq!(harness.peers.requests_for(&hash), vec![flaky, HONEST]);
    assert!(harness.sync.status().has_body(&hash));
}

#[tokio::test]
async fn silent_peer_times_out() {
    let chain = ChainBuilder::regtest().extend(1, 0);
    let harness = Harness::start(&chain, settings(5, 4)).with_honest_peer(&chain);
    let silent = PeerId(0);
    harness.peers.add_peer(silent, PeerBehaviour::Silent);
    harness.peers.announce(silent, chain.blocks());
    let hash = chain.hashes()[0];

    harness.request(&[hash], true).await;
    harness.drained().await;

    assert_eq!(harness.peers.requests_for(&hash), vec![silent, HONEST]);
    assert!(harness.sync.status().is_validated(&hash));
}

#[tokio::test]
async fn wrong_block_is_discarded() {
    let chain = ChainBuilder::regtest().extend(2, 0);
    let harness = Harness::start(&chain, settings(5, 4)).with_honest_peer(&chain);
    let liar = PeerId(0);
    harness.peers.add_peer(liar, PeerBehaviour::WrongBlock);
    harness.peers.announce(liar, &chain.blocks()[..1]);
    let hash = chain.hashes()[0];

    harness.request(&[hash], false).await;
    harness.drained().await;

    assert_eq!(harness.peers.requests_for(&hash), vec![liar, HONEST]);
    let status = harness.sync.status();
    assert!(status.has_body(&hash));
    assert!(!status.has_body(&chain.hashes()[1]));
}

#[tokio::test]
async fn retry_limit_abandons_then_a_new_request_starts_over() {
    let chain = ChainBuilder::regtest().extend(1, 0);
    let mut harness = Harness::start(&chain, settings(3, 4));
    let broken = PeerId(7);
    harness.peers.add_peer(broken, PeerBehaviour::Garbage);
    harness.peers.announce(broken, chain.blocks());
    harness.accept(chain.blocks());
    let hash = chain.hashes()[0];

    harness.request(&[hash], true).await;
    harness.drained().await;
    let event = harness
        .wait_for_event(|event| matches!(event, BlockRequestsEvent::FetchAbandoned { .. }))
        .await;
    assert_eq!(event, BlockRequestsEvent::FetchAbandoned { hash, attempts: 3 });
    assert_eq!(harness.peers.requests_for(&hash).len(), 3);

    let response = harness
        .sync
        .handle(BlockRequestsCommand::GetHeader {
            hash,
            verbose: true,
        })
        .await;
    let BlockRequestsResponse::Header(auxblocks_common::commands::block_requests::HeaderData::Verbose(view)) =
        response
    else {
        panic!("header expected");
    };
    assert_eq!(view.fetch_state, FetchState::Failed(FailureReason::FetchAbandoned));

    harness.peers.set_behaviour(broken, PeerBehaviour::Honest);
    harness.request(&[hash], true).await;
    harness.drained().await;
    assert!(harness.sync.status().is_validated(&hash));
}

#[tokio::test]
async fn no_candidates_counts_as_a_failed_attempt() {
    let chain = ChainBuilder::regtest().extend(1, 0);
    let mut harness = Harness::start(&chain, settings(2, 4));
    harness.accept(chain.blocks());
    let hash = chain.hashes()[0];

    harness.request(&[hash], false).await;
    harness.drained().await;
    harness
        .wait_for_event(|event| matches!(event, BlockRequestsEvent::FetchAbandoned { .. }))
        .await;
    assert!(harness.peers.requests().is_empty());
}

#[tokio::test]
async fn concurrent_fetches_stay_within_the_limit() {
    let chain = ChainBuilder::regtest().extend(30, 0);
    let harness = Harness::start(&chain, settings(3, 4));
    harness.peers.add_peer(HONEST, PeerBehaviour::Slow(Duration::from_millis(20)));
    harness.peers.announce(HONEST, chain.blocks());
    harness.accept(chain.blocks());

    harness.request(&chain.hashes(), false).await;
    harness.drained().await;

    assert!(harness.peers.max_concurrent() <= 4);
    assert!(harness.peers.max_concurrent() >= 1);
    assert_eq!(harness.peers.requests().len(), 30);
}

#[tokio::test]
async fn auto_request_syncs_new_headers() {
    let chain = ChainBuilder::regtest().extend(8, 0);
    let mut harness = Harness::start(
        &chain,
        SyncSettings {
            auto_request: true,
            ..settings(3, 4)
        },
    )
    .with_honest_peer(&chain);

    harness.drained().await;
    let status = harness.sync.status();
    assert!(chain.hashes().iter().all(|hash| status.is_validated(hash)));
    assert_eq!(status.best_active().hash, chain.tip().hash());

    let tip = chain.tip().hash();
    harness
        .wait_for_event(|event| {
            matches!(event, BlockRequestsEvent::ActiveTipChanged { hash, .. } if *hash == tip)
        })
        .await;
}

#[tokio::test]
async fn rejected_block_fails_its_descendants() {
    let chain = ChainBuilder::regtest().extend(4, 0);
    let harness = Harness::start(&chain, settings(3, 4)).with_honest_peer(&chain);
    let hashes = chain.hashes();
    harness.rules.reject(hashes[1], "bad-cb-amount");

    harness.request(&hashes, true).await;
    harness.drained().await;

    let status = harness.sync.status();
    assert!(status.is_validated(&hashes[0]));
    assert!(hashes[1..].iter().all(|hash| !status.is_validated(hash)));
    assert_eq!(status.best_active().hash, hashes[0]);
    assert_eq!(status.list_tips()[0].status, TipStatus::Invalid);

    let response = harness.sync.handle(BlockRequestsCommand::Validate { hash: hashes[3] }).await;
    assert!(matches!(
        response,
        BlockRequestsResponse::Validation(
            auxblocks_common::commands::block_requests::ValidationOutcome::Rejected(_)
        )
    ));
}

#[tokio::test]
async fn records_survive_a_restart_but_requests_do_not() {
    let chain = ChainBuilder::regtest().extend(3, 0);
    let backend = Arc::new(MemoryStore::new());

    let first = Harness::start_on(&chain, settings(3, 4), backend.clone()).with_honest_peer(&chain);
    first.request(&chain.hashes(), true).await;
    first.drained().await;
    // Header only; never requested
    let extra = build_chain(chain.tip().header(), 1, 0);
    first.accept(&extra);
    drop(first);

    let second = Harness::start_on(&chain, settings(3, 4), backend);
    let status = second.sync.status();
    assert!(chain.hashes().iter().all(|hash| status.is_validated(hash)));
    assert_eq!(status.best_active().hash, chain.tip().hash());
    assert_eq!(status.status().request_present, 0);
    assert!(!status.has_body(&extra[0].hash()));

    let acceptance = second.sync.accept_header(extra[0].header().clone()).unwrap();
    assert!(matches!(acceptance, HeaderAcceptance::AlreadyKnown(_)));
}

#[tokio::test]
async fn validation_requested_mid_fetch_is_honoured() {
    let chain = ChainBuilder::regtest().extend(1, 0);
    let harness = Harness::start(&chain, settings(3, 4));
    harness.peers.add_peer(HONEST, PeerBehaviour::Slow(Duration::from_millis(100)));
    harness.peers.announce(HONEST, chain.blocks());
    harness.accept(chain.blocks());
    let hash = chain.hashes()[0];

    harness.request(&[hash], false).await;
    timeout(Duration::from_secs(1), async {
        while harness.peers.requests_for(&hash).is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("fetch started");

    let BlockRequestsResponse::Started(summary) = harness.request(&[hash], true).await else {
        panic!("request accepted");
    };
    assert_eq!(summary.merged, 1);
    harness.drained().await;

    assert_eq!(harness.peers.requests_for(&hash).len(), 1);
    assert_eq!(harness.rules.checked(), vec![hash]);
    assert!(harness.sync.status().is_validated(&hash));
}

#[tokio::test]
async fn outstanding_count_never_rises_while_draining() {
    let chain = ChainBuilder::regtest().extend(12, 0);
    let harness = Harness::start(&chain, settings(3, 2));
    let flaky = PeerId(0);
    harness.peers.add_peer(flaky, PeerBehaviour::Disconnects);
    harness.peers.announce(flaky, chain.blocks());
    harness.peers.add_peer(HONEST, PeerBehaviour::Honest);
    harness.peers.announce(HONEST, &chain.blocks()[..6]);
    harness.accept(chain.blocks());

    harness.request(&chain.hashes(), false).await;
    let status = harness.sync.status();
    let mut samples = vec![status.status().request_present];
    timeout(Duration::from_secs(10), async {
        while samples.last() != Some(&0) {
            tokio::time::sleep(Duration::from_millis(1)).await;
            samples.push(status.status().request_present);
        }
    })
    .await
    .expect("requests drained");

    assert!(samples[0] > 0);
    assert!(samples.windows(2).all(|pair| pair[1] <= pair[0]), "{samples:?}");
    let hashes = chain.hashes();
    assert!(hashes[..6].iter().all(|hash| status.has_body(hash)));
    assert!(hashes[6..].iter().all(|hash| !status.has_body(hash)));
}

#[tokio::test]
async fn tampered_body_is_fetched_again_elsewhere() {
    let chain = ChainBuilder::regtest().extend(1, 0);
    let harness = Harness::start(&chain, settings(5, 4)).with_honest_peer(&chain);
    let tamperer = PeerId(0);
    harness.peers.add_peer(tamperer, PeerBehaviour::Tampered);
    harness.peers.announce(tamperer, chain.blocks());
    let hash = chain.hashes()[0];

    harness.request(&[hash], false).await;
    harness.drained().await;

    assert_eq!(harness.peers.requests_for(&hash), vec![tamperer, HONEST]);
    let response = harness
        .sync
        .handle(BlockRequestsCommand::GetBlock {
            hash,
            verbose: false,
        })
        .await;
    let BlockRequestsResponse::Block(auxblocks_common::commands::block_requests::BlockData::Raw {
        hex: raw,
        ..
    }) = response
    else {
        panic!("raw block expected");
    };
    assert_eq!(raw, hex::encode(chain.blocks()[0].as_bytes()));
}

#[tokio::test]
async fn empty_candidate_round_still_avoids_the_failed_peer() {
    let chain = ChainBuilder::regtest().extend(1, 0);
    let harness = Harness::start(&chain, settings(5, 4)).with_honest_peer(&chain);
    let flaky = PeerId(0);
    harness.peers.add_peer(flaky, PeerBehaviour::Disconnects);
    harness.peers.announce(flaky, chain.blocks());
    let hash = chain.hashes()[0];
    harness.peers.script_candidates(hash, vec![vec![flaky, HONEST], vec![]]);

    harness.request(&[hash], false).await;
    harness.drained().await;

    assert_eq!(harness.peers.requests_for(&hash), vec![flaky, HONEST]);
    assert!(harness.sync.status().has_body(&hash));
}
