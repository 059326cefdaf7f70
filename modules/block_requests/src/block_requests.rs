//! Block requests Caryatid module
//!
//! Decouples block-body download from header acceptance. Headers arrive on
//! the header topic and become header-only block records; bodies are
//! fetched on request (or automatically) by a bounded worker pool, and a
//! body is only validated once its parent has been.

pub mod block_store;
pub mod block_sync;
pub mod bus;
pub mod chain_tips;
pub mod configuration;
pub mod fetch_worker;
pub mod request_queue;
pub mod status;
pub mod stores;
pub mod sync_error;
pub mod sync_observer;
pub mod validation_gate;

use std::sync::Arc;

use anyhow::Result;
use auxblocks_common::commands::block_requests::{BlockRequestsError, BlockRequestsResponse};
use auxblocks_common::messages::Message;
use auxblocks_common::{Block, BlockHeader};
use caryatid_sdk::{module, Context, Module};
use config::Config;
use tracing::{error, info, info_span, warn, Instrument};

pub use block_sync::{BlockSync, SyncSettings};
pub use chain_tips::HeaderAcceptance;
pub use fetch_worker::FetchSettings;
pub use status::StatusFacade;
pub use sync_error::BlockSyncError;
pub use sync_observer::{BlockSyncObserver, EventForwarder, NoOpObserver};

use crate::bus::{BusConsensusRules, BusPeerNetwork};
use crate::configuration::BlockRequestsConfig;

/// Block requests module
#[module(
    message_type(Message),
    name = "block-requests",
    description = "Deferred block body fetching and validation gating"
)]
pub struct BlockRequests;

impl BlockRequests {
    /// Async initialisation
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = BlockRequestsConfig::try_load(&config)?;
        info!(
            store = ?cfg.store,
            max_in_flight = cfg.max_in_flight,
            "Creating block requests on '{}'",
            cfg.command_topic
        );

        let genesis = Block::from_hex(&cfg.genesis_block)?;
        let backend = stores::open_store(&cfg)?;
        let peers = Arc::new(BusPeerNetwork::new(
            context.clone(),
            cfg.peer_network_topic.clone(),
        ));
        let rules = Arc::new(BusConsensusRules::new(
            context.clone(),
            cfg.validation_topic.clone(),
        ));
        let (forwarder, mut events) = EventForwarder::new();
        let sync = Arc::new(BlockSync::open(
            cfg.sync_settings(),
            genesis,
            backend,
            peers,
            rules,
            Arc::new(forwarder),
        )?);

        // Control commands
        let handler_sync = sync.clone();
        context.handle(&cfg.command_topic, move |message: Arc<Message>| {
            let sync = handler_sync.clone();
            async move {
                let response = match message.as_ref() {
                    Message::BlockRequests(command) => {
                        let span = info_span!("block_requests.command");
                        sync.handle(command.clone()).instrument(span).await
                    }
                    _ => BlockRequestsResponse::Error(BlockRequestsError::InvalidRequest {
                        message: "Invalid message for block-requests".to_string(),
                    }),
                };
                Arc::new(Message::BlockRequestsResponse(response))
            }
        });

        // Lifecycle events
        let publish_context = context.clone();
        let events_topic = cfg.events_topic.clone();
        context.run(async move {
            while let Some(event) = events.recv().await {
                let message = Arc::new(Message::BlockRequestsEvent(event));
                if let Err(e) = publish_context.message_bus.publish(&events_topic, message).await {
                    error!("Could not publish block requests event: {e:#}");
                }
            }
        });

        // Accepted headers, and the fetch worker alongside them
        let mut headers = context.subscribe(&cfg.header_topic).await?;
        context.run(async move {
            let worker = sync.start_fetching();
            loop {
                let Ok((_, message)) = headers.read().await else {
                    break;
                };
                let Message::Header(header) = message.as_ref() else {
                    error!("Unexpected message on header topic: {message:?}");
                    continue;
                };
                let header = match BlockHeader::from_bytes(&header.raw) {
                    Ok(header) => header,
                    Err(e) => {
                        error!("Undecodable header: {e}");
                        continue;
                    }
                };
                let hash = header.hash();
                if let Err(e) = sync.accept_header(header) {
                    warn!(%hash, "Header refused: {e}");
                }
            }
            worker.abort();
        });

        Ok(())
    }
}
