//! Peer network and consensus rules reached over the message bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use auxblocks_common::messages::Message;
use auxblocks_common::peers::{PeerNetworkRequest, PeerNetworkResponse};
use auxblocks_common::validation::ValidationRequest;
use auxblocks_common::{
    Block, BlockHash, BlockHeader, ConsensusRules, FetchError, PeerId, PeerNetwork,
    ValidationStatus,
};
use caryatid_sdk::Context;
use tracing::warn;

/// Peer layer served by another module on `topic`
pub struct BusPeerNetwork {
    context: Arc<Context<Message>>,
    topic: String,
}

impl BusPeerNetwork {
    pub fn new(context: Arc<Context<Message>>, topic: String) -> Self {
        Self { context, topic }
    }

    async fn request(&self, request: PeerNetworkRequest) -> Result<Arc<Message>> {
        let message = Arc::new(Message::PeerNetwork(request));
        self.context.message_bus.request(&self.topic, message).await
    }
}

fn candidates_from(message: &Message) -> Result<Vec<PeerId>> {
    match message {
        Message::PeerNetworkResponse(PeerNetworkResponse::Candidates(peers)) => Ok(peers.clone()),
        other => Err(anyhow!("Unexpected peer network response: {other:?}")),
    }
}

fn body_from(message: &Message, peer: PeerId) -> Result<Vec<u8>, FetchError> {
    match message {
        Message::PeerNetworkResponse(PeerNetworkResponse::Body(raw)) => Ok(raw.clone()),
        Message::PeerNetworkResponse(PeerNetworkResponse::Failed(error)) => Err(error.clone()),
        other => {
            warn!(%peer, "Unexpected peer network response: {other:?}");
            Err(FetchError::Disconnected(peer))
        }
    }
}

#[async_trait]
impl PeerNetwork for BusPeerNetwork {
    async fn candidates(&self, hash: &BlockHash) -> Vec<PeerId> {
        let response = self.request(PeerNetworkRequest::Candidates { hash: *hash }).await;
        match response.and_then(|message| candidates_from(&message)) {
            Ok(peers) => peers,
            Err(e) => {
                warn!(%hash, "Could not get candidate peers: {e:#}");
                Vec::new()
            }
        }
    }

    async fn fetch_body(
        &self,
        peer: PeerId,
        hash: &BlockHash,
        timeout: Duration,
    ) -> Result<Vec<u8>, FetchError> {
        let request = PeerNetworkRequest::FetchBody {
            peer,
            hash: *hash,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        match self.request(request).await {
            Ok(message) => body_from(&message, peer),
            Err(e) => {
                warn!(%peer, %hash, "Peer network request failed: {e:#}");
                Err(FetchError::PeerUnavailable)
            }
        }
    }
}

/// Consensus rules engine served by another module on `topic`
pub struct BusConsensusRules {
    context: Arc<Context<Message>>,
    topic: String,
}

impl BusConsensusRules {
    pub fn new(context: Arc<Context<Message>>, topic: String) -> Self {
        Self { context, topic }
    }
}

fn status_from(message: &Message) -> Result<ValidationStatus> {
    match message {
        Message::ValidationResponse(status) => Ok(status.clone()),
        other => Err(anyhow!("Unexpected validation response: {other:?}")),
    }
}

#[async_trait]
impl ConsensusRules for BusConsensusRules {
    async fn check(&self, block: &Block, parent: &BlockHeader) -> Result<ValidationStatus> {
        let request = Message::Validation(ValidationRequest {
            block: block.as_bytes().to_vec(),
            parent: parent.clone(),
        });
        let response = self.context.message_bus.request(&self.topic, Arc::new(request)).await?;
        status_from(&response)
    }
}
