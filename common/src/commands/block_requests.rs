//! Control surface of the block requests module: commands, their
//! responses and the events it publishes.

use crate::hash::BlockHash;
use crate::validation::ValidationError;

/// Per-request options. Unknown fields are rejected rather than ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestOptions {
    /// Run contextual validation as soon as each body arrives
    #[serde(default)]
    pub validate: bool,
}

fn verbose_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum BlockRequestsCommand {
    /// Enqueue body fetches for known headers
    Start {
        hashes: Vec<BlockHash>,
        #[serde(default)]
        options: RequestOptions,
    },

    /// Number of outstanding requests
    Status,

    GetBlock {
        hash: BlockHash,
        #[serde(default = "verbose_default")]
        verbose: bool,
    },

    GetHeader {
        hash: BlockHash,
        #[serde(default = "verbose_default")]
        verbose: bool,
    },

    ListTips,

    /// Validate a body that was downloaded without validate-on-arrival
    Validate { hash: BlockHash },

    /// Turn fetching of every new header's body on or off
    SetAutoRequest { enabled: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockRequestsResponse {
    Started(EnqueueSummary),
    Status(RequestStatus),
    Block(BlockData),
    Header(HeaderData),
    Tips(Vec<ChainTipInfo>),
    Validation(ValidationOutcome),
    AutoRequest { enabled: bool },
    Error(BlockRequestsError),
}

/// What an enqueue did with each hash it was given
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EnqueueSummary {
    /// New queue entries
    pub enqueued: usize,

    /// Already queued; validate flag merged into the existing entry
    pub merged: usize,

    /// Body already present
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RequestStatus {
    /// Requests queued or in flight
    pub request_present: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TipStatus {
    /// Best fully validated chain
    Active,

    /// Fully validated, but not the best chain
    ValidFork,

    /// All bodies present, some not validated
    ValidHeaders,

    /// Some bodies missing
    HeadersOnly,

    /// Contains a block that failed validation
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChainTipInfo {
    pub hash: BlockHash,
    pub height: u64,

    /// Distance to the fork point with the active chain
    pub branch_len: u64,
    pub status: TipStatus,
}

/// Why a block ended in the failed state
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// Body fetch gave up after the retry limit
    FetchAbandoned,

    /// Body present but the block is invalid
    Invalid(ValidationError),
}

/// Where a block stands between header acceptance and validation
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchState {
    NotRequested,
    Queued,
    InFlight,
    Available,
    Validated,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HeaderView {
    pub hash: BlockHash,
    pub height: u64,
    pub version: i32,
    pub previous_block_hash: Option<BlockHash>,
    pub merkle_root: BlockHash,
    pub time: u32,
    pub bits: String,
    pub nonce: u32,

    /// Cumulative work, big-endian hex
    pub chain_work: String,
    pub has_body: bool,
    pub validated: bool,
    pub fetch_state: FetchState,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockView {
    #[serde(flatten)]
    pub header: HeaderView,
    pub size: usize,
    pub n_tx: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderData {
    Verbose(HeaderView),
    Raw { hex: String, validated: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockData {
    Verbose(BlockView),
    Raw { hex: String, validated: bool },
}

impl BlockData {
    pub fn validated(&self) -> bool {
        match self {
            BlockData::Verbose(view) => view.header.validated,
            BlockData::Raw { validated, .. } => *validated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationOutcome {
    Validated,
    AlreadyValidated,

    /// Parent not validated yet; runs when it is
    Deferred { waiting_on: BlockHash },
    Rejected(ValidationError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "error", rename_all = "kebab-case")]
pub enum BlockRequestsError {
    #[error("no header known for block {hash}")]
    UnknownHash { hash: BlockHash },

    #[error("block {hash} not found")]
    NotFound { hash: BlockHash },

    #[error("block {hash} not available")]
    NotAvailable { hash: BlockHash },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Lifecycle events published by the block requests module
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockRequestsEvent {
    BodyStored { hash: BlockHash, height: u64 },
    BlockValidated { hash: BlockHash, height: u64 },
    BlockRejected { hash: BlockHash, height: u64, error: ValidationError },
    FetchAbandoned { hash: BlockHash, attempts: u32 },
    ActiveTipChanged { hash: BlockHash, height: u64 },
}
