//! Definition of Breakwater messages

// We don't use these messages in the breakwater_common crate itself
#![allow(dead_code)]

use crate::hash::BlockId;
use crate::score::Score;
use crate::types::{Block, Height};

// Caryatid core messages
use caryatid_module_clock::messages::ClockTickMessage;

/// Request the network layer should forward to a peer: the ordered,
/// newest-last sample of our recent block identifiers, so the peer can
/// locate the common point and answer with its own recent identifiers.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct GetBlockIdsMessage {
    /// Recent local identifiers, oldest first
    pub known: Vec<BlockId>,
}

/// Request the network layer should forward to a peer: fetch these blocks.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct GetBlocksMessage {
    /// Identifiers in chain order
    pub ids: Vec<BlockId>,
}

/// A peer answered an identifier request.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockIdsReceivedMessage {
    /// Peer tag, for logging only
    pub peer: String,

    /// The peer's recent identifiers, oldest first
    pub ids: Vec<BlockId>,
}

/// A peer delivered one raw block.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct RawBlockReceivedMessage {
    /// Peer tag, for logging only
    pub peer: String,

    /// Undecoded wire bytes; the identifier is derivable without decoding
    pub bytes: Vec<u8>,
}

/// An ordered, parent-linked batch of candidate blocks ready for the
/// fork-choice engine.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct CandidateBatchMessage {
    pub blocks: Vec<Block>,
}

/// A single block arrived outside batch sync (locally forged or relayed).
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockReceivedMessage {
    pub block: Block,
}

/// A block was committed to the ledger.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockAppliedMessage {
    pub height: Height,
    pub block: Block,
}

/// The chain was rolled back; everything above `to_height` is gone.
/// Always published before the replacement blocks.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct RolledBackMessage {
    pub to_height: Height,
}

/// The node's cumulative score changed; announce it to connected peers.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScoreUpdatedMessage {
    pub height: Height,
    pub score: Score,
}

/// Control messages for the local block producer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ProducerMessage {
    /// Stop any in-progress production before a commit
    Interrupt,

    /// Restart production against the new tip
    Reschedule { height: Height },
}

/// Read-only history queries served from local storage.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum HistoryQuery {
    /// Ordered identifiers after `after` (or from genesis when `None`),
    /// at most `limit` of them
    GetBlockIds { after: Option<BlockId>, limit: u64 },

    /// One raw block body
    GetBlock { id: BlockId },

    /// Several raw block bodies
    GetBlocks { ids: Vec<BlockId> },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum HistoryQueryResponse {
    BlockIds(Vec<BlockId>),
    Block(Option<Vec<u8>>),
    Blocks(Vec<Option<Vec<u8>>>),
    Error(String),
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()),                                    // Just so we have a simple default

    // Generic messages, get out of jail free cards
    String(String),                              // Simple string
    JSON(serde_json::Value),                     // JSON object

    // Caryatid standard messages
    Clock(ClockTickMessage),                     // Clock tick

    // Network collaborator messages
    GetBlockIds(GetBlockIdsMessage),             // Ask a peer for its recent ids
    GetBlocks(GetBlocksMessage),                 // Ask a peer for block bodies
    BlockIdsReceived(BlockIdsReceivedMessage),   // Peer's id list arrived
    RawBlockReceived(RawBlockReceivedMessage),   // Raw block arrived

    // Chain messages
    CandidateBatch(CandidateBatchMessage),       // Reassembled batch for the applier
    BlockReceived(BlockReceivedMessage),         // Single forged/relayed block
    BlockApplied(BlockAppliedMessage),           // Block committed
    RolledBack(RolledBackMessage),               // Chain suffix replaced
    ScoreUpdated(ScoreUpdatedMessage),           // Announce new score to peers
    Producer(ProducerMessage),                   // Local producer control

    // History queries
    HistoryQuery(HistoryQuery),
    HistoryQueryResponse(HistoryQueryResponse),
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<ClockTickMessage> for Message {
    fn from(msg: ClockTickMessage) -> Self {
        Message::Clock(msg)
    }
}

impl From<GetBlockIdsMessage> for Message {
    fn from(msg: GetBlockIdsMessage) -> Self {
        Message::GetBlockIds(msg)
    }
}

impl From<GetBlocksMessage> for Message {
    fn from(msg: GetBlocksMessage) -> Self {
        Message::GetBlocks(msg)
    }
}

impl From<BlockIdsReceivedMessage> for Message {
    fn from(msg: BlockIdsReceivedMessage) -> Self {
        Message::BlockIdsReceived(msg)
    }
}

impl From<RawBlockReceivedMessage> for Message {
    fn from(msg: RawBlockReceivedMessage) -> Self {
        Message::RawBlockReceived(msg)
    }
}

impl From<CandidateBatchMessage> for Message {
    fn from(msg: CandidateBatchMessage) -> Self {
        Message::CandidateBatch(msg)
    }
}

impl From<BlockReceivedMessage> for Message {
    fn from(msg: BlockReceivedMessage) -> Self {
        Message::BlockReceived(msg)
    }
}

impl From<BlockAppliedMessage> for Message {
    fn from(msg: BlockAppliedMessage) -> Self {
        Message::BlockApplied(msg)
    }
}

impl From<RolledBackMessage> for Message {
    fn from(msg: RolledBackMessage) -> Self {
        Message::RolledBack(msg)
    }
}

impl From<ScoreUpdatedMessage> for Message {
    fn from(msg: ScoreUpdatedMessage) -> Self {
        Message::ScoreUpdated(msg)
    }
}

impl From<ProducerMessage> for Message {
    fn from(msg: ProducerMessage) -> Self {
        Message::Producer(msg)
    }
}
