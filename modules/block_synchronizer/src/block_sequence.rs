//! Sync window tracker: which identifiers one round requested from a
//! peer, and which blocks have come back.
//!
//! Single writer per round: the orchestrator owns one instance
//! exclusively, so no internal locking. Do not share an instance across
//! tasks without external synchronization.

use breakwater_common::{Block, BlockId};
use std::collections::{HashMap, HashSet};

/// One in-flight sync window.
///
/// Three parallel views of the same window: the requested order (order
/// significant), a membership set over the same identifiers, and the
/// blocks received so far. Every key in the received map is also a
/// member — blocks that were never requested are rejected.
pub struct BlockSequence {
    capacity: usize,
    requested: Vec<BlockId>,
    members: HashSet<BlockId>,
    received: HashMap<BlockId, Block>,
}

impl BlockSequence {
    /// An empty window with the given fixed capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            requested: Vec::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            received: HashMap::with_capacity(capacity),
        }
    }

    /// Append an identifier to the window while building the request.
    ///
    /// Returns false, without changing anything, if the window is at
    /// capacity or the identifier is already a member.
    pub fn push_id(&mut self, id: BlockId) -> bool {
        if self.requested.len() >= self.capacity || self.members.contains(&id) {
            return false;
        }
        self.requested.push(id);
        self.members.insert(id);
        true
    }

    /// Was this identifier requested in the current window?
    pub fn requested(&self, id: &BlockId) -> bool {
        self.members.contains(id)
    }

    /// The requested identifiers, in request order.
    pub fn ids(&self) -> &[BlockId] {
        &self.requested
    }

    /// Store a received block, only if its identifier was requested.
    /// Returns false for unsolicited blocks.
    pub fn put_block(&mut self, block: Block) -> bool {
        if !self.members.contains(&block.id) {
            return false;
        }
        self.received.insert(block.id, block);
        true
    }

    /// The longest gap-free prefix of received blocks, in request order.
    ///
    /// Stops at the first identifier with no stored block; intentionally
    /// partial, callers must not assume completeness.
    pub fn blocks(&self) -> Vec<Block> {
        let mut out = Vec::with_capacity(self.received.len());
        for id in &self.requested {
            match self.received.get(id) {
                Some(block) => out.push(block.clone()),
                None => break,
            }
        }
        out
    }

    /// True iff every requested block has been received.
    pub fn is_full(&self) -> bool {
        self.received.len() == self.requested.len()
    }

    /// True iff nothing has been requested yet this round.
    pub fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }

    /// Clear all three views back to empty, keeping the capacity, for
    /// reuse on the next round.
    pub fn reset(&mut self) {
        self.requested.clear();
        self.members.clear();
        self.received.clear();
    }
}

/// Given two identifier sequences in chain order, return the portion of
/// `second` strictly after its overlap with `first` — the identifiers
/// that are new relative to what is already known — and whether any
/// overlap was found at all.
///
/// `intersects == false` means the sequences share no common point, so
/// sync cannot proceed incrementally and the caller must fall back to a
/// deeper request.
pub fn relative_complement(first: &[BlockId], second: &[BlockId]) -> (Vec<BlockId>, bool) {
    let known: HashSet<&BlockId> = first.iter().collect();

    // Chain order means the overlap is a prefix of `second`
    let overlap = second.iter().take_while(|id| known.contains(id)).count();
    (second[overlap..].to_vec(), overlap > 0)
}
