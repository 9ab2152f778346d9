//! The ledger collaborator contract, and a volatile in-memory implementation.
//!
//! The fork-choice engine never holds chain data of its own; everything
//! durable lives behind this trait. `apply_blocks` and
//! `rollback_to_height` are all-or-nothing: on failure the ledger must be
//! left exactly as it was.

use crate::hash::BlockId;
use crate::score::Score;
use crate::types::{Block, Height};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger i/o failure: {0}")]
    Io(String),

    #[error("no block at height {0}")]
    UnknownHeight(Height),

    #[error("batch does not extend the chain: expected parent {expected}, got {got}")]
    Detached { expected: BlockId, got: BlockId },

    #[error("rollback target {target} is beyond the tip at {tip}")]
    BadRollbackTarget { target: Height, tip: Height },
}

/// Height-indexed view of the chain, consumed by the applier and the
/// history responder.
pub trait Ledger: Send {
    /// Height of the current tip.
    fn height(&self) -> Result<Height, LedgerError>;

    /// Look a block up by identifier. `None` means not on the chain.
    fn block(&self, id: &BlockId) -> Result<Option<Block>, LedgerError>;

    /// Look a block up by height.
    fn block_by_height(&self, height: Height) -> Result<Option<Block>, LedgerError>;

    /// Height of the block with the given identifier, if present.
    fn id_to_height(&self, id: &BlockId) -> Result<Option<Height>, LedgerError>;

    /// Cumulative score of the chain up to and including `height`.
    fn score_at_height(&self, height: Height) -> Result<Score, LedgerError>;

    /// Append a parent-linked batch on top of the tip. Atomic: either the
    /// whole batch is applied and the new tip returned, or nothing changed.
    fn apply_blocks(&mut self, batch: &[Block]) -> Result<Block, LedgerError>;

    /// Drop every block above `height`. Atomic.
    fn rollback_to_height(&mut self, height: Height) -> Result<(), LedgerError>;
}

/// In-memory ledger holding the volatile chain, used until a persistent
/// state engine is wired in, and by the test suites.
pub struct MemoryLedger {
    /// `(block, cumulative score)` per height; index 0 is genesis
    chain: Vec<(Block, Score)>,
    /// Identifier to height index
    index: HashMap<BlockId, Height>,
}

impl MemoryLedger {
    /// Ledger containing only the standard genesis block.
    pub fn new() -> Self {
        Self::with_genesis(Block::genesis())
    }

    /// Ledger containing only the given genesis block.
    pub fn with_genesis(genesis: Block) -> Self {
        let score = genesis.score();
        let mut index = HashMap::new();
        index.insert(genesis.id, 0);
        Self {
            chain: vec![(genesis, score)],
            index,
        }
    }

    /// The current tip block.
    pub fn tip(&self) -> &Block {
        // chain is never empty: genesis cannot be rolled back
        &self.chain[self.chain.len() - 1].0
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger for MemoryLedger {
    fn height(&self) -> Result<Height, LedgerError> {
        Ok((self.chain.len() - 1) as Height)
    }

    fn block(&self, id: &BlockId) -> Result<Option<Block>, LedgerError> {
        Ok(self.index.get(id).map(|h| self.chain[*h as usize].0.clone()))
    }

    fn block_by_height(&self, height: Height) -> Result<Option<Block>, LedgerError> {
        Ok(self.chain.get(height as usize).map(|(b, _)| b.clone()))
    }

    fn id_to_height(&self, id: &BlockId) -> Result<Option<Height>, LedgerError> {
        Ok(self.index.get(id).copied())
    }

    fn score_at_height(&self, height: Height) -> Result<Score, LedgerError> {
        self.chain
            .get(height as usize)
            .map(|(_, s)| s.clone())
            .ok_or(LedgerError::UnknownHeight(height))
    }

    fn apply_blocks(&mut self, batch: &[Block]) -> Result<Block, LedgerError> {
        let Some(first) = batch.first() else {
            return Err(LedgerError::Io("empty batch".into()));
        };

        // Validate the whole batch before touching anything, so a failure
        // leaves the chain untouched
        let tip_id = self.tip().id;
        if first.parent != tip_id {
            return Err(LedgerError::Detached {
                expected: tip_id,
                got: first.parent,
            });
        }
        let mut prev = first.id;
        for block in &batch[1..] {
            if block.parent != prev {
                return Err(LedgerError::Detached {
                    expected: prev,
                    got: block.parent,
                });
            }
            prev = block.id;
        }

        for block in batch {
            let score = self.chain[self.chain.len() - 1].1.clone() + block.score();
            self.index.insert(block.id, self.chain.len() as Height);
            self.chain.push((block.clone(), score));
        }
        Ok(self.tip().clone())
    }

    fn rollback_to_height(&mut self, height: Height) -> Result<(), LedgerError> {
        let tip = self.height()?;
        if height > tip {
            return Err(LedgerError::BadRollbackTarget {
                target: height,
                tip,
            });
        }
        for (block, _) in self.chain.drain((height as usize + 1)..) {
            self.index.remove(&block.id);
        }
        Ok(())
    }
}
