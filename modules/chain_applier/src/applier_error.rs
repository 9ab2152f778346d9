//! Error types for fork-choice and block application.

use breakwater_common::{BlockId, Height, LedgerError, Score};

/// Errors returned by [`Applier`](crate::applier::Applier) operations.
///
/// Everything except `DoubleFault` is an ordinary result: the caller
/// decides whether to log-and-ignore (`UnknownParent`, `LowScore`),
/// retry with a smaller batch (`ReorgTooDeep`), or escalate
/// (`LedgerIo`). `DoubleFault` means the ledger matches neither the old
/// chain nor the new one and must reach top-level supervision.
#[derive(Debug, thiserror::Error)]
pub enum ApplierError {
    /// The batch's first block is already on the chain.
    #[error("block already exists: {id}")]
    AlreadyExists { id: BlockId },

    /// The batch's parent is unknown; the fork is not actionable yet.
    #[error("parent not found: {id}")]
    UnknownParent { id: BlockId },

    /// The candidate's cumulative score does not beat the incumbent's.
    /// Ties keep the incumbent.
    #[error("candidate score {candidate} does not exceed current score {current}")]
    LowScore { candidate: Score, current: Score },

    /// The fork point is deeper than the configured rollback bound.
    #[error("reorg depth {depth} exceeds max {max}")]
    ReorgTooDeep { depth: u64, max: u64 },

    /// A batch must contain at least one block.
    #[error("empty candidate batch")]
    EmptyBatch,

    /// The ledger failed outside the apply step; nothing was lost.
    #[error("ledger failure: {0}")]
    LedgerIo(#[from] LedgerError),

    /// Applying the candidate failed after rollback; the previous chain
    /// was restored.
    #[error("failed to apply candidate starting at {first}: {source}")]
    ApplyFailed {
        first: BlockId,
        #[source]
        source: LedgerError,
    },

    /// Applying the candidate failed and restoring the previous chain
    /// also failed. The ledger is stranded at the fork point with
    /// neither chain.
    #[error(
        "double fault: ledger stranded at height {parent_height}; \
         apply failed ({apply}), restore failed ({restore})"
    )]
    DoubleFault {
        parent_height: Height,
        apply: LedgerError,
        restore: LedgerError,
    },
}

impl ApplierError {
    /// True for errors that must propagate to top-level supervision and
    /// never be retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApplierError::DoubleFault { .. })
    }
}
