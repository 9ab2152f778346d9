//! Fork choice, block application and bounded rollback.
//!
//! Chain selection is by cumulative score: a candidate fork is adopted
//! iff its score strictly exceeds the incumbent's (ties keep the
//! incumbent — one comparison policy, applied everywhere). Adoption
//! rolls the chain back to the fork point, applies the candidate batch,
//! and restores the previous suffix if application fails. Rollback depth
//! is bounded.
//!
//! The applier holds no chain data of its own; every durable read and
//! write goes through the [`Ledger`] it owns. Callers must not run two
//! applications concurrently: the owning module drives one applier from
//! a single event loop.

use breakwater_common::{Block, Height, Ledger, LedgerError, Score};
use tracing::{debug, info, warn};

use crate::applier_error::ApplierError;
use crate::applier_observer::ApplierObserver;

/// Hard cap on the configurable rollback depth. A reorganization deeper
/// than this is treated as catastrophic and refused.
pub const MAX_ROLLBACK_DEPTH: u64 = 100;

/// Where a reorganization attempt ended.
///
/// The restore-on-failure flow is driven as an explicit state machine so
/// that every exit path is enumerable:
///
/// - `Idle` → rollback failed; the ledger is unchanged.
/// - `RolledBack` is never terminal: an apply attempt always follows.
/// - `Applied` → the candidate chain is committed.
/// - `Restored` → the candidate failed; the previous chain is back.
/// - `DoubleFault` → both failed; the ledger holds neither chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Idle,
    RolledBack,
    Applied,
    Restored,
    DoubleFault,
}

/// The fork-choice and rollback engine.
pub struct Applier<L: Ledger> {
    ledger: L,
    max_rollback_depth: u64,
    observer: Box<dyn ApplierObserver + Send>,
    last_phase: ApplyPhase,
}

/// The single comparison site for "does the candidate beat the incumbent".
/// Strictly greater: equal score never triggers a reorganization.
fn beats_current(candidate: &Score, current: &Score) -> bool {
    candidate > current
}

impl<L: Ledger> Applier<L> {
    /// Create an applier over the given ledger.
    ///
    /// `max_rollback_depth` is clamped to [`MAX_ROLLBACK_DEPTH`].
    pub fn new(
        ledger: L,
        max_rollback_depth: u64,
        observer: Box<dyn ApplierObserver + Send>,
    ) -> Self {
        let clamped = max_rollback_depth.min(MAX_ROLLBACK_DEPTH);
        if clamped != max_rollback_depth {
            warn!(
                requested = max_rollback_depth,
                clamped, "rollback depth capped"
            );
        }
        Self {
            ledger,
            max_rollback_depth: clamped,
            observer,
            last_phase: ApplyPhase::Idle,
        }
    }

    /// Read access to the owned ledger.
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Where the most recent `apply` ended. Terminal phases only.
    pub fn last_phase(&self) -> ApplyPhase {
        self.last_phase
    }

    /// Apply a candidate batch extending some known ancestor.
    ///
    /// Returns the new tip and its height. The batch must be non-empty
    /// and parent-linked; its first block's parent determines the fork
    /// point.
    pub fn apply(&mut self, batch: &[Block]) -> Result<(Block, Height), ApplierError> {
        self.last_phase = ApplyPhase::Idle;

        let first = batch.first().ok_or(ApplierError::EmptyBatch)?;

        // A batch whose head we already have brings nothing new
        if self.ledger.id_to_height(&first.id)?.is_some() {
            return Err(ApplierError::AlreadyExists { id: first.id });
        }

        // An unknown parent is not fatal: the fork is simply not
        // actionable until the gap is filled
        let parent_height = self
            .ledger
            .id_to_height(&first.parent)?
            .ok_or(ApplierError::UnknownParent { id: first.parent })?;

        let mut candidate_score = self.ledger.score_at_height(parent_height)?;
        for block in batch {
            candidate_score += block.score();
        }

        let current_height = self.ledger.height()?;
        let current_score = self.ledger.score_at_height(current_height)?;
        if !beats_current(&candidate_score, &current_score) {
            return Err(ApplierError::LowScore {
                candidate: candidate_score,
                current: current_score,
            });
        }

        let new_height = parent_height + batch.len() as Height;

        // Fast path: the batch extends the tip, nothing to unwind
        if parent_height == current_height {
            let tip = self.ledger.apply_blocks(batch).map_err(|source| ApplierError::ApplyFailed {
                first: first.id,
                source,
            })?;
            self.last_phase = ApplyPhase::Applied;
            debug!(height = new_height, tip = %tip.id, "chain extended");
            return Ok((tip, new_height));
        }

        let depth = current_height - parent_height;
        if depth > self.max_rollback_depth {
            return Err(ApplierError::ReorgTooDeep {
                depth,
                max: self.max_rollback_depth,
            });
        }

        // Snapshot the suffix we are about to discard, in height order,
        // before anything is mutated
        let mut backup = Vec::with_capacity(depth as usize);
        for h in (parent_height + 1)..=current_height {
            let block = self
                .ledger
                .block_by_height(h)?
                .ok_or(LedgerError::UnknownHeight(h))?;
            backup.push(block);
        }

        info!(
            depth,
            fork_point = parent_height,
            candidate = %first.id,
            "adopting higher-score fork"
        );

        let (phase, outcome) = self.reorg(parent_height, &backup, batch);
        self.last_phase = phase;
        let tip = outcome?;
        Ok((tip, new_height))
    }

    /// Steps of a reorganization, with one terminal phase per exit path.
    fn reorg(
        &mut self,
        parent_height: Height,
        backup: &[Block],
        batch: &[Block],
    ) -> (ApplyPhase, Result<Block, ApplierError>) {
        // Idle -> rollback. On failure the ledger made no partial change
        // (collaborator contract), so nothing has been lost yet.
        if let Err(e) = self.ledger.rollback_to_height(parent_height) {
            return (ApplyPhase::Idle, Err(e.into()));
        }

        // RolledBack -> apply the candidate.
        let apply_err = match self.ledger.apply_blocks(batch) {
            Ok(tip) => return (ApplyPhase::Applied, Ok(tip)),
            Err(e) => e,
        };

        // Apply failed: put the previous suffix back.
        match self.ledger.apply_blocks(backup) {
            Ok(_) => {
                warn!(
                    candidate = %batch[0].id,
                    "candidate apply failed, previous chain restored: {apply_err}"
                );
                (
                    ApplyPhase::Restored,
                    Err(ApplierError::ApplyFailed {
                        first: batch[0].id,
                        source: apply_err,
                    }),
                )
            }
            Err(restore_err) => (
                ApplyPhase::DoubleFault,
                Err(ApplierError::DoubleFault {
                    parent_height,
                    apply: apply_err,
                    restore: restore_err,
                }),
            ),
        }
    }

    /// Single-block variant with the surrounding node's side effects:
    /// interrupts local production before the commit and announces the
    /// new score after it. Control flow is otherwise identical to
    /// [`apply`](Self::apply) with a depth-1 batch.
    pub fn apply_block(&mut self, block: &Block) -> Result<(Block, Height), ApplierError> {
        self.observer.production_interrupt();
        let (tip, height) = self.apply(std::slice::from_ref(block))?;
        let score = self.ledger.score_at_height(height)?;
        self.observer.score_updated(height, &score);
        Ok((tip, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier_observer::NoOpObserver;
    use breakwater_common::{BlockId, MemoryLedger};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Ledger double that can fail a configurable number of
    /// `apply_blocks` calls and counts rollbacks.
    struct FlakyLedger {
        inner: MemoryLedger,
        fail_applies: u32,
        rollback_calls: Arc<AtomicU32>,
    }

    impl FlakyLedger {
        fn new(inner: MemoryLedger) -> Self {
            Self {
                inner,
                fail_applies: 0,
                rollback_calls: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl Ledger for FlakyLedger {
        fn height(&self) -> Result<Height, LedgerError> {
            self.inner.height()
        }
        fn block(&self, id: &BlockId) -> Result<Option<Block>, LedgerError> {
            self.inner.block(id)
        }
        fn block_by_height(&self, height: Height) -> Result<Option<Block>, LedgerError> {
            self.inner.block_by_height(height)
        }
        fn id_to_height(&self, id: &BlockId) -> Result<Option<Height>, LedgerError> {
            self.inner.id_to_height(id)
        }
        fn score_at_height(&self, height: Height) -> Result<Score, LedgerError> {
            self.inner.score_at_height(height)
        }
        fn apply_blocks(&mut self, batch: &[Block]) -> Result<Block, LedgerError> {
            if self.fail_applies > 0 {
                self.fail_applies -= 1;
                return Err(LedgerError::Io("injected apply failure".into()));
            }
            self.inner.apply_blocks(batch)
        }
        fn rollback_to_height(&mut self, height: Height) -> Result<(), LedgerError> {
            self.rollback_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.rollback_to_height(height)
        }
    }

    /// Observer double recording event order.
    struct TestObserver {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl ApplierObserver for TestObserver {
        fn production_interrupt(&self) {
            self.events.lock().unwrap().push("interrupt".into());
        }
        fn score_updated(&self, height: Height, _score: &Score) {
            self.events.lock().unwrap().push(format!("score@{height}"));
        }
    }

    fn child(parent: &Block, base_target: u64, timestamp: u64) -> Block {
        Block::new(parent.id, base_target, timestamp, vec![], vec![]).unwrap()
    }

    /// Ledger: genesis -> b1 (base target 2^32).
    fn two_block_ledger() -> (MemoryLedger, Block) {
        let mut ledger = MemoryLedger::new();
        let b1 = child(ledger.tip(), 1 << 32, 1);
        ledger.apply_blocks(std::slice::from_ref(&b1)).unwrap();
        (ledger, b1)
    }

    fn applier(ledger: MemoryLedger) -> Applier<FlakyLedger> {
        Applier::new(FlakyLedger::new(ledger), MAX_ROLLBACK_DEPTH, Box::new(NoOpObserver))
    }

    #[test]
    fn extends_the_tip_without_rollback() {
        let (ledger, b1) = two_block_ledger();
        let mut applier = applier(ledger);

        let b2 = child(&b1, 1 << 32, 2);
        let (tip, height) = applier.apply(std::slice::from_ref(&b2)).unwrap();

        assert_eq!(tip.id, b2.id);
        assert_eq!(height, 2);
        assert_eq!(applier.last_phase(), ApplyPhase::Applied);
        assert_eq!(applier.ledger().rollback_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rejects_empty_batch() {
        let (ledger, _) = two_block_ledger();
        let mut applier = applier(ledger);
        assert!(matches!(applier.apply(&[]), Err(ApplierError::EmptyBatch)));
    }

    #[test]
    fn rejects_known_block() {
        let (ledger, b1) = two_block_ledger();
        let mut applier = applier(ledger);

        let err = applier.apply(std::slice::from_ref(&b1)).unwrap_err();
        assert!(matches!(err, ApplierError::AlreadyExists { id } if id == b1.id));
    }

    #[test]
    fn rejects_unknown_parent() {
        let (ledger, _) = two_block_ledger();
        let mut applier = applier(ledger);

        let orphan = Block::new(BlockId::new([9; 32]), 1000, 5, vec![], vec![]).unwrap();
        let err = applier.apply(std::slice::from_ref(&orphan)).unwrap_err();
        assert!(matches!(err, ApplierError::UnknownParent { .. }));
        assert_eq!(applier.ledger().height().unwrap(), 1);
    }

    #[test]
    fn low_score_leaves_chain_unchanged() {
        let (ledger, b1) = two_block_ledger();
        let genesis = ledger.block_by_height(0).unwrap().unwrap();
        let mut applier = applier(ledger);

        // Same base target as b1: equal score, and ties keep the incumbent
        let rival = child(&genesis, 1 << 32, 9);
        let err = applier.apply(std::slice::from_ref(&rival)).unwrap_err();
        assert!(matches!(err, ApplierError::LowScore { .. }));
        assert_eq!(applier.ledger().height().unwrap(), 1);
        assert_eq!(applier.ledger().block_by_height(1).unwrap().unwrap().id, b1.id);
        assert_eq!(applier.ledger().rollback_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn adopts_higher_score_fork_with_rollback() {
        // The reference scenario: chain G -> B1; candidate [B2] with
        // parent G and a higher score contribution wins, B1 is replaced
        let (ledger, b1) = two_block_ledger();
        let genesis = ledger.block_by_height(0).unwrap().unwrap();
        let mut applier = applier(ledger);

        let b2 = child(&genesis, 1 << 31, 9); // double the contribution of b1
        let (tip, height) = applier.apply(std::slice::from_ref(&b2)).unwrap();

        assert_eq!(tip.id, b2.id);
        assert_eq!(height, 1);
        assert_eq!(applier.last_phase(), ApplyPhase::Applied);
        assert_eq!(applier.ledger().rollback_calls.load(Ordering::SeqCst), 1);
        assert_eq!(applier.ledger().id_to_height(&b1.id).unwrap(), None);
    }

    #[test]
    fn reorg_deeper_than_bound_is_refused_without_rollback() {
        let mut ledger = MemoryLedger::new();
        let mut blocks = vec![];
        for i in 0..4u64 {
            let parent = ledger.tip().clone();
            let b = child(&parent, 1 << 32, i + 1);
            ledger.apply_blocks(std::slice::from_ref(&b)).unwrap();
            blocks.push(b);
        }
        let genesis = ledger.block_by_height(0).unwrap().unwrap();

        let mut applier =
            Applier::new(FlakyLedger::new(ledger), 2, Box::new(NoOpObserver));

        // Fork from genesis: depth 4 > max 2, despite the huge score
        let rival = child(&genesis, 1, 99);
        let err = applier.apply(std::slice::from_ref(&rival)).unwrap_err();
        assert!(matches!(err, ApplierError::ReorgTooDeep { depth: 4, max: 2 }));
        assert_eq!(applier.ledger().rollback_calls.load(Ordering::SeqCst), 0);
        assert_eq!(applier.ledger().height().unwrap(), 4);
    }

    #[test]
    fn rollback_depth_is_capped() {
        let applier =
            Applier::new(FlakyLedger::new(MemoryLedger::new()), 10_000, Box::new(NoOpObserver));
        assert_eq!(applier.max_rollback_depth, MAX_ROLLBACK_DEPTH);
    }

    #[test]
    fn failed_apply_restores_previous_chain() {
        let (ledger, b1) = two_block_ledger();
        let genesis = ledger.block_by_height(0).unwrap().unwrap();
        let mut flaky = FlakyLedger::new(ledger);
        flaky.fail_applies = 1; // the candidate apply fails, the restore succeeds
        let mut applier = Applier::new(flaky, MAX_ROLLBACK_DEPTH, Box::new(NoOpObserver));

        let b2 = child(&genesis, 1 << 31, 9);
        let err = applier.apply(std::slice::from_ref(&b2)).unwrap_err();

        assert!(matches!(err, ApplierError::ApplyFailed { first, .. } if first == b2.id));
        assert!(!err.is_fatal());
        assert_eq!(applier.last_phase(), ApplyPhase::Restored);
        // Height and tip are exactly as before the call
        assert_eq!(applier.ledger().height().unwrap(), 1);
        assert_eq!(applier.ledger().block_by_height(1).unwrap().unwrap().id, b1.id);
    }

    #[test]
    fn double_fault_is_distinct_and_fatal() {
        let (ledger, _) = two_block_ledger();
        let genesis = ledger.block_by_height(0).unwrap().unwrap();
        let mut flaky = FlakyLedger::new(ledger);
        flaky.fail_applies = 2; // candidate apply AND restore both fail
        let mut applier = Applier::new(flaky, MAX_ROLLBACK_DEPTH, Box::new(NoOpObserver));

        let b2 = child(&genesis, 1 << 31, 9);
        let err = applier.apply(std::slice::from_ref(&b2)).unwrap_err();

        assert!(matches!(err, ApplierError::DoubleFault { parent_height: 0, .. }));
        assert!(err.is_fatal());
        assert_eq!(applier.last_phase(), ApplyPhase::DoubleFault);
        // The ledger is stranded at the fork point with neither chain
        assert_eq!(applier.ledger().height().unwrap(), 0);
    }

    #[test]
    fn failed_rollback_propagates_and_loses_nothing() {
        struct StubbornLedger(MemoryLedger);
        impl Ledger for StubbornLedger {
            fn height(&self) -> Result<Height, LedgerError> {
                self.0.height()
            }
            fn block(&self, id: &BlockId) -> Result<Option<Block>, LedgerError> {
                self.0.block(id)
            }
            fn block_by_height(&self, h: Height) -> Result<Option<Block>, LedgerError> {
                self.0.block_by_height(h)
            }
            fn id_to_height(&self, id: &BlockId) -> Result<Option<Height>, LedgerError> {
                self.0.id_to_height(id)
            }
            fn score_at_height(&self, h: Height) -> Result<Score, LedgerError> {
                self.0.score_at_height(h)
            }
            fn apply_blocks(&mut self, batch: &[Block]) -> Result<Block, LedgerError> {
                self.0.apply_blocks(batch)
            }
            fn rollback_to_height(&mut self, _: Height) -> Result<(), LedgerError> {
                Err(LedgerError::Io("rollback refused".into()))
            }
        }

        let (ledger, b1) = two_block_ledger();
        let genesis = ledger.block_by_height(0).unwrap().unwrap();
        let mut applier =
            Applier::new(StubbornLedger(ledger), MAX_ROLLBACK_DEPTH, Box::new(NoOpObserver));

        let b2 = child(&genesis, 1 << 31, 9);
        let err = applier.apply(std::slice::from_ref(&b2)).unwrap_err();
        assert!(matches!(err, ApplierError::LedgerIo(_)));
        assert_eq!(applier.last_phase(), ApplyPhase::Idle);
        assert_eq!(applier.ledger().height().unwrap(), 1);
        assert_eq!(applier.ledger().block_by_height(1).unwrap().unwrap().id, b1.id);
    }

    #[test]
    fn multi_block_batch_lands_at_parent_plus_len() {
        let (ledger, b1) = two_block_ledger();
        let mut applier = applier(ledger);

        let b2 = child(&b1, 1 << 32, 2);
        let b3 = child(&b2, 1 << 32, 3);
        let (tip, height) = applier.apply(&[b2, b3.clone()]).unwrap();
        assert_eq!(tip.id, b3.id);
        assert_eq!(height, 3);
    }

    #[test]
    fn single_block_variant_fires_observers_in_order() {
        let (ledger, b1) = two_block_ledger();
        let events = Arc::new(Mutex::new(Vec::new()));
        let observer = Box::new(TestObserver {
            events: events.clone(),
        });
        let mut applier = Applier::new(FlakyLedger::new(ledger), MAX_ROLLBACK_DEPTH, observer);

        let b2 = child(&b1, 1 << 32, 2);
        applier.apply_block(&b2).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.as_slice(), ["interrupt", "score@2"]);
    }

    #[test]
    fn single_block_variant_skips_score_broadcast_on_failure() {
        let (ledger, _) = two_block_ledger();
        let genesis = ledger.block_by_height(0).unwrap().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let observer = Box::new(TestObserver {
            events: events.clone(),
        });
        let mut applier = Applier::new(FlakyLedger::new(ledger), MAX_ROLLBACK_DEPTH, observer);

        // Equal-score rival: rejected
        let rival = child(&genesis, 1 << 32, 9);
        assert!(applier.apply_block(&rival).is_err());

        let events = events.lock().unwrap();
        assert_eq!(events.as_slice(), ["interrupt"]);
    }
}
