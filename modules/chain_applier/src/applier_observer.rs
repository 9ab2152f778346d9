//! Observer trait for single-block application side effects.

use breakwater_common::{Height, Score};

/// Callback receiver for the side effects of applying a single block.
///
/// These belong to the surrounding node, not to fork choice itself:
/// the owning module implements this trait to interrupt local block
/// production before a commit and to announce the new score to peers
/// after one.
pub trait ApplierObserver {
    /// Called before a single-block commit is attempted.
    ///
    /// Any in-progress local block production should stop.
    fn production_interrupt(&self);

    /// Called after a successful single-block commit.
    ///
    /// `score` is the chain's new cumulative score at `height`.
    fn score_updated(&self, height: Height, score: &Score);
}

/// Observer that ignores every event.
pub struct NoOpObserver;

impl ApplierObserver for NoOpObserver {
    fn production_interrupt(&self) {}
    fn score_updated(&self, _: Height, _: &Score) {}
}
