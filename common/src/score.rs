//! Chain score arithmetic.
//!
//! The cumulative score is an arbitrary-precision non-negative integer,
//! monotonically non-decreasing along a chain. Each block contributes
//! `2^64 / base_target`; the chain's score at a height is the sum of the
//! contributions of every block up to and including that height.

use dashu_int::UBig;

/// Arbitrary-precision cumulative chain score.
pub type Score = UBig;

/// The score contribution of a single block.
///
/// This is the consensus-supplied pure function: a lower base target means
/// the generator committed more stake, so the block weighs more. The
/// base target is validated non-zero when the block is decoded; a zero
/// here yields a zero contribution rather than a panic.
pub fn block_score(base_target: u64) -> Score {
    if base_target == 0 {
        return UBig::ZERO;
    }
    (UBig::ONE << 64usize) / UBig::from(base_target)
}
