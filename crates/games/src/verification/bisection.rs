//! The bisection module holds the midpoint rule and the [Bracket] of steps still in dispute.

use super::GameError;

/// Computes the step both parties report on for the bracket `[low, high]`.
/// The dispute resolution layer checks reported indices against this exact formula, so the
/// division must floor.
///
/// ### Takes
/// - `low`: The lower bound of the bracket.
/// - `high`: The upper bound of the bracket.
///
/// ### Returns
/// - `u64`: `low + floor((high - low) / 2)`.
pub fn midpoint(low: u64, high: u64) -> u64 {
    low + (high - low) / 2
}

/// A [Bracket] is the closed interval of step indices that the solver and the challenger still
/// disagree on. Brackets are only ever built with `low < high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bracket {
    pub low: u64,
    pub high: u64,
}

impl Bracket {
    /// Creates a new [Bracket], checking `0 <= low < high <= total`.
    pub fn new(low: u64, high: u64, total: u64) -> Result<Self, GameError> {
        if low >= high || high > total {
            return Err(GameError::InvalidBracket { low, high, total });
        }
        Ok(Self { low, high })
    }

    /// Returns the step to report on for this bracket.
    pub fn midpoint(&self) -> u64 {
        midpoint(self.low, self.high)
    }

    /// Returns the number of steps spanned by the bracket.
    pub fn width(&self) -> u64 {
        self.high - self.low
    }

    /// Returns true once the disagreement has narrowed to a single step.
    pub fn is_final(&self) -> bool {
        self.low + 1 == self.high
    }

    /// Returns the lower half `[low, mid]`.
    pub fn lower(&self) -> Self {
        Self {
            low: self.low,
            high: self.midpoint(),
        }
    }

    /// Returns the upper half `[mid, high]`.
    pub fn upper(&self) -> Self {
        Self {
            low: self.midpoint(),
            high: self.high,
        }
    }

    /// Returns true if `other` is one of the two halves the challenger may pick after a report
    /// on this bracket.
    pub fn is_half(&self, other: &Bracket) -> bool {
        !self.is_final() && (*other == self.lower() || *other == self.upper())
    }
}
