//! The types module contains all of the types shared by the verification game, the proof
//! builder and the commit-reveal scheme.

use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The [TaskId] type is the ledger-assigned identifier of a posted task.
pub type TaskId = U256;

/// The [GameId] type is the identifier the dispute resolution layer assigns to a verification
/// game.
pub type GameId = H256;

/// The number of phase state hashes posted once the bisection has narrowed to a single step.
pub const PHASE_STATE_COUNT: usize = 13;

/// The [Phase] enum enumerates the judge-checkable sub-phases that a single execution step
/// decomposes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    Fetch = 0,
    Init = 1,
    Reg1 = 2,
    Reg2 = 3,
    Reg3 = 4,
    Alu = 5,
    Write1 = 6,
    Write2 = 7,
    Pc = 8,
    StackPtr = 9,
    CallPtr = 10,
    Memsize = 11,
}

impl Phase {
    /// All phases, in judge order.
    pub const ALL: [Phase; 12] = [
        Phase::Fetch,
        Phase::Init,
        Phase::Reg1,
        Phase::Reg2,
        Phase::Reg3,
        Phase::Alu,
        Phase::Write1,
        Phase::Write2,
        Phase::Pc,
        Phase::StackPtr,
        Phase::CallPtr,
        Phase::Memsize,
    ];

    /// Returns the key under which the interpreter reports this phase's proof in a step trace.
    pub fn key(&self) -> &'static str {
        match self {
            Phase::Fetch => "fetch",
            Phase::Init => "init",
            Phase::Reg1 => "reg1",
            Phase::Reg2 => "reg2",
            Phase::Reg3 => "reg3",
            Phase::Alu => "alu",
            Phase::Write1 => "write1",
            Phase::Write2 => "write2",
            Phase::Pc => "pc",
            Phase::StackPtr => "stack_ptr",
            Phase::CallPtr => "call_ptr",
            Phase::Memsize => "memsize",
        }
    }
}

impl TryFrom<u8> for Phase {
    type Error = GameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Phase::ALL
            .get(value as usize)
            .copied()
            .ok_or(GameError::UnknownPhase(value as u64))
    }
}

impl TryFrom<U256> for Phase {
    type Error = GameError;

    fn try_from(value: U256) -> Result<Self, Self::Error> {
        if value > U256::from(u8::MAX) {
            return Err(GameError::UnknownPhase(value.low_u64()));
        }
        Phase::try_from(value.low_u64() as u8)
    }
}

/// A [Response] is the action the solver takes after the [VerificationGame] has consumed an
/// event from the dispute resolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// The event carried nothing new (e.g. a redelivered query); do nothing.
    DoNothing,
    /// Report the state hash at `step` for the bracket `[low, high]`.
    Report { low: u64, high: u64, step: u64 },
    /// The bracket is a single step; post the phase states of step `low`.
    PostPhases { low: u64 },
    /// Submit the judge proof for `phase` of step `low`.
    Judge { low: u64, phase: Phase },
}

/// Errors raised by the verification game state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    /// A bracket that violates `0 <= low < high <= total_steps`.
    #[error("invalid bracket [{low}, {high}] for a game of {total} steps")]
    InvalidBracket { low: u64, high: u64, total: u64 },
    /// A query that is neither the outstanding bracket nor one of its halves.
    #[error("query [{low}, {high}] does not follow the previous bracket [{prev_low}, {prev_high}]")]
    OutOfOrderQuery {
        low: u64,
        high: u64,
        prev_low: u64,
        prev_high: u64,
    },
    /// A phase was selected for a step other than the one the phases were posted for.
    #[error("phase selected for step {got}, but phases were posted for step {expected}")]
    PhaseStepMismatch { expected: u64, got: u64 },
    /// An event that is not legal in the current state.
    #[error("event `{event}` is not valid while the game is {status:?}")]
    IllegalTransition {
        event: &'static str,
        status: super::GameStatus,
    },
    /// A phase number outside the phase table.
    #[error("unknown phase {0}")]
    UnknownPhase(u64),
    /// A game must dispute at least one step.
    #[error("a verification game needs at least one step")]
    EmptyGame,
}

/// Errors raised while building a judge proof from a step trace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    /// The step trace has no entry for the requested phase.
    #[error("step trace carries no proof for phase `{}`", .0.key())]
    MissingPhase(Phase),
    /// The step trace does not carry the expected number of phase states.
    #[error("step trace carries {0} phase states, expected {}", PHASE_STATE_COUNT)]
    PhaseStates(usize),
}
