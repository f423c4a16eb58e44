//! The `error` module contains the error taxonomy of the solver.

use crate::types::{GameId, TaskId};
use std::fmt;
use thiserror::Error;

/// Errors returned by the [Ledger](crate::Ledger) collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The call may succeed if retried: the connection dropped, the node timed out, the
    /// transaction was dropped from the mempool.
    #[error("transient ledger failure: {0}")]
    Transient(String),
    /// The transaction or call reverted.
    #[error("reverted: {0}")]
    Reverted(String),
    /// Ledger data could not be decoded.
    #[error("could not decode ledger data: {0}")]
    Decode(String),
}

/// Errors returned by the [ExecutionEngine](crate::ExecutionEngine) and
/// [ContentStore](crate::ContentStore) collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("interpreter exited with {status}: {stderr}")]
    Process { status: String, stderr: String },
    #[error("could not parse interpreter output: {0}")]
    Output(String),
    /// The engine ran but produced nothing usable.
    #[error("execution produced no result")]
    NoResult,
}

/// The local state an event expected to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingState {
    Task(TaskId),
    /// The task is known, but its solution or VM handle is not.
    Solution(TaskId),
    Game(GameId),
}

impl fmt::Display for MissingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingState::Task(id) => write!(f, "task {id}"),
            MissingState::Solution(id) => write!(f, "solution of task {id}"),
            MissingState::Game(id) => write!(f, "game {id:?}"),
        }
    }
}

/// The [SolverError] enum classifies every failure a handler can end with.
#[derive(Debug, Error)]
pub enum SolverError {
    /// The counterparty or ledger broke the game's move order. The game is abandoned.
    #[error("protocol violation in game {game_id:?}: {reason}")]
    ProtocolViolation { game_id: GameId, reason: String },
    /// Local state that the event implies should exist is absent, usually after a restart.
    #[error("no local state for {0}")]
    MissingState(MissingState),
    /// A call kept failing after all retries.
    #[error("`{op}` failed: {reason}")]
    Transient { op: &'static str, reason: String },
    /// A state-changing call reverted. Reverts are not retried.
    #[error("`{op}` reverted: {reason}")]
    Reverted { op: &'static str, reason: String },
    /// Processing of the task or game cannot continue.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl SolverError {
    /// Returns a stable label for the error class, used in log records.
    pub fn class(&self) -> &'static str {
        match self {
            SolverError::ProtocolViolation { .. } => "protocol-violation",
            SolverError::MissingState(_) => "missing-state",
            SolverError::Transient { .. } => "transient",
            SolverError::Reverted { .. } => "reverted",
            SolverError::Fatal(_) => "fatal",
        }
    }

    /// Returns true if the game the error arose in can make no further progress.
    pub fn ends_game(&self) -> bool {
        matches!(
            self,
            SolverError::ProtocolViolation { .. }
                | SolverError::MissingState(_)
                | SolverError::Fatal(_)
        )
    }
}

/// A failure that the [RetryPolicy](crate::RetryPolicy) can classify.
pub trait Retryable: fmt::Display {
    /// Returns true if repeating the call may succeed.
    fn is_transient(&self) -> bool;

    /// Converts a non-transient failure of `op` into a [SolverError].
    fn into_solver_error(self, op: &'static str) -> SolverError;
}

impl Retryable for LedgerError {
    fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }

    fn into_solver_error(self, op: &'static str) -> SolverError {
        match self {
            LedgerError::Transient(reason) => SolverError::Transient { op, reason },
            LedgerError::Reverted(reason) => SolverError::Reverted { op, reason },
            LedgerError::Decode(reason) => SolverError::Fatal(format!("`{op}`: {reason}")),
        }
    }
}

impl Retryable for EngineError {
    fn is_transient(&self) -> bool {
        matches!(self, EngineError::Io(_))
    }

    fn into_solver_error(self, op: &'static str) -> SolverError {
        match self {
            EngineError::Io(e) => SolverError::Transient {
                op,
                reason: e.to_string(),
            },
            other => SolverError::Fatal(format!("`{op}`: {other}")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ethers::types::U256;

    #[test]
    fn ledger_errors_classify() {
        assert!(LedgerError::Transient("eof".into()).is_transient());
        assert!(!LedgerError::Reverted("nope".into()).is_transient());
        assert_eq!(
            LedgerError::Reverted("nope".into())
                .into_solver_error("report")
                .class(),
            "reverted"
        );
        assert_eq!(
            LedgerError::Decode("bad".into())
                .into_solver_error("getTaskInfo")
                .class(),
            "fatal"
        );
    }

    #[test]
    fn engine_errors_classify() {
        let io = EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, "eagain"));
        assert!(io.is_transient());
        assert_eq!(io.into_solver_error("getStep").class(), "transient");
        assert!(!EngineError::NoResult.is_transient());
        assert!(EngineError::NoResult
            .into_solver_error("executeWasmTask")
            .ends_game());
    }

    #[test]
    fn missing_state_is_distinct_from_violations() {
        let missing = SolverError::MissingState(MissingState::Task(U256::from(42)));
        assert_eq!(missing.class(), "missing-state");
        assert_eq!(missing.to_string(), "no local state for task 42");
    }
}
