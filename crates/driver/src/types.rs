use crate::error::LedgerError;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
pub use wasm_solver_games::verification::{GameId, TaskId};

/// The task state in which the incentive layer accepts solution reveals.
pub const TASK_STATE_REVEAL: u64 = 4;

/// The [StorageType] enum defines where the code of a task is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StorageType {
    /// Code and auxiliary files live in the content-addressed store.
    Ipfs = 0,
    /// Code is stored as bytes in the file system contract.
    Blockchain = 1,
}

impl TryFrom<u8> for StorageType {
    type Error = LedgerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StorageType::Ipfs),
            1 => Ok(StorageType::Blockchain),
            _ => Err(LedgerError::Decode(format!("invalid storage type {value}"))),
        }
    }
}

/// The [CodeType] enum defines the encoding of a task's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodeType {
    Wast = 0,
    Wasm = 1,
}

impl TryFrom<u8> for CodeType {
    type Error = LedgerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CodeType::Wast),
            1 => Ok(CodeType::Wasm),
            _ => Err(LedgerError::Decode(format!("invalid code type {value}"))),
        }
    }
}

/// Immutable task metadata returned by `getTaskInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub giver: Address,
    pub init_task_hash: H256,
    pub code_type: CodeType,
    pub code_storage: StorageType,
    pub storage_address: H256,
}

/// The solution slots of a task as returned by `solutionInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SolutionInfo {
    pub solver: Address,
    pub solution_hash0: H256,
    pub solution_hash1: H256,
}

impl SolutionInfo {
    /// Returns true once a solver has registered for the task.
    pub fn is_claimed(&self) -> bool {
        self.solver != Address::zero()
    }
}

/// The kinds of ledger events the solver subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskCreated,
    SolverSelected,
    TaskStateChange,
    StartChallenge,
    Queried,
    SelectedPhase,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::TaskCreated,
        EventKind::SolverSelected,
        EventKind::TaskStateChange,
        EventKind::StartChallenge,
        EventKind::Queried,
        EventKind::SelectedPhase,
    ];
}

/// A decoded ledger event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    TaskCreated { task_id: TaskId, deposit: U256 },
    SolverSelected { task_id: TaskId, solver: Address },
    TaskStateChange { task_id: TaskId, state: U256 },
    StartChallenge { game_id: GameId, solver: Address },
    Queried { game_id: GameId, low: U256, high: U256 },
    SelectedPhase { game_id: GameId, low: U256, phase: U256 },
}

impl LedgerEvent {
    /// Returns the [EventKind] of the event.
    pub fn kind(&self) -> EventKind {
        match self {
            LedgerEvent::TaskCreated { .. } => EventKind::TaskCreated,
            LedgerEvent::SolverSelected { .. } => EventKind::SolverSelected,
            LedgerEvent::TaskStateChange { .. } => EventKind::TaskStateChange,
            LedgerEvent::StartChallenge { .. } => EventKind::StartChallenge,
            LedgerEvent::Queried { .. } => EventKind::Queried,
            LedgerEvent::SelectedPhase { .. } => EventKind::SelectedPhase,
        }
    }

    /// Returns the game the event belongs to, if it is a dispute event.
    pub fn game_id(&self) -> Option<GameId> {
        match self {
            LedgerEvent::StartChallenge { game_id, .. }
            | LedgerEvent::Queried { game_id, .. }
            | LedgerEvent::SelectedPhase { game_id, .. } => Some(*game_id),
            _ => None,
        }
    }
}
