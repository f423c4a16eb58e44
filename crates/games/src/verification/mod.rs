//! Data structures, types, and the game logic for the interactive verification game that a
//! solver plays when its solution is challenged.

mod types;
pub use types::*;

mod bisection;
pub use bisection::{midpoint, Bracket};

mod game;
pub use game::{BisectionGame, GameStatus, VerificationGame};

pub mod serde_hex;

mod proof;
pub use proof::{
    build_proof, is_custom_judge_op, CustomJudgeProof, JudgeProof, MachineSnapshot, MerkleProof,
    PhaseProof, Proof, StepTrace, VmRef, VmSnapshot, CUSTOM_JUDGE_OPCODE, CUSTOM_JUDGE_OPCODE_OFFSET,
};

mod commit;
pub use commit::{generate_secret, secret_commitment, Commitment, SolutionSlot};
