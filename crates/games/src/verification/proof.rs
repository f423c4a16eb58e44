//! The proof module turns the interpreter's trace of a single execution step into the exact
//! arguments the judge needs to check one phase of that step.

use super::{serde_hex, Phase, ProofError, PHASE_STATE_COUNT};
use ethers::{
    abi::{self, Token},
    types::{Bytes, H256, U256},
};
use serde::Deserialize;

/// The byte offset of the opcode within the 32-byte instruction word.
pub const CUSTOM_JUDGE_OPCODE_OFFSET: usize = 26;

/// The opcode that is judged by the custom judge instead of the generic phase judge.
pub const CUSTOM_JUDGE_OPCODE: u8 = 0x10;

/// Returns true if the instruction word `op` carries the custom judge opcode.
pub fn is_custom_judge_op(op: &H256) -> bool {
    op.as_bytes()[CUSTOM_JUDGE_OPCODE_OFFSET] == CUSTOM_JUDGE_OPCODE
}

/// The machine registers captured for a phase.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct MachineSnapshot {
    #[serde(deserialize_with = "serde_hex::u256")]
    pub reg1: U256,
    #[serde(deserialize_with = "serde_hex::u256")]
    pub reg2: U256,
    #[serde(deserialize_with = "serde_hex::u256")]
    pub reg3: U256,
    #[serde(deserialize_with = "serde_hex::u256")]
    pub ireg: U256,
    #[serde(deserialize_with = "serde_hex::h256")]
    pub vm: H256,
    #[serde(deserialize_with = "serde_hex::h256")]
    pub op: H256,
}

impl MachineSnapshot {
    /// The all-zero snapshot substituted when a phase carries no machine state.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns `[reg1, reg2, reg3, ireg]`.
    pub fn registers(&self) -> [U256; 4] {
        [self.reg1, self.reg2, self.reg3, self.ireg]
    }
}

/// The state components of the wasm virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct VmSnapshot {
    #[serde(deserialize_with = "serde_hex::h256")]
    pub code: H256,
    #[serde(deserialize_with = "serde_hex::h256")]
    pub stack: H256,
    #[serde(deserialize_with = "serde_hex::h256")]
    pub memory: H256,
    #[serde(deserialize_with = "serde_hex::h256")]
    pub call_stack: H256,
    #[serde(deserialize_with = "serde_hex::h256")]
    pub globals: H256,
    #[serde(deserialize_with = "serde_hex::h256")]
    pub calltable: H256,
    #[serde(deserialize_with = "serde_hex::h256")]
    pub calltypes: H256,
    #[serde(deserialize_with = "serde_hex::h256")]
    pub input_size: H256,
    #[serde(deserialize_with = "serde_hex::h256")]
    pub input_name: H256,
    #[serde(deserialize_with = "serde_hex::h256")]
    pub input_data: H256,
    #[serde(deserialize_with = "serde_hex::u256")]
    pub pc: U256,
    #[serde(deserialize_with = "serde_hex::u256")]
    pub stack_ptr: U256,
    #[serde(deserialize_with = "serde_hex::u256")]
    pub call_ptr: U256,
    #[serde(deserialize_with = "serde_hex::u256")]
    pub memsize: U256,
}

impl VmSnapshot {
    /// The all-zero snapshot substituted when a phase carries no virtual machine state.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns the Merkle roots of the state components in the order the dispute layer expects.
    pub fn roots(&self) -> [H256; 10] {
        [
            self.code,
            self.stack,
            self.memory,
            self.call_stack,
            self.globals,
            self.calltable,
            self.calltypes,
            self.input_size,
            self.input_name,
            self.input_data,
        ]
    }

    /// Returns `[pc, stack_ptr, call_ptr, memsize]`.
    pub fn pointers(&self) -> [U256; 4] {
        [self.pc, self.stack_ptr, self.call_ptr, self.memsize]
    }
}

/// Phases either carry a full [VmSnapshot] or only its digest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum VmRef {
    Full(VmSnapshot),
    Digest(String),
}

/// The Merkle paths of a phase. Memory phases carry a read list and a write list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct MerkleProof {
    #[serde(deserialize_with = "serde_hex::opt_h256_vec")]
    pub list: Option<Vec<H256>>,
    #[serde(deserialize_with = "serde_hex::opt_h256_vec")]
    pub list1: Option<Vec<H256>>,
    #[serde(deserialize_with = "serde_hex::opt_h256_vec")]
    pub list2: Option<Vec<H256>>,
    #[serde(deserialize_with = "serde_hex::opt_h256")]
    pub result_state: Option<H256>,
    #[serde(deserialize_with = "serde_hex::opt_u256")]
    pub result_size: Option<U256>,
}

/// The interpreter's raw proof for a single phase.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct PhaseProof {
    #[serde(deserialize_with = "serde_hex::opt_h256_vec")]
    pub location: Option<Vec<H256>>,
    pub merkle: Option<MerkleProof>,
    pub machine: Option<MachineSnapshot>,
    pub vm: Option<VmRef>,
}

/// The interpreter's trace of a single execution step: the intermediate state after every
/// phase and the raw proof of each phase.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct StepTrace {
    #[serde(deserialize_with = "serde_hex::h256_vec")]
    pub states: Vec<H256>,
    pub fetch: Option<PhaseProof>,
    pub init: Option<PhaseProof>,
    pub reg1: Option<PhaseProof>,
    pub reg2: Option<PhaseProof>,
    pub reg3: Option<PhaseProof>,
    pub alu: Option<PhaseProof>,
    pub write1: Option<PhaseProof>,
    pub write2: Option<PhaseProof>,
    pub pc: Option<PhaseProof>,
    pub stack_ptr: Option<PhaseProof>,
    pub call_ptr: Option<PhaseProof>,
    pub memsize: Option<PhaseProof>,
}

impl StepTrace {
    /// Returns the raw proof recorded for `phase`, if any.
    pub fn phase_proof(&self, phase: Phase) -> Option<&PhaseProof> {
        match phase {
            Phase::Fetch => self.fetch.as_ref(),
            Phase::Init => self.init.as_ref(),
            Phase::Reg1 => self.reg1.as_ref(),
            Phase::Reg2 => self.reg2.as_ref(),
            Phase::Reg3 => self.reg3.as_ref(),
            Phase::Alu => self.alu.as_ref(),
            Phase::Write1 => self.write1.as_ref(),
            Phase::Write2 => self.write2.as_ref(),
            Phase::Pc => self.pc.as_ref(),
            Phase::StackPtr => self.stack_ptr.as_ref(),
            Phase::CallPtr => self.call_ptr.as_ref(),
            Phase::Memsize => self.memsize.as_ref(),
        }
    }

    /// Returns the phase states posted once the bisection reaches a single step.
    pub fn phase_states(&self) -> Result<[H256; PHASE_STATE_COUNT], ProofError> {
        self.states
            .as_slice()
            .try_into()
            .map_err(|_| ProofError::PhaseStates(self.states.len()))
    }
}

/// The arguments of the generic `callJudge` entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeProof {
    pub phase: Phase,
    pub merkle: Vec<H256>,
    pub merkle2: Vec<H256>,
    pub vm_hash: H256,
    pub op: H256,
    pub registers: [U256; 4],
    pub roots: [H256; 10],
    pub pointers: [U256; 4],
}

/// The arguments of the `callCustomJudge` entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomJudgeProof {
    pub op: H256,
    pub registers: [U256; 4],
    pub result_state: H256,
    pub result_size: U256,
    pub merkle: Vec<H256>,
    pub roots: [H256; 10],
    pub pointers: [U256; 4],
}

/// A [Proof] is everything the judge needs to verify one phase of the disputed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proof {
    Generic(JudgeProof),
    Custom(CustomJudgeProof),
}

fn words(list: &[H256]) -> Token {
    Token::Array(list.iter().map(|h| Token::FixedBytes(h.0.to_vec())).collect())
}

fn fixed_words(list: &[H256]) -> Token {
    Token::FixedArray(list.iter().map(|h| Token::FixedBytes(h.0.to_vec())).collect())
}

fn fixed_uints(list: &[U256]) -> Token {
    Token::FixedArray(list.iter().copied().map(Token::Uint).collect())
}

impl Proof {
    /// Returns true if the proof goes to the custom judge.
    pub fn is_custom(&self) -> bool {
        matches!(self, Proof::Custom(_))
    }

    /// ABI-encodes the proof arguments in judge call order, without the game id and step.
    pub fn abi_encode(&self) -> Bytes {
        let tokens = match self {
            Proof::Generic(p) => vec![
                Token::Uint(U256::from(p.phase as u8)),
                words(&p.merkle),
                words(&p.merkle2),
                Token::FixedBytes(p.vm_hash.0.to_vec()),
                Token::FixedBytes(p.op.0.to_vec()),
                fixed_uints(&p.registers),
                fixed_words(&p.roots),
                fixed_uints(&p.pointers),
            ],
            Proof::Custom(p) => vec![
                Token::FixedBytes(p.op.0.to_vec()),
                fixed_uints(&p.registers),
                Token::FixedBytes(p.result_state.0.to_vec()),
                Token::Uint(p.result_size),
                words(&p.merkle),
                fixed_words(&p.roots),
                fixed_uints(&p.pointers),
            ],
        };
        abi::encode(&tokens).into()
    }
}

/// Builds the [Proof] for `phase` of the traced step.
///
/// Missing Merkle lists default to empty, a missing machine to [MachineSnapshot::zero] and a
/// missing or digest-only virtual machine to [VmSnapshot::zero], so the judge call is always
/// well-formed. The write phase of a custom judge opcode is routed to the custom judge.
///
/// ### Takes
/// - `trace`: The interpreter's trace of the disputed step.
/// - `phase`: The phase selected by the challenger.
///
/// ### Returns
/// - `Ok(Proof)`: The judge arguments.
/// - `Err(ProofError)`: The trace carries no proof for `phase`.
pub fn build_proof(trace: &StepTrace, phase: Phase) -> Result<Proof, ProofError> {
    let proof = trace
        .phase_proof(phase)
        .ok_or(ProofError::MissingPhase(phase))?;

    let (merkle, merkle2) = match &proof.merkle {
        Some(m) => (
            m.list
                .as_ref()
                .or(m.list1.as_ref())
                .cloned()
                .unwrap_or_default(),
            m.list2.clone().unwrap_or_default(),
        ),
        None => (proof.location.clone().unwrap_or_default(), Vec::new()),
    };

    let machine = proof.machine.clone().unwrap_or_else(MachineSnapshot::zero);
    let vm = match &proof.vm {
        Some(VmRef::Full(vm)) => vm.clone(),
        _ => VmSnapshot::zero(),
    };

    if phase == Phase::Write1 && is_custom_judge_op(&machine.op) {
        // The custom judge takes the single-list proof only, never `list1` or the location.
        let (result_state, result_size, merkle) = proof
            .merkle
            .as_ref()
            .map(|m| {
                (
                    m.result_state.unwrap_or_default(),
                    m.result_size.unwrap_or_default(),
                    m.list.clone().unwrap_or_default(),
                )
            })
            .unwrap_or_default();
        return Ok(Proof::Custom(CustomJudgeProof {
            op: machine.op,
            registers: machine.registers(),
            result_state,
            result_size,
            merkle,
            roots: vm.roots(),
            pointers: vm.pointers(),
        }));
    }

    Ok(Proof::Generic(JudgeProof {
        phase,
        merkle,
        merkle2,
        vm_hash: machine.vm,
        op: machine.op,
        registers: machine.registers(),
        roots: vm.roots(),
        pointers: vm.pointers(),
    }))
}
