//! The commit module holds the primitives of the commit-reveal scheme: the secret that backs a
//! task registration, and the pair of solution commitments of which only one is real.

use ethers::{types::H256, utils::keccak256};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// Which of the two committed solution hashes is the real one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SolutionSlot {
    First = 0,
    Second = 1,
}

impl SolutionSlot {
    /// Returns the flag passed to `revealSolution`: true if the first commitment is real.
    pub fn first_is_real(&self) -> bool {
        matches!(self, SolutionSlot::First)
    }
}

/// A [Commitment] is the pair of solution hashes submitted with `commitSolution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commitment {
    pub first: H256,
    pub second: H256,
    /// The slot holding the real solution.
    pub real: SolutionSlot,
}

impl Commitment {
    /// Disguises `solution` next to a random decoy, placing it in a slot chosen by a fair coin.
    pub fn new<R: Rng>(solution: H256, rng: &mut R) -> Self {
        let mut noise = [0u8; 32];
        rng.fill_bytes(&mut noise);
        let decoy = H256::from(keccak256(noise));

        if rng.gen::<bool>() {
            Self {
                first: solution,
                second: decoy,
                real: SolutionSlot::First,
            }
        } else {
            Self {
                first: decoy,
                second: solution,
                real: SolutionSlot::Second,
            }
        }
    }

    /// Returns the hash committed in `slot`.
    pub fn at(&self, slot: SolutionSlot) -> H256 {
        match slot {
            SolutionSlot::First => self.first,
            SolutionSlot::Second => self.second,
        }
    }
}

/// Generates the secret registered (as its hash) for a task and revealed with the solution.
pub fn generate_secret<R: RngCore + ?Sized>(rng: &mut R) -> H256 {
    let mut secret = [0u8; 32];
    rng.fill_bytes(&mut secret);
    H256::from(secret)
}

/// Returns the commitment to `secret` as the incentive layer computes it: the keccak256 hash of
/// the secret's big-endian `uint256` encoding, which is the secret's own 32 bytes.
pub fn secret_commitment(secret: &H256) -> H256 {
    H256::from(keccak256(secret.as_bytes()))
}
