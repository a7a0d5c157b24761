//! Hashcash-style proof-of-work admission puzzle.
//!
//! The server hands the client a random challenge and a difficulty in bits;
//! the client searches for a 4-byte counter whose SHA-256 over
//! counter ‖ challenge starts with that many zero bits. Verification is a
//! single hash, so the server spends almost nothing to reject junk
//! connections.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::frames::SOLUTION_LENGTH;

/// Highest difficulty a puzzle will accept being constructed with.
pub const MAX_DIFFICULTY: u8 = 30;

/// A proof-of-work puzzle bound to a specific challenge.
#[derive(Debug, Clone)]
pub struct HashPuzzle {
    difficulty: u8,
    challenge: Vec<u8>,
}

impl HashPuzzle {
    /// Creates a puzzle over `challenge` requiring `difficulty` leading zero
    /// bits.
    pub fn new(difficulty: u8, challenge: &[u8]) -> Result<Self> {
        if difficulty > MAX_DIFFICULTY {
            return Err(ProtocolError::DifficultyTooHigh {
                difficulty,
                max: MAX_DIFFICULTY,
            });
        }

        Ok(Self {
            difficulty,
            challenge: challenge.to_vec(),
        })
    }

    /// Returns the difficulty in bits.
    pub fn difficulty(&self) -> u8 {
        self.difficulty
    }

    /// Searches for a solution by brute force.
    ///
    /// Tries up to three times the expected number of attempts for the
    /// difficulty before giving up, so a statistically unlucky search
    /// terminates rather than spinning forever.
    pub fn solve(&self) -> Result<[u8; SOLUTION_LENGTH]> {
        let bound = 3u64.saturating_mul(1u64 << self.difficulty);

        for counter in 0..bound.min(u32::MAX as u64 + 1) {
            let solution = (counter as u32).to_le_bytes();
            if self.check(&solution) {
                debug!(
                    difficulty = self.difficulty,
                    attempts = counter + 1,
                    "puzzle solved"
                );
                return Ok(solution);
            }
        }

        Err(ProtocolError::ChallengeFailed)
    }

    /// Verifies a claimed solution with a single hash.
    pub fn verify(&self, solution: &[u8; SOLUTION_LENGTH]) -> bool {
        self.check(solution)
    }

    fn check(&self, solution: &[u8; SOLUTION_LENGTH]) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(solution);
        hasher.update(&self.challenge);
        leading_zero_bits(&hasher.finalize()) >= self.difficulty as u32
    }
}

fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in digest {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}
