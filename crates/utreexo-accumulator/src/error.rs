//! Error types of the accumulator.

use crate::Hash;

/// Errors that can occur while mutating or proving against the accumulator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A position lies outside of the current forest.
    #[error("Position {position} out of range (num_leaves: {num_leaves})")]
    OutOfRange { position: u64, num_leaves: u64 },

    /// Deletions are unsorted or duplicated, or an add carries the zero hash.
    #[error("Bad input: {0}")]
    BadInput(String),

    /// The hash to prove is not part of the accumulator.
    #[error("Leaf {0} is not in the accumulator")]
    ProofMissing(Hash),

    /// A node required to apply a mutation is not resident.
    #[error("Node at position {0} is not populated")]
    NodeMissing(u64),

    /// The proof does not carry enough hashes, or carries too many.
    #[error("Malformed proof: {0}")]
    ProofMalformed(String),

    /// Hash mismatch between the reconstructed proof and the accumulator roots.
    #[error("Invalid proof: {0}")]
    ProofInvalid(String),

    /// Persisted state disagrees with itself.
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
