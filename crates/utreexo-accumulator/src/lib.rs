//! Utreexo hash accumulator.
//!
//! A forest of perfect binary Merkle trees committing to the UTXO set:
//!
//! - [`Forest`] holds every node and proves any leaf; it is what a bridge node runs.
//! - [`Pollard`] holds the roots plus the branches of the leaves it was told to
//!   remember, and is updated from the proofs a bridge hands out.
//!
//! Both apply deletions through the same [`RemovePlan`], so they reach equal
//! roots after the same sequence of modifications.

pub mod backend;
mod error;
mod forest;
mod hash;
mod pollard;
pub mod position;
mod proof;
mod store;
mod transform;

pub use self::backend::{BackendConfig, ForestBackend, ForestData, ForestKind};
pub use self::error::Error;
pub use self::forest::{Forest, MISC_FILE, SYNCED_HEIGHT_FILE, UndoBlock};
pub use self::hash::{Hash, Leaf, MiniHash, parent_hash, rehash};
pub use self::pollard::{NodeIdx, Pollard};
pub use self::proof::{BatchProof, Reconstructed, proof_positions, reconstruct, verify};
pub use self::transform::{
    Arrow, Relocation, RemovePlan, RowPlan, dedupe_swap_dirt, ex_twin, remove_transform,
};

/// Accumulator result type.
pub type Result<T> = std::result::Result<T, Error>;
