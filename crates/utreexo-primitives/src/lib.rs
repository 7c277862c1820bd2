//! Proof data exchanged between a bridge node and compact state nodes.
//!
//! - [`LeafData`]: preimage of an accumulator leaf.
//! - [`UData`] and [`UBlock`]: per-block proof record, alone and attached to its block.
//! - [`undo`]: Bitcoin Core undo records, the source of spent output preimages.
//! - [`block`]: derivation of the accumulator additions and deletions of a block.

pub mod block;
mod error;
mod leaf;
mod udata;
pub mod undo;

pub use self::block::{
    SkipLists, block_add_leaf_data, block_to_add_leaves, block_to_del_leaves, dedupe_block,
    gen_udata,
};
pub use self::error::Error;
pub use self::leaf::{LEAF_DATA_HEADER_SIZE, LeafData, MAX_SCRIPT_SIZE, is_unspendable};
pub use self::udata::{TTL_OFFSET, TTL_SLOT_SIZE, UBlock, UData};
pub use self::undo::{BlockUndo, SpentOutput, TxUndo};

pub type Result<T> = std::result::Result<T, Error>;
