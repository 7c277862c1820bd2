//! Time-to-live tracking of accumulated outputs.
//!
//! When a block spends an output, the number of blocks the output lived is
//! written back into the proof record of the block that created it. Compact
//! state nodes use these values to decide which new leaves are worth caching.

mod error;
pub mod index;
mod pipeline;

pub use self::error::Error;
pub use self::index::{CreatedTxo, TxoIndexReader, TxoIndexWriter, TxoKey};
pub use self::pipeline::{CHANNEL_CAPACITY, TtlBlock, TtlPipeline, TtlResult};

pub type Result<T> = std::result::Result<T, Error>;
