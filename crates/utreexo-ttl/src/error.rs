use bitcoin::Txid;

/// Errors that can occur while tracking output lifetimes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two transactions of one block share the 6-byte prefix the index is keyed by.
    #[error("Transactions {first} and {second} of block {height} share an index prefix")]
    PrefixCollision {
        height: i32,
        first: Txid,
        second: Txid,
    },

    #[error("Output {txid}:{vout} not found in the index of block {height}")]
    TxNotFound { height: i32, txid: Txid, vout: u32 },

    #[error("Inconsistent TTL index: {0}")]
    Inconsistent(String),

    /// A pipeline stage stopped before the input was drained.
    #[error("TTL pipeline channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error(transparent)]
    Primitives(#[from] utreexo_primitives::Error),

    #[error(transparent)]
    ProofStore(#[from] utreexo_proof_store::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
