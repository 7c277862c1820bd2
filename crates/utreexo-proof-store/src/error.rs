/// Errors that can occur while reading or writing proof records.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The genesis block spends nothing and has no proof record.
    #[error("No proof record for the genesis block")]
    NoProofForGenesis,

    #[error("No proof record at height {height}, tip is {tip}")]
    HeightNotFound { height: i32, tip: i32 },

    #[error("Proof record {height} has {num_ttls} TTL slots, slot {slot} requested")]
    TtlSlotOutOfRange { height: i32, slot: u32, num_ttls: u32 },

    /// Records must be appended in ascending height order without gaps.
    #[error("Expected proof record {expected}, got {got}")]
    OutOfOrder { expected: i32, got: i32 },

    /// Files disagreeing with each other.
    #[error("Corrupt proof store: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Primitives(#[from] utreexo_primitives::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
