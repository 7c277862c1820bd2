//! Error types of the proof data codecs and the block transformer.

/// Errors that can occur while encoding, decoding or deriving proof data.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Record with inconsistent lengths or out of range fields.
    #[error("Malformed data: {context}")]
    Malformed { context: String },

    /// Data disagreeing with the accumulator or with itself.
    #[error("Inconsistent data: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Accumulator(#[from] utreexo_accumulator::Error),

    /// Consensus encoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] bitcoin::consensus::encode::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn malformed(context: impl Into<String>) -> Self {
        Self::Malformed {
            context: context.into(),
        }
    }
}
