use bitcoin::BlockHash;
use std::time::Duration;

/// Node error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Block data belongs to another network: expected genesis {expected}, found {found}")]
    WrongNetwork { expected: BlockHash, found: BlockHash },
    #[error("Corrupt data: {0}")]
    Corrupt(String),
    #[error("Block {height} rejected: {reason}")]
    InvalidBlock { height: i32, reason: String },
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
    #[error(transparent)]
    Accumulator(#[from] utreexo_accumulator::Error),
    #[error(transparent)]
    Primitives(#[from] utreexo_primitives::Error),
    #[error(transparent)]
    ProofStore(#[from] utreexo_proof_store::Error),
    #[error(transparent)]
    Ttl(#[from] utreexo_ttl::Error),
    #[error(transparent)]
    Network(#[from] utreexo_network::Error),
    #[error("Failed to decode block data: {0}")]
    Decode(#[from] bitcoin::consensus::encode::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_block(height: i32, reason: impl ToString) -> Self {
        Self::InvalidBlock {
            height,
            reason: reason.to_string(),
        }
    }

    /// Process exit code reporting this error.
    ///
    /// Corrupt or foreign data exits with 2, everything else with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::WrongNetwork { .. }
            | Self::Corrupt(_)
            | Self::Decode(_)
            | Self::ProofStore(utreexo_proof_store::Error::Corrupt(_))
            | Self::Primitives(utreexo_primitives::Error::Malformed { .. }) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
