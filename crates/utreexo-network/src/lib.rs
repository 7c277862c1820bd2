//! Streaming of [`UBlock`]s from a bridge node to compact state nodes.
//!
//! A client connects and sends `i32 start ∥ i32 end` (big-endian, end
//! exclusive, [`UP_TO_TIP`] for every block the bridge holds). The server
//! answers with the back-to-back serialization of every `UBlock` in the range,
//! each one self-delimiting, and closes the connection once the range is
//! served. A server built with [`UBlockServer::follow_tip`] keeps streaming
//! new blocks for open-ended requests until its store closes.
//!
//! [`UBlock`]: utreexo_primitives::UBlock

mod client;
mod server;

pub use self::client::{CONNECT_TIMEOUT, UBlockClient};
pub use self::server::{BlockProvider, UBlockServer};

/// Default port of the UBlock stream.
pub const DEFAULT_PORT: u16 = 8338;

/// Requested end meaning "every block the bridge has when the request arrives".
pub const UP_TO_TIP: i32 = i32::MAX;

/// Network error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connecting to {0} timed out")]
    ConnectionTimeout(String),
    #[error("Peer closed the stream in the middle of a UBlock")]
    PeerShutdown,
    #[error("Invalid range request: {start}..{end}")]
    BadRequest { start: i32, end: i32 },
    #[error("Failed to decode UBlock: {0}")]
    Decode(#[from] bitcoin::consensus::encode::Error),
    #[error("Block {height} unavailable: {reason}")]
    BlockUnavailable { height: i32, reason: String },
    #[error(transparent)]
    ProofStore(#[from] utreexo_proof_store::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
