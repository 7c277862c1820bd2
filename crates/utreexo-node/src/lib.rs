//! Utreexo bridge and compact state node.
//!
//! The main feature of this library is to run either node as a CLI application.

mod block_index;
pub mod block_source;
pub mod bridge;
mod cli;
pub mod csn;
mod error;
mod informant;
mod paths;
#[cfg(feature = "checksig")]
mod script;

pub use self::block_source::{BlockSource, DirBlockSource};
pub use self::cli::run;
pub use self::error::{Error, Result};
pub use self::paths::Paths;
