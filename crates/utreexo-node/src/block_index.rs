use crate::{Error, Result};
use bitcoin::BlockHash;
use bitcoin::hashes::Hash;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const BLOCK_HASH_FILE: &str = "blockhashes.dat";

const ENTRY_SIZE: u64 = 32;

/// Append-only record of the hash of every block folded into the forest.
///
/// Entry `h` holds the hash of block `h`, genesis included. Resuming checks
/// the block source against the last entry so a bridge never continues on
/// another chain.
pub struct BlockHashIndex {
    file: File,
    len: u64,
}

impl BlockHashIndex {
    /// Opens the index and drops every entry above `keep_height`.
    pub fn open(dir: impl AsRef<Path>, keep_height: i32) -> Result<Self> {
        let path = dir.as_ref().join(BLOCK_HASH_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len() / ENTRY_SIZE;
        let keep = keep_height as u64 + 1;
        if keep_height > 0 && len < keep {
            return Err(Error::Corrupt(format!(
                "{} holds {len} block hashes, forest is synced to {keep_height}",
                path.display()
            )));
        }
        let len = len.min(keep);
        file.set_len(len * ENTRY_SIZE)?;

        Ok(Self { file, len })
    }

    /// Number of indexed blocks.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&mut self, height: i32) -> Result<Option<BlockHash>> {
        if height < 0 || height as u64 >= self.len {
            return Ok(None);
        }
        let mut bytes = [0u8; 32];
        self.file.seek(SeekFrom::Start(height as u64 * ENTRY_SIZE))?;
        self.file.read_exact(&mut bytes)?;
        Ok(Some(BlockHash::from_byte_array(bytes)))
    }

    /// Appends the hash of block `height`, which must be the next one.
    pub fn push(&mut self, height: i32, hash: BlockHash) -> Result<()> {
        if height as u64 != self.len {
            return Err(Error::Corrupt(format!(
                "block hash of {height} appended after {} entries",
                self.len
            )));
        }
        self.file.seek(SeekFrom::Start(self.len * ENTRY_SIZE))?;
        self.file.write_all(hash.as_byte_array())?;
        self.len += 1;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
