//! Blocks and undo records the bridge builds its accumulator from.

use crate::{Error, Result};
use bitcoin::consensus::deserialize;
use bitcoin::{Block, Network};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use utreexo_primitives::BlockUndo;

/// Provides the blocks of the best chain by height.
pub trait BlockSource: Send + Sync + 'static {
    /// Highest height for which block and undo data are available.
    fn tip(&self) -> Result<i32>;

    fn block(&self, height: i32) -> Result<Block>;

    /// Block at `height` along with the outputs its inputs spend.
    fn block_and_undo(&self, height: i32) -> Result<(Block, BlockUndo)>;
}

/// Reads `<height>.blk` (consensus-encoded block) and `<height>.rev`
/// (Bitcoin Core undo record) files from a directory.
#[derive(Debug)]
pub struct DirBlockSource {
    dir: PathBuf,
    /// Highest height known to be contiguous from genesis.
    known_tip: AtomicI32,
}

impl DirBlockSource {
    /// Opens `dir` and checks that its genesis block belongs to `network`.
    pub fn open(dir: impl AsRef<Path>, network: Network) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "block directory {} does not exist",
                dir.display()
            )));
        }

        let source = Self {
            dir,
            known_tip: AtomicI32::new(0),
        };

        let expected = bitcoin::constants::genesis_block(network).block_hash();
        let found = source
            .block(0)
            .map_err(|err| Error::Config(format!("no genesis block in {}: {err}", source.dir.display())))?
            .block_hash();
        if found != expected {
            return Err(Error::WrongNetwork { expected, found });
        }

        tracing::info!(dir = %source.dir.display(), ?network, "Opened block directory");

        Ok(source)
    }

    pub fn block_path(&self, height: i32) -> PathBuf {
        self.dir.join(format!("{height}.blk"))
    }

    pub fn undo_path(&self, height: i32) -> PathBuf {
        self.dir.join(format!("{height}.rev"))
    }

    fn read(path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).map_err(|err| {
            std::io::Error::new(err.kind(), format!("{}: {err}", path.display())).into()
        })
    }
}

impl BlockSource for DirBlockSource {
    fn tip(&self) -> Result<i32> {
        let mut tip = self.known_tip.load(Ordering::Relaxed);
        while self.block_path(tip + 1).is_file() && self.undo_path(tip + 1).is_file() {
            tip += 1;
        }
        self.known_tip.fetch_max(tip, Ordering::Relaxed);
        Ok(tip)
    }

    fn block(&self, height: i32) -> Result<Block> {
        let raw = Self::read(&self.block_path(height))?;
        Ok(deserialize(&raw)?)
    }

    fn block_and_undo(&self, height: i32) -> Result<(Block, BlockUndo)> {
        let block = self.block(height)?;
        let raw_undo = Self::read(&self.undo_path(height))?;
        let undo = deserialize(&raw_undo)?;
        Ok((block, undo))
    }
}

impl utreexo_network::BlockProvider for DirBlockSource {
    fn raw_block(&self, height: i32) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.block_path(height))
    }
}
