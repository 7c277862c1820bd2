//! Hash-by-position storage of the forest.
//!
//! Four variants share one capability set, selected at startup through
//! [`ForestKind`] and dispatched through the [`ForestData`] enum.

mod cache;
mod cow;
mod disk;
mod lru;
mod ram;

pub use self::cache::CacheForest;
pub use self::cow::CowForest;
pub use self::disk::DiskForest;
pub use self::ram::RamForest;

use crate::{Hash, Result};
use std::path::PathBuf;

/// Size of a serialized hash on disk.
pub(crate) const HASH_SIZE: u64 = 32;

/// Name of the forest dump (ram) or backing file (disk, cache).
pub const FOREST_FILE: &str = "forestfile.dat";

/// Capabilities of a forest storage backend.
pub trait ForestBackend {
    /// Number of position slots.
    fn size(&self) -> u64;

    fn read(&mut self, position: u64) -> Result<Hash>;

    fn write(&mut self, position: u64, hash: Hash) -> Result<()>;

    fn swap_hash(&mut self, a: u64, b: u64) -> Result<()> {
        let hash_a = self.read(a)?;
        let hash_b = self.read(b)?;
        self.write(a, hash_b)?;
        self.write(b, hash_a)
    }

    /// Swaps the `width` consecutive hashes starting at `a` with those starting at `b`.
    fn swap_hash_range(&mut self, a: u64, b: u64, width: u64) -> Result<()> {
        for offset in 0..width {
            self.swap_hash(a + offset, b + offset)?;
        }
        Ok(())
    }

    /// Grows or shrinks to `new_size` slots; new slots read as zero.
    fn resize(&mut self, new_size: u64) -> Result<()>;

    /// Makes every write so far durable.
    fn flush(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// Forest backend selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum ForestKind {
    /// Contiguous in-memory array, dumped to disk on flush.
    #[default]
    Ram,
    /// Flat file, every access hits the file.
    Disk,
    /// Flat file behind a write-back LRU.
    Cache,
    /// Copy-on-write pages with an atomically committed generation.
    Cow,
}

/// Where and how to open a forest backend.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub kind: ForestKind,
    /// Directory holding the forest files.
    pub dir: PathBuf,
    /// Hashes kept by the cache variant.
    pub cache_hashes: usize,
    /// Pages kept by the copy-on-write variant.
    pub cow_max_pages: usize,
}

impl BackendConfig {
    pub fn new(kind: ForestKind, dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            dir: dir.into(),
            cache_hashes: 1 << 20,
            cow_max_pages: 500,
        }
    }
}

/// One of the four backends.
pub enum ForestData {
    Ram(RamForest),
    Disk(DiskForest),
    Cache(CacheForest),
    Cow(CowForest),
}

impl ForestData {
    /// Creates an empty backend of `size` slots, discarding any previous files.
    pub fn create(config: &BackendConfig, size: u64) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let data = match config.kind {
            ForestKind::Ram => Self::Ram(RamForest::new(size, config.dir.join(FOREST_FILE))),
            ForestKind::Disk => Self::Disk(DiskForest::create(config.dir.join(FOREST_FILE), size)?),
            ForestKind::Cache => Self::Cache(CacheForest::new(
                DiskForest::create(config.dir.join(FOREST_FILE), size)?,
                config.cache_hashes,
            )),
            ForestKind::Cow => Self::Cow(CowForest::create(
                config.dir.join("cow"),
                size,
                config.cow_max_pages,
            )?),
        };
        Ok(data)
    }

    /// Opens the backend files left by a previous run.
    pub fn open(config: &BackendConfig) -> Result<Self> {
        let data = match config.kind {
            ForestKind::Ram => Self::Ram(RamForest::load(config.dir.join(FOREST_FILE))?),
            ForestKind::Disk => Self::Disk(DiskForest::open(config.dir.join(FOREST_FILE))?),
            ForestKind::Cache => Self::Cache(CacheForest::new(
                DiskForest::open(config.dir.join(FOREST_FILE))?,
                config.cache_hashes,
            )),
            ForestKind::Cow => Self::Cow(CowForest::open(config.dir.join("cow"), config.cow_max_pages)?),
        };
        Ok(data)
    }

    pub fn kind(&self) -> ForestKind {
        match self {
            Self::Ram(_) => ForestKind::Ram,
            Self::Disk(_) => ForestKind::Disk,
            Self::Cache(_) => ForestKind::Cache,
            Self::Cow(_) => ForestKind::Cow,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            ForestData::Ram($inner) => $body,
            ForestData::Disk($inner) => $body,
            ForestData::Cache($inner) => $body,
            ForestData::Cow($inner) => $body,
        }
    };
}

impl ForestBackend for ForestData {
    fn size(&self) -> u64 {
        dispatch!(self, inner => inner.size())
    }

    fn read(&mut self, position: u64) -> Result<Hash> {
        dispatch!(self, inner => inner.read(position))
    }

    fn write(&mut self, position: u64, hash: Hash) -> Result<()> {
        dispatch!(self, inner => inner.write(position, hash))
    }

    fn swap_hash(&mut self, a: u64, b: u64) -> Result<()> {
        dispatch!(self, inner => inner.swap_hash(a, b))
    }

    fn swap_hash_range(&mut self, a: u64, b: u64, width: u64) -> Result<()> {
        dispatch!(self, inner => inner.swap_hash_range(a, b, width))
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        dispatch!(self, inner => inner.resize(new_size))
    }

    fn flush(&mut self) -> Result<()> {
        dispatch!(self, inner => inner.flush())
    }

    fn close(&mut self) -> Result<()> {
        dispatch!(self, inner => inner.close())
    }
}

pub(crate) fn out_of_range(position: u64, size: u64) -> crate::Error {
    crate::Error::OutOfRange {
        position,
        num_leaves: size,
    }
}
