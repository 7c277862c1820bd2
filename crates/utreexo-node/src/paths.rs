use std::path::{Path, PathBuf};
use utreexo_accumulator::{MISC_FILE, SYNCED_HEIGHT_FILE};

/// Layout of the bridge data directory.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hash of every processed block, by height.
    pub fn offset_dir(&self) -> PathBuf {
        self.root.join("offsetdata")
    }

    pub fn proof_dir(&self) -> PathBuf {
        self.root.join("proofdata")
    }

    /// Forest files; the copy-on-write backend keeps its pages in `cow/` below.
    pub fn forest_dir(&self) -> PathBuf {
        self.root.join("forestdata")
    }

    /// Created-output index of the TTL pipeline.
    pub fn ttl_dir(&self) -> PathBuf {
        self.root.join("ttldb")
    }

    pub fn create_all(&self) -> std::io::Result<()> {
        for dir in [
            self.offset_dir(),
            self.proof_dir(),
            self.forest_dir(),
            self.ttl_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Whether a previous run persisted a forest to resume from.
    pub fn has_forest(&self) -> bool {
        let dir = self.forest_dir();
        dir.join(MISC_FILE).exists() && dir.join(SYNCED_HEIGHT_FILE).exists()
    }
}
