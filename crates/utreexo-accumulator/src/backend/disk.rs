use super::{ForestBackend, HASH_SIZE, out_of_range};
use crate::{Hash, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Forest stored in a flat file, hash `p` at byte offset `32 * p`.
pub struct DiskForest {
    file: File,
    size: u64,
    path: PathBuf,
}

impl DiskForest {
    pub fn create(path: PathBuf, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size * HASH_SIZE)?;
        Ok(Self { file, size, path })
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len() / HASH_SIZE;
        Ok(Self { file, size, path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl ForestBackend for DiskForest {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, position: u64) -> Result<Hash> {
        if position >= self.size {
            return Err(out_of_range(position, self.size));
        }
        let mut buf = [0u8; 32];
        self.file.seek(SeekFrom::Start(position * HASH_SIZE))?;
        self.file.read_exact(&mut buf)?;
        Ok(Hash(buf))
    }

    fn write(&mut self, position: u64, hash: Hash) -> Result<()> {
        if position >= self.size {
            return Err(out_of_range(position, self.size));
        }
        self.file.seek(SeekFrom::Start(position * HASH_SIZE))?;
        self.file.write_all(&hash.0)?;
        Ok(())
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.file.set_len(new_size * HASH_SIZE)?;
        self.size = new_size;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
