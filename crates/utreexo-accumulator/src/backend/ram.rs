use super::{ForestBackend, HASH_SIZE, out_of_range};
use crate::{Error, Hash, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

/// Forest held in one contiguous array, dumped to `path` on flush.
pub struct RamForest {
    data: Vec<Hash>,
    path: PathBuf,
}

impl RamForest {
    pub fn new(size: u64, path: PathBuf) -> Self {
        Self {
            data: vec![Hash::ZERO; size as usize],
            path,
        }
    }

    /// Loads a dump written by [`ForestBackend::flush`].
    pub fn load(path: PathBuf) -> Result<Self> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len % HASH_SIZE != 0 {
            return Err(Error::Inconsistent(format!(
                "{} is {len} bytes, not a multiple of {HASH_SIZE}",
                path.display()
            )));
        }

        let mut reader = BufReader::new(file);
        let mut data = Vec::with_capacity((len / HASH_SIZE) as usize);
        let mut buf = [0u8; 32];
        for _ in 0..len / HASH_SIZE {
            reader.read_exact(&mut buf)?;
            data.push(Hash(buf));
        }

        Ok(Self { data, path })
    }
}

impl ForestBackend for RamForest {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, position: u64) -> Result<Hash> {
        self.data
            .get(position as usize)
            .copied()
            .ok_or_else(|| out_of_range(position, self.data.len() as u64))
    }

    fn write(&mut self, position: u64, hash: Hash) -> Result<()> {
        let size = self.data.len() as u64;
        let slot = self
            .data
            .get_mut(position as usize)
            .ok_or_else(|| out_of_range(position, size))?;
        *slot = hash;
        Ok(())
    }

    fn swap_hash(&mut self, a: u64, b: u64) -> Result<()> {
        let size = self.size();
        if a >= size || b >= size {
            return Err(out_of_range(a.max(b), size));
        }
        self.data.swap(a as usize, b as usize);
        Ok(())
    }

    fn swap_hash_range(&mut self, a: u64, b: u64, width: u64) -> Result<()> {
        let size = self.size();
        if a.max(b) + width > size {
            return Err(out_of_range(a.max(b) + width - 1, size));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        if low + width > high {
            // Overlapping ranges can't be split into disjoint slices.
            for offset in 0..width {
                self.data.swap((a + offset) as usize, (b + offset) as usize);
            }
            return Ok(());
        }
        let (head, tail) = self.data.split_at_mut(high as usize);
        head[low as usize..(low + width) as usize].swap_with_slice(&mut tail[..width as usize]);
        Ok(())
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.data.resize(new_size as usize, Hash::ZERO);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut writer = BufWriter::new(File::create(&self.path)?);
        for hash in &self.data {
            writer.write_all(&hash.0)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}
