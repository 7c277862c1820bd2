use super::lru::Lru;
use super::{DiskForest, ForestBackend, out_of_range};
use crate::{Hash, Result};

#[derive(Clone, Copy)]
struct Entry {
    hash: Hash,
    dirty: bool,
}

/// [`DiskForest`] behind a write-back LRU of single hashes.
pub struct CacheForest {
    disk: DiskForest,
    entries: Lru<Entry>,
    capacity: usize,
}

impl CacheForest {
    pub fn new(disk: DiskForest, capacity: usize) -> Self {
        Self {
            disk,
            entries: Lru::with_capacity(capacity.min(1 << 16)),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, position: u64, entry: Entry) -> Result<()> {
        self.entries.insert(position, entry);
        while self.entries.len() > self.capacity {
            let Some((evicted, entry)) = self.entries.pop_lru() else {
                break;
            };
            if entry.dirty {
                self.disk.write(evicted, entry.hash)?;
            }
        }
        Ok(())
    }

    fn write_back(&mut self) -> Result<()> {
        for (position, entry) in self.entries.iter_mut() {
            if entry.dirty {
                self.disk.write(position, entry.hash)?;
                entry.dirty = false;
            }
        }
        Ok(())
    }
}

impl ForestBackend for CacheForest {
    fn size(&self) -> u64 {
        self.disk.size()
    }

    fn read(&mut self, position: u64) -> Result<Hash> {
        if position >= self.size() {
            return Err(out_of_range(position, self.size()));
        }
        if let Some(entry) = self.entries.get_mut(position) {
            return Ok(entry.hash);
        }
        let hash = self.disk.read(position)?;
        self.insert(position, Entry { hash, dirty: false })?;
        Ok(hash)
    }

    fn write(&mut self, position: u64, hash: Hash) -> Result<()> {
        if position >= self.size() {
            return Err(out_of_range(position, self.size()));
        }
        let entry = Entry { hash, dirty: true };
        match self.entries.get_mut(position) {
            Some(cached) => {
                *cached = entry;
                Ok(())
            }
            None => self.insert(position, entry),
        }
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.write_back()?;
        self.entries.retain(|position, _| position < new_size);
        self.disk.resize(new_size)
    }

    fn flush(&mut self) -> Result<()> {
        self.write_back()?;
        self.disk.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u64) -> Hash {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_le_bytes());
        bytes[31] = 1;
        Hash(bytes)
    }

    #[test]
    fn evicted_writes_reach_the_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forest.dat");
        let mut cache = CacheForest::new(DiskForest::create(path.clone(), 64).unwrap(), 4);

        let mut rng = fastrand::Rng::with_seed(7);
        let mut expected = vec![Hash::default(); 64];
        for round in 0..500u64 {
            let position = rng.u64(0..64);
            if round % 3 == 0 {
                assert_eq!(cache.read(position).unwrap(), expected[position as usize]);
            } else {
                cache.write(position, hash(round)).unwrap();
                expected[position as usize] = hash(round);
            }
            assert!(cache.entries.len() <= 4);
        }
        for (position, hash) in expected.iter().enumerate() {
            assert_eq!(cache.read(position as u64).unwrap(), *hash);
        }

        cache.flush().unwrap();
        drop(cache);
        let mut disk = DiskForest::open(path).unwrap();
        for (position, hash) in expected.iter().enumerate() {
            assert_eq!(disk.read(position as u64).unwrap(), *hash);
        }
    }

    #[test]
    fn shrinking_drops_cached_positions() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CacheForest::new(DiskForest::create(dir.path().join("forest.dat"), 16).unwrap(), 8);
        for position in 0..16 {
            cache.write(position, hash(position)).unwrap();
        }
        cache.resize(4).unwrap();
        assert!(cache.read(4).is_err());
        cache.resize(16).unwrap();
        assert_eq!(cache.read(3).unwrap(), hash(3));
        assert_eq!(cache.read(12).unwrap(), Hash::default());
    }
}
