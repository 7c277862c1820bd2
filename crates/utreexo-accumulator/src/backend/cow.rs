//! Copy-on-write forest storage.
//!
//! The forest is cut into pages of [`PAGE_HASHES`] hashes. A page is never
//! rewritten in place: a modified page goes to `table-<page>-<generation>.dat`
//! of the pending generation. A flush writes `manifest-<generation>.dat`,
//! listing the file generation of every page, then atomically points
//! `CURRENT` at it. Files that no committed manifest references are removed.

use super::lru::Lru;
use super::{ForestBackend, HASH_SIZE, out_of_range};
use crate::{Error, Hash, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Hashes per page.
pub const PAGE_HASHES: u64 = 4096;

const CURRENT: &str = "CURRENT";
const CURRENT_TMP: &str = "CURRENT.tmp";

struct Page {
    hashes: Vec<Hash>,
    dirty: bool,
}

pub struct CowForest {
    dir: PathBuf,
    size: u64,
    /// Generation `CURRENT` points at.
    committed: u64,
    /// Page number to the generation of its latest table file.
    tables: BTreeMap<u64, u64>,
    /// Resident pages.
    pages: Lru<Page>,
    max_pages: usize,
    changed: bool,
}

fn table_path(dir: &Path, page: u64, generation: u64) -> PathBuf {
    dir.join(format!("table-{page}-{generation}.dat"))
}

fn manifest_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("manifest-{generation}.dat"))
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

impl CowForest {
    /// Creates an empty store in `dir`, wiping whatever was there.
    pub fn create(dir: PathBuf, size: u64, max_pages: usize) -> Result<Self> {
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let mut forest = Self {
            dir,
            size,
            committed: 0,
            tables: BTreeMap::new(),
            pages: Lru::with_capacity(max_pages.min(64)),
            max_pages: max_pages.max(1),
            changed: false,
        };
        forest.write_manifest(0)?;
        forest.point_current(0)?;
        Ok(forest)
    }

    /// Opens the generation committed in `dir/CURRENT`.
    pub fn open(dir: PathBuf, max_pages: usize) -> Result<Self> {
        let committed = read_u64(&mut File::open(dir.join(CURRENT))?)?;

        let mut reader = BufReader::new(File::open(manifest_path(&dir, committed))?);
        let size = read_u64(&mut reader)?;
        let count = read_u64(&mut reader)?;
        let mut tables = BTreeMap::new();
        for _ in 0..count {
            let page = read_u64(&mut reader)?;
            let generation = read_u64(&mut reader)?;
            if generation > committed {
                return Err(Error::Inconsistent(format!(
                    "page {page} at generation {generation} beyond committed {committed}"
                )));
            }
            tables.insert(page, generation);
        }

        let forest = Self {
            dir,
            size,
            committed,
            tables,
            pages: Lru::with_capacity(max_pages.min(64)),
            max_pages: max_pages.max(1),
            changed: false,
        };
        forest.collect_garbage()?;

        tracing::debug!(committed, size, pages = forest.tables.len(), "Opened cow forest");

        Ok(forest)
    }

    pub fn generation(&self) -> u64 {
        self.committed
    }

    fn pending(&self) -> u64 {
        self.committed + 1
    }

    fn load_page(&self, page: u64) -> Result<Page> {
        let mut hashes = vec![Hash::ZERO; PAGE_HASHES as usize];
        if let Some(&generation) = self.tables.get(&page) {
            let mut reader = BufReader::new(File::open(table_path(&self.dir, page, generation))?);
            for hash in hashes.iter_mut() {
                reader.read_exact(&mut hash.0)?;
            }
        }
        Ok(Page {
            hashes,
            dirty: false,
        })
    }

    fn store_page(&mut self, page: u64, hashes: &[Hash]) -> Result<()> {
        let generation = self.pending();
        let mut writer = BufWriter::new(File::create(table_path(&self.dir, page, generation))?);
        for hash in hashes {
            writer.write_all(&hash.0)?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        self.tables.insert(page, generation);
        Ok(())
    }

    fn page_mut(&mut self, page: u64) -> Result<&mut Page> {
        if self.pages.get_mut(page).is_none() {
            let loaded = self.load_page(page)?;
            while self.pages.len() >= self.max_pages {
                let Some((evicted, old)) = self.pages.pop_lru() else {
                    break;
                };
                if old.dirty {
                    self.store_page(evicted, &old.hashes)?;
                }
            }
            self.pages.insert(page, loaded);
        }
        self.pages
            .peek_mut(page)
            .ok_or_else(|| Error::Inconsistent(format!("page {page} not resident")))
    }

    fn write_manifest(&self, generation: u64) -> Result<()> {
        let mut writer = BufWriter::new(File::create(manifest_path(&self.dir, generation))?);
        writer.write_all(&self.size.to_be_bytes())?;
        writer.write_all(&(self.tables.len() as u64).to_be_bytes())?;
        for (page, table_generation) in &self.tables {
            writer.write_all(&page.to_be_bytes())?;
            writer.write_all(&table_generation.to_be_bytes())?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn point_current(&self, generation: u64) -> Result<()> {
        let tmp = self.dir.join(CURRENT_TMP);
        let mut file = File::create(&tmp)?;
        file.write_all(&generation.to_be_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(CURRENT))?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    fn collect_garbage(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            let stale = if let Some(rest) = name.strip_prefix("table-").and_then(|s| s.strip_suffix(".dat")) {
                match rest.split_once('-') {
                    Some((page, generation)) => match (page.parse::<u64>(), generation.parse::<u64>()) {
                        (Ok(page), Ok(generation)) => self.tables.get(&page) != Some(&generation),
                        _ => false,
                    },
                    None => false,
                }
            } else if let Some(generation) = name.strip_prefix("manifest-").and_then(|s| s.strip_suffix(".dat")) {
                generation.parse::<u64>().is_ok_and(|g| g != self.committed)
            } else {
                name == CURRENT_TMP
            };

            if stale {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

impl ForestBackend for CowForest {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, position: u64) -> Result<Hash> {
        if position >= self.size {
            return Err(out_of_range(position, self.size));
        }
        let page = self.page_mut(position / PAGE_HASHES)?;
        Ok(page.hashes[(position % PAGE_HASHES) as usize])
    }

    fn write(&mut self, position: u64, hash: Hash) -> Result<()> {
        if position >= self.size {
            return Err(out_of_range(position, self.size));
        }
        let page = self.page_mut(position / PAGE_HASHES)?;
        page.hashes[(position % PAGE_HASHES) as usize] = hash;
        page.dirty = true;
        self.changed = true;
        Ok(())
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        let first_gone = new_size.div_ceil(PAGE_HASHES);
        self.pages.retain(|page, _| page < first_gone);
        self.tables.retain(|page, _| *page < first_gone);
        self.size = new_size;
        self.changed = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.changed {
            return Ok(());
        }

        let dirty: Vec<u64> = self
            .pages
            .iter_mut()
            .filter(|(_, page)| page.dirty)
            .map(|(number, _)| number)
            .collect();
        for number in dirty {
            let Some(page) = self.pages.peek_mut(number) else {
                continue;
            };
            let hashes = std::mem::take(&mut page.hashes);
            let stored = self.store_page(number, &hashes);
            if let Some(page) = self.pages.peek_mut(number) {
                page.hashes = hashes;
                page.dirty = stored.is_err();
            }
            stored?;
        }

        let generation = self.pending();
        self.write_manifest(generation)?;
        self.point_current(generation)?;
        self.committed = generation;
        self.changed = false;
        self.collect_garbage()?;

        tracing::trace!(generation, "Committed cow forest");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncommitted_writes_are_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cow");

        let mut forest = CowForest::create(path.clone(), 3 * PAGE_HASHES, 1).unwrap();
        forest.write(1, Hash([1; 32])).unwrap();
        forest.flush().unwrap();
        assert_eq!(forest.generation(), 1);

        // Touching other pages evicts page 0 into a pending table file.
        forest.write(2, Hash([2; 32])).unwrap();
        forest.write(PAGE_HASHES + 5, Hash([5; 32])).unwrap();
        forest.write(2 * PAGE_HASHES, Hash([6; 32])).unwrap();
        drop(forest);

        let mut reopened = CowForest::open(path.clone(), 4).unwrap();
        assert_eq!(reopened.generation(), 1);
        assert_eq!(reopened.read(1).unwrap(), Hash([1; 32]));
        assert!(reopened.read(2).unwrap().is_zero());
        assert!(reopened.read(PAGE_HASHES + 5).unwrap().is_zero());

        // Only the committed table and manifest survive.
        let mut names: Vec<String> = fs::read_dir(&path)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["CURRENT", "manifest-1.dat", "table-0-1.dat"]);
    }

    #[test]
    fn commit_replaces_old_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cow");

        let mut forest = CowForest::create(path.clone(), PAGE_HASHES, 2).unwrap();
        forest.write(7, Hash([7; 32])).unwrap();
        forest.flush().unwrap();
        forest.write(8, Hash([8; 32])).unwrap();
        forest.flush().unwrap();
        // Nothing changed, no new generation.
        forest.flush().unwrap();
        assert_eq!(forest.generation(), 2);
        assert!(!table_path(&path, 0, 1).exists());
        assert!(table_path(&path, 0, 2).exists());

        let mut reopened = CowForest::open(path, 2).unwrap();
        assert_eq!(reopened.read(7).unwrap(), Hash([7; 32]));
        assert_eq!(reopened.read(8).unwrap(), Hash([8; 32]));
    }
}
