use crate::backend::{BackendConfig, ForestBackend, ForestData};
use crate::position::{
    forest_size, left_child, parent, right_child, root_position, root_positions, root_present,
    row_offset,
};
use crate::proof::{self, BatchProof, proof_positions};
use crate::store::{NodeStore, execute_plan};
use crate::transform::{Arrow, remove_transform, subtree_row_range};
use crate::{Error, Hash, Leaf, MiniHash, Result, parent_hash, rehash};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Leaf count, forest rows and root hashes.
pub const MISC_FILE: &str = "miscforestfile.dat";

/// Height of the last block applied to the persisted forest.
pub const SYNCED_HEIGHT_FILE: &str = "forestlastsyncedheight.dat";

/// Everything needed to revert one [`Forest::modify`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UndoBlock {
    pub num_adds: u64,
    pub prev_num_leaves: u64,
    /// Deleted positions with the leaf hash they held.
    pub deleted: Vec<(u64, Hash)>,
    /// Subtree swaps of the removal, in application order.
    pub swaps: Vec<(u8, Arrow)>,
}

/// The full accumulator, holding every node of every tree.
pub struct Forest {
    data: ForestData,
    config: BackendConfig,
    num_leaves: u64,
    rows: u8,
    position_map: HashMap<MiniHash, u64>,
}

/// [`NodeStore`] view of the forest keeping the position map in sync with leaf moves.
struct ForestStore<'a> {
    data: &'a mut ForestData,
    position_map: &'a mut HashMap<MiniHash, u64>,
    rows: u8,
}

impl NodeStore for ForestStore<'_> {
    fn forest_rows(&self) -> u8 {
        self.rows
    }

    fn read(&mut self, position: u64) -> Result<Hash> {
        self.data.read(position)
    }

    fn write(&mut self, position: u64, hash: Hash) -> Result<()> {
        self.data.write(position, hash)
    }

    fn swap_subtrees(&mut self, a: u64, b: u64, row: u8) -> Result<()> {
        for r in (0..=row).rev() {
            let (start_a, width) = subtree_row_range(a, row, r, self.rows);
            let (start_b, _) = subtree_row_range(b, row, r, self.rows);

            if r == 0 {
                for offset in 0..width {
                    let leaf_a = self.data.read(start_a + offset)?;
                    let leaf_b = self.data.read(start_b + offset)?;
                    if !leaf_a.is_zero() {
                        self.position_map.insert(leaf_a.mini(), start_b + offset);
                    }
                    if !leaf_b.is_zero() {
                        self.position_map.insert(leaf_b.mini(), start_a + offset);
                    }
                }
            }

            self.data.swap_hash_range(start_a, start_b, width)?;
        }
        Ok(())
    }

    fn rehash_row(&mut self, positions: &[u64]) -> Result<()> {
        let mut children = Vec::with_capacity(positions.len());
        for &position in positions {
            children.push((
                self.data.read(left_child(position, self.rows))?,
                self.data.read(right_child(position, self.rows))?,
            ));
        }

        let hashes: Vec<Hash> = children
            .par_iter()
            .map(|(left, right)| rehash(left, right))
            .collect();

        for (&position, hash) in positions.iter().zip(hashes) {
            self.data.write(position, hash)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_dels(dels: &[u64], num_leaves: u64) -> Result<()> {
    if dels.windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::BadInput(
            "deletions must be strictly ascending".to_string(),
        ));
    }
    match dels.last() {
        Some(&last) if last >= num_leaves => Err(Error::OutOfRange {
            position: last,
            num_leaves,
        }),
        _ => Ok(()),
    }
}

pub(crate) fn validate_adds(adds: &[Leaf]) -> Result<()> {
    if adds.iter().any(|leaf| leaf.hash.is_zero()) {
        return Err(Error::BadInput("cannot add an empty leaf".to_string()));
    }
    Ok(())
}

impl Forest {
    /// Creates an empty forest on a fresh backend.
    pub fn new(config: BackendConfig) -> Result<Self> {
        let data = ForestData::create(&config, forest_size(0))?;
        Ok(Self {
            data,
            config,
            num_leaves: 0,
            rows: 0,
            position_map: HashMap::new(),
        })
    }

    pub fn num_leaves(&self) -> u64 {
        self.num_leaves
    }

    pub fn rows(&self) -> u8 {
        self.rows
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Root hashes, highest row first.
    pub fn roots(&mut self) -> Result<Vec<Hash>> {
        root_positions(self.num_leaves, self.rows)
            .into_iter()
            .map(|(_, position)| self.data.read(position))
            .collect()
    }

    /// Hash at `position`.
    pub fn read(&mut self, position: u64) -> Result<Hash> {
        self.data.read(position)
    }

    /// Current row-0 position of the leaf hashing to `hash`.
    pub fn position_of(&self, hash: &Hash) -> Option<u64> {
        self.position_map.get(&hash.mini()).copied()
    }

    pub fn position_map_len(&self) -> usize {
        self.position_map.len()
    }

    /// Appends `leaves` to the right of the forest.
    pub fn add(&mut self, leaves: &[Leaf]) -> Result<()> {
        validate_adds(leaves)?;
        while self.num_leaves + leaves.len() as u64 > 1u64 << self.rows {
            self.remap(self.rows + 1)?;
        }
        for leaf in leaves {
            self.add_one(leaf.hash)?;
        }
        Ok(())
    }

    fn add_one(&mut self, leaf: Hash) -> Result<()> {
        let mut position = self.num_leaves;
        let mut hash = leaf;

        self.data.write(position, hash)?;
        self.position_map.insert(leaf.mini(), position);

        let mut row = 0;
        while root_present(self.num_leaves, row) {
            let root = self.data.read(root_position(self.num_leaves, row, self.rows))?;
            hash = parent_hash(&root, &hash);
            position = parent(position, self.rows);
            self.data.write(position, hash)?;
            row += 1;
        }

        self.num_leaves += 1;
        Ok(())
    }

    /// Deletes the leaves at `dels`, then appends `adds`.
    pub fn modify(&mut self, adds: &[Leaf], dels: &[u64]) -> Result<UndoBlock> {
        validate_dels(dels, self.num_leaves)?;
        validate_adds(adds)?;

        let prev_num_leaves = self.num_leaves;
        let next_num_leaves = self.num_leaves + adds.len() as u64 - dels.len() as u64;
        while next_num_leaves > 1u64 << self.rows {
            self.remap(self.rows + 1)?;
        }

        let (deleted, swaps) = self.remove(dels)?;
        self.add(adds)?;

        Ok(UndoBlock {
            num_adds: adds.len() as u64,
            prev_num_leaves,
            deleted,
            swaps,
        })
    }

    fn remove(&mut self, dels: &[u64]) -> Result<(Vec<(u64, Hash)>, Vec<(u8, Arrow)>)> {
        if dels.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut deleted = Vec::with_capacity(dels.len());
        for &position in dels {
            let hash = self.data.read(position)?;
            if hash.is_zero() {
                return Err(Error::Inconsistent(format!(
                    "deleting empty leaf at {position}"
                )));
            }
            deleted.push((position, hash));
        }

        let plan = remove_transform(dels, self.num_leaves, self.rows);
        let mut store = ForestStore {
            data: &mut self.data,
            position_map: &mut self.position_map,
            rows: self.rows,
        };
        let swaps = execute_plan(&mut store, &plan)?;

        // Deleted leaves are zeroed before any swap, so no move re-maps them.
        for (position, hash) in &deleted {
            let mini = hash.mini();
            if self.position_map.get(&mini) == Some(position) {
                self.position_map.remove(&mini);
            }
        }
        self.num_leaves -= dels.len() as u64;
        Ok((deleted, swaps))
    }

    /// Reverts the [`Forest::modify`] that returned `undo`.
    pub fn undo(&mut self, undo: &UndoBlock) -> Result<()> {
        let Some(first_add) = self.num_leaves.checked_sub(undo.num_adds) else {
            return Err(Error::Inconsistent(format!(
                "undoing {} adds with {} leaves",
                undo.num_adds, self.num_leaves
            )));
        };

        for position in first_add..self.num_leaves {
            let hash = self.data.read(position)?;
            self.position_map.remove(&hash.mini());
            self.data.write(position, Hash::ZERO)?;
        }
        self.num_leaves = first_add;

        let mut store = ForestStore {
            data: &mut self.data,
            position_map: &mut self.position_map,
            rows: self.rows,
        };
        for (row, arrow) in undo.swaps.iter().rev() {
            store.swap_subtrees(arrow.from, arrow.to, *row)?;
        }

        for (position, hash) in &undo.deleted {
            self.data.write(*position, *hash)?;
            self.position_map.insert(hash.mini(), *position);
        }

        self.num_leaves = undo.prev_num_leaves;
        self.rebuild_interior()
    }

    /// Recomputes every interior node of the current trees.
    fn rebuild_interior(&mut self) -> Result<()> {
        let mut store = ForestStore {
            data: &mut self.data,
            position_map: &mut self.position_map,
            rows: self.rows,
        };
        for row in 1..=self.rows {
            let start = row_offset(row, self.rows);
            let positions: Vec<u64> = (start..start + (self.num_leaves >> row)).collect();
            if positions.is_empty() {
                break;
            }
            store.rehash_row(&positions)?;
        }
        Ok(())
    }

    /// Proves the leaves hashing to `hashes`; targets keep the order of `hashes`.
    pub fn prove_batch(&mut self, hashes: &[Hash]) -> Result<BatchProof> {
        let mut targets = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let position = self.position_of(hash).ok_or(Error::ProofMissing(*hash))?;
            if self.data.read(position)? != *hash {
                return Err(Error::ProofMissing(*hash));
            }
            targets.push(position);
        }

        let mut sorted = targets.clone();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::BadInput("duplicate leaf in proof request".to_string()));
        }

        let proof = proof_positions(&sorted, self.num_leaves, self.rows)
            .into_iter()
            .map(|position| self.data.read(position))
            .collect::<Result<Vec<_>>>()?;

        Ok(BatchProof { targets, proof })
    }

    /// Checks `proof` for the leaves `hashes` against the current roots.
    pub fn verify_batch_proof(&mut self, hashes: &[Hash], proof: &BatchProof) -> Result<()> {
        let roots = self.roots()?;
        proof::verify(proof, hashes, &roots, self.num_leaves, self.rows).map(|_| ())
    }

    /// Grows the forest to `new_rows`, moving every interior row to its new offset.
    fn remap(&mut self, new_rows: u8) -> Result<()> {
        let old_rows = self.rows;
        self.data.resize(forest_size(new_rows))?;

        for row in (1..=old_rows).rev() {
            let old_start = row_offset(row, old_rows);
            let new_start = row_offset(row, new_rows);
            for offset in 0..1u64 << (old_rows - row) {
                let hash = self.data.read(old_start + offset)?;
                self.data.write(new_start + offset, hash)?;
            }
        }

        // The old interior region is now leaf space past the old capacity.
        for position in 1u64 << old_rows..forest_size(old_rows) {
            self.data.write(position, Hash::ZERO)?;
        }

        self.rows = new_rows;

        tracing::debug!(old_rows, new_rows, num_leaves = self.num_leaves, "Remapped forest");

        Ok(())
    }

    /// Flushes the backend and records the forest shape along with `synced_height`.
    pub fn persist(&mut self, synced_height: i32) -> Result<()> {
        self.data.flush()?;

        let roots = self.roots()?;
        let mut misc = Vec::with_capacity(9 + roots.len() * 32);
        misc.extend_from_slice(&self.num_leaves.to_be_bytes());
        misc.push(self.rows);
        for root in &roots {
            misc.extend_from_slice(&root.0);
        }
        write_synced(&self.config.dir.join(MISC_FILE), &misc)?;
        write_synced(
            &self.config.dir.join(SYNCED_HEIGHT_FILE),
            &synced_height.to_be_bytes(),
        )?;

        tracing::debug!(
            num_leaves = self.num_leaves,
            rows = self.rows,
            synced_height,
            "Persisted forest"
        );

        Ok(())
    }

    /// Reopens a forest written by [`Forest::persist`], returning it with its synced height.
    pub fn restore(config: BackendConfig) -> Result<(Self, i32)> {
        let mut misc = Vec::new();
        File::open(config.dir.join(MISC_FILE))?.read_to_end(&mut misc)?;
        if misc.len() < 9 {
            return Err(Error::Inconsistent(format!(
                "{MISC_FILE} is only {} bytes",
                misc.len()
            )));
        }
        let mut num_leaves_bytes = [0u8; 8];
        num_leaves_bytes.copy_from_slice(&misc[..8]);
        let num_leaves = u64::from_be_bytes(num_leaves_bytes);
        let rows = misc[8];

        if misc.len() - 9 != num_leaves.count_ones() as usize * 32 {
            return Err(Error::Inconsistent(format!(
                "{MISC_FILE} holds {} root bytes for {num_leaves} leaves",
                misc.len() - 9
            )));
        }
        let stored_roots: Vec<Hash> = misc[9..]
            .chunks_exact(32)
            .map(|chunk| {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(chunk);
                Hash(hash)
            })
            .collect();

        let mut height_bytes = [0u8; 4];
        File::open(config.dir.join(SYNCED_HEIGHT_FILE))?.read_exact(&mut height_bytes)?;
        let synced_height = i32::from_be_bytes(height_bytes);

        let data = ForestData::open(&config)?;
        if data.size() != forest_size(rows) {
            return Err(Error::Inconsistent(format!(
                "backend holds {} slots, {rows} rows need {}",
                data.size(),
                forest_size(rows)
            )));
        }

        let mut forest = Self {
            data,
            config,
            num_leaves,
            rows,
            position_map: HashMap::with_capacity(num_leaves as usize),
        };

        for position in 0..num_leaves {
            let hash = forest.data.read(position)?;
            if hash.is_zero() {
                return Err(Error::Inconsistent(format!("empty leaf at {position}")));
            }
            forest.position_map.insert(hash.mini(), position);
        }

        if forest.roots()? != stored_roots {
            return Err(Error::Inconsistent(
                "stored roots differ from the backend".to_string(),
            ));
        }

        tracing::info!(num_leaves, rows, synced_height, kind = ?forest.data.kind(), "Restored forest");

        Ok((forest, synced_height))
    }

    /// Closes the backend.
    pub fn close(mut self) -> Result<()> {
        self.data.close()
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}
