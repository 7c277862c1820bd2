//! Sparse accumulator holding the roots and the branches of remembered leaves.
//!
//! Nodes live in an arena addressed by [`NodeIdx`]; a position index maps
//! forest positions to arena slots. A subtree swap moves index entries and
//! never touches the nodes themselves.

use crate::forest::{validate_adds, validate_dels};
use crate::position::{
    detect_row, parent, remap_position, root_position, root_positions,
    root_present, sibling,
};
use crate::proof::{self, BatchProof, proof_positions};
use crate::store::{NodeStore, execute_plan};
use crate::transform::{remove_transform, subtree_row_range};
use crate::{Error, Hash, Leaf, Result, parent_hash};
use std::collections::{BTreeMap, BTreeSet};

/// Index of a node in the pollard arena.
pub type NodeIdx = u32;

#[derive(Clone, Copy, Debug)]
struct PolNode {
    hash: Hash,
    remember: bool,
}

#[derive(Default)]
pub struct Pollard {
    nodes: Vec<PolNode>,
    free: Vec<NodeIdx>,
    index: BTreeMap<u64, NodeIdx>,
    num_leaves: u64,
    rows: u8,
}

impl Pollard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_leaves(&self) -> u64 {
        self.num_leaves
    }

    pub fn rows(&self) -> u8 {
        self.rows
    }

    /// Number of resident nodes.
    pub fn resident(&self) -> usize {
        self.index.len()
    }

    /// Hash at `position` if it is resident.
    pub fn read(&self, position: u64) -> Option<Hash> {
        self.index.get(&position).map(|&idx| self.nodes[idx as usize].hash)
    }

    /// Whether the leaf at `position` is kept across modifications.
    pub fn is_remembered(&self, position: u64) -> bool {
        self.index
            .get(&position)
            .is_some_and(|&idx| self.nodes[idx as usize].remember)
    }

    /// Root hashes, highest row first.
    pub fn roots(&self) -> Result<Vec<Hash>> {
        root_positions(self.num_leaves, self.rows)
            .into_iter()
            .map(|(_, position)| self.read(position).ok_or(Error::NodeMissing(position)))
            .collect()
    }

    fn alloc(&mut self, node: PolNode) -> NodeIdx {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as NodeIdx
            }
        }
    }

    fn set(&mut self, position: u64, hash: Hash) {
        match self.index.get(&position) {
            Some(&idx) => self.nodes[idx as usize].hash = hash,
            None => {
                let idx = self.alloc(PolNode {
                    hash,
                    remember: false,
                });
                self.index.insert(position, idx);
            }
        }
    }

    /// Checks `proof` for the leaves `hashes` against the roots and keeps every node it yields.
    pub fn ingest_batch_proof(&mut self, hashes: &[Hash], proof: &BatchProof) -> Result<()> {
        let roots = self.roots()?;
        let reconstructed = proof::verify(proof, hashes, &roots, self.num_leaves, self.rows)?;

        for (position, hash) in reconstructed.nodes {
            match self.read(position) {
                Some(resident) if resident != hash => {
                    return Err(Error::Inconsistent(format!(
                        "resident node {position} is {resident}, proof says {hash}"
                    )));
                }
                Some(_) => {}
                None => self.set(position, hash),
            }
        }
        Ok(())
    }

    /// Proves the resident leaves at `targets`.
    pub fn prove_batch(&self, targets: &[u64]) -> Result<BatchProof> {
        let mut sorted = targets.to_vec();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::BadInput("duplicate leaf in proof request".to_string()));
        }
        if let Some(&last) = sorted.last() {
            if last >= self.num_leaves {
                return Err(Error::OutOfRange {
                    position: last,
                    num_leaves: self.num_leaves,
                });
            }
        }

        let proof = proof_positions(&sorted, self.num_leaves, self.rows)
            .into_iter()
            .map(|position| self.read(position).ok_or(Error::NodeMissing(position)))
            .collect::<Result<Vec<_>>>()?;

        Ok(BatchProof {
            targets: targets.to_vec(),
            proof,
        })
    }

    pub fn verify_batch_proof(&self, hashes: &[Hash], proof: &BatchProof) -> Result<()> {
        let roots = self.roots()?;
        proof::verify(proof, hashes, &roots, self.num_leaves, self.rows).map(|_| ())
    }

    /// Deletes the leaves at `dels`, appends `adds` and prunes what is no longer needed.
    ///
    /// The proof for `dels` must have been ingested beforehand.
    pub fn modify(&mut self, adds: &[Leaf], dels: &[u64]) -> Result<()> {
        validate_dels(dels, self.num_leaves)?;
        validate_adds(adds)?;

        let next_num_leaves = self.num_leaves + adds.len() as u64 - dels.len() as u64;
        while next_num_leaves > 1u64 << self.rows {
            self.remap(self.rows + 1);
        }

        if !dels.is_empty() {
            for &position in dels {
                match self.read(position) {
                    Some(hash) if !hash.is_zero() => {}
                    _ => return Err(Error::NodeMissing(position)),
                }
            }
            let plan = remove_transform(dels, self.num_leaves, self.rows);
            execute_plan(&mut PollardStore { pollard: self }, &plan)?;
            self.num_leaves -= dels.len() as u64;
        }

        for leaf in adds {
            self.add_one(leaf)?;
        }

        self.prune();
        Ok(())
    }

    fn add_one(&mut self, leaf: &Leaf) -> Result<()> {
        let mut position = self.num_leaves;
        let mut hash = leaf.hash;

        let idx = self.alloc(PolNode {
            hash,
            remember: leaf.remember,
        });
        if let Some(old) = self.index.insert(position, idx) {
            self.free.push(old);
        }

        let mut row = 0;
        while root_present(self.num_leaves, row) {
            let root_pos = root_position(self.num_leaves, row, self.rows);
            let root = self.read(root_pos).ok_or(Error::NodeMissing(root_pos))?;
            hash = parent_hash(&root, &hash);
            position = parent(position, self.rows);
            self.set(position, hash);
            row += 1;
        }

        self.num_leaves += 1;
        Ok(())
    }

    fn remap(&mut self, new_rows: u8) {
        let old_rows = self.rows;
        let index = std::mem::take(&mut self.index);
        self.index = index
            .into_iter()
            .map(|(position, idx)| (remap_position(position, old_rows, new_rows), idx))
            .collect();
        self.rows = new_rows;
    }

    /// Drops every node other than the roots and the branches of remembered leaves.
    fn prune(&mut self) {
        let mut keep: BTreeSet<u64> = root_positions(self.num_leaves, self.rows)
            .into_iter()
            .map(|(_, position)| position)
            .collect();

        let remembered: Vec<u64> = self
            .index
            .range(..self.num_leaves)
            .filter(|&(_, &idx)| {
                let node = &self.nodes[idx as usize];
                node.remember && !node.hash.is_zero()
            })
            .map(|(&position, _)| position)
            .collect();

        for leaf in remembered {
            let mut position = leaf;
            while keep.insert(position) {
                let row = detect_row(position, self.rows);
                if root_present(self.num_leaves, row)
                    && position == root_position(self.num_leaves, row, self.rows)
                {
                    break;
                }
                keep.insert(sibling(position));
                position = parent(position, self.rows);
            }
        }

        let dropped: Vec<u64> = self
            .index
            .keys()
            .filter(|position| !keep.contains(position))
            .copied()
            .collect();
        for position in dropped {
            if let Some(idx) = self.index.remove(&position) {
                self.free.push(idx);
            }
        }

        // Leave the arena alone unless most of it is garbage.
        if self.free.len() > 1024 && self.free.len() > self.index.len() * 4 {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let mut nodes = Vec::with_capacity(self.index.len());
        for idx in self.index.values_mut() {
            nodes.push(self.nodes[*idx as usize]);
            *idx = (nodes.len() - 1) as NodeIdx;
        }
        self.nodes = nodes;
        self.free.clear();
    }
}

struct PollardStore<'a> {
    pollard: &'a mut Pollard,
}

impl NodeStore for PollardStore<'_> {
    fn forest_rows(&self) -> u8 {
        self.pollard.rows
    }

    fn read(&mut self, position: u64) -> Result<Hash> {
        self.pollard.read(position).ok_or(Error::NodeMissing(position))
    }

    fn write(&mut self, position: u64, hash: Hash) -> Result<()> {
        self.pollard.set(position, hash);
        Ok(())
    }

    fn swap_subtrees(&mut self, a: u64, b: u64, row: u8) -> Result<()> {
        let rows = self.pollard.rows;
        let mut moved = Vec::new();

        for r in 0..=row {
            let (start_a, width) = subtree_row_range(a, row, r, rows);
            let (start_b, _) = subtree_row_range(b, row, r, rows);
            for (from, to) in [(start_a, start_b), (start_b, start_a)] {
                let positions: Vec<u64> = self
                    .pollard
                    .index
                    .range(from..from + width)
                    .map(|(&position, _)| position)
                    .collect();
                for position in positions {
                    if let Some(idx) = self.pollard.index.remove(&position) {
                        moved.push((position - from + to, idx));
                    }
                }
            }
        }

        for (position, idx) in moved {
            self.pollard.index.insert(position, idx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Forest;
    use crate::backend::{BackendConfig, ForestKind};

    fn random_leaf(rng: &mut fastrand::Rng, remember: bool) -> Leaf {
        let mut hash = [0u8; 32];
        rng.fill(&mut hash);
        hash[0] |= 1;
        Leaf::new(Hash(hash), remember)
    }

    #[test]
    fn pollard_tracks_forest_roots() {
        let mut rng = fastrand::Rng::with_seed(21);
        let dir = tempfile::tempdir().unwrap();
        let mut forest = Forest::new(BackendConfig::new(ForestKind::Ram, dir.path())).unwrap();
        let mut pollard = Pollard::new();

        for _ in 0..80 {
            let num_leaves = forest.num_leaves();
            let dels: Vec<u64> = (0..num_leaves).filter(|_| rng.u8(0..4) == 0).collect();
            let del_hashes: Vec<Hash> = dels.iter().map(|&p| forest.read(p).unwrap()).collect();
            let adds: Vec<Leaf> = (0..rng.usize(0..25))
                .map(|_| {
                    let remember = rng.bool();
                    random_leaf(&mut rng, remember)
                })
                .collect();

            let proof = forest.prove_batch(&del_hashes).unwrap();
            pollard.ingest_batch_proof(&del_hashes, &proof).unwrap();
            pollard.modify(&adds, &dels).unwrap();
            forest.modify(&adds, &dels).unwrap();

            assert_eq!(pollard.num_leaves(), forest.num_leaves());
            assert_eq!(pollard.roots().unwrap(), forest.roots().unwrap());
        }
    }

    #[test]
    fn forgetful_pollard_keeps_only_roots() {
        let mut rng = fastrand::Rng::with_seed(1);
        let mut pollard = Pollard::new();
        let leaves: Vec<Leaf> = (0..13).map(|_| random_leaf(&mut rng, false)).collect();
        pollard.modify(&leaves, &[]).unwrap();
        assert_eq!(pollard.resident(), 3);
        assert_eq!(pollard.roots().unwrap().len(), 3);
    }

    #[test]
    fn remembered_leaves_can_be_proven() {
        let mut rng = fastrand::Rng::with_seed(8);
        let dir = tempfile::tempdir().unwrap();
        let mut forest = Forest::new(BackendConfig::new(ForestKind::Ram, dir.path())).unwrap();
        let mut pollard = Pollard::new();

        let leaves: Vec<Leaf> = (0..32)
            .map(|i| random_leaf(&mut rng, i % 5 == 0))
            .collect();
        forest.modify(&leaves, &[]).unwrap();
        pollard.modify(&leaves, &[]).unwrap();

        for (position, leaf) in leaves.iter().enumerate() {
            assert_eq!(pollard.is_remembered(position as u64), leaf.remember);
        }

        let targets = [0u64, 5, 10, 30];
        let proof = pollard.prove_batch(&targets).unwrap();
        let hashes: Vec<Hash> = targets.iter().map(|&t| leaves[t as usize].hash).collect();
        forest.verify_batch_proof(&hashes, &proof).unwrap();

        // Leaf 1 is the sibling of a remembered leaf, leaf 2 is not cached at all.
        assert!(pollard.prove_batch(&[1]).is_ok());
        assert!(matches!(
            pollard.prove_batch(&[2]),
            Err(Error::NodeMissing(_))
        ));
    }

    #[test]
    fn deleting_without_proof_fails() {
        let mut rng = fastrand::Rng::with_seed(2);
        let mut pollard = Pollard::new();
        let leaves: Vec<Leaf> = (0..8).map(|_| random_leaf(&mut rng, false)).collect();
        pollard.modify(&leaves, &[]).unwrap();
        assert!(matches!(
            pollard.modify(&[], &[3]),
            Err(Error::NodeMissing(3))
        ));
    }

    #[test]
    fn ingest_rejects_foreign_proof() {
        let mut rng = fastrand::Rng::with_seed(4);
        let dir = tempfile::tempdir().unwrap();
        let mut forest = Forest::new(BackendConfig::new(ForestKind::Ram, dir.path())).unwrap();
        let mut pollard = Pollard::new();

        let leaves: Vec<Leaf> = (0..10).map(|_| random_leaf(&mut rng, false)).collect();
        forest.add(&leaves).unwrap();
        // The pollard saw a different set.
        let other: Vec<Leaf> = (0..10).map(|_| random_leaf(&mut rng, false)).collect();
        pollard.modify(&other, &[]).unwrap();

        let proof = forest.prove_batch(&[leaves[4].hash]).unwrap();
        assert!(matches!(
            pollard.ingest_batch_proof(&[leaves[4].hash], &proof),
            Err(Error::ProofInvalid(_))
        ));
    }
}
