//! Batch inclusion proofs.
//!
//! The proof hashes of a [`BatchProof`] follow a canonical order: walking the
//! rows bottom-up, the siblings needed at each row in ascending position
//! order, skipping siblings that are themselves targets or computed from
//! targets. The order does not depend on the number of forest rows, which
//! lets the prover and the verifier disagree on their forest height.

use crate::position::{parent, root_position, root_present, sibling};
use crate::{Error, Hash, Result, parent_hash};
use std::collections::BTreeMap;

/// Positions of the leaves being proven and the hashes needed to reach their roots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchProof {
    /// Leaf positions, in the order the caller asked for them.
    pub targets: Vec<u64>,
    pub proof: Vec<Hash>,
}

/// Every node recovered from a proof.
#[derive(Clone, Debug, Default)]
pub struct Reconstructed {
    pub nodes: BTreeMap<u64, Hash>,
    /// `(row, hash)` of the roots reached by the targets.
    pub roots: Vec<(u8, Hash)>,
}

/// Positions of the proof hashes for the sorted, distinct `targets`.
pub fn proof_positions(targets: &[u64], num_leaves: u64, forest_rows: u8) -> Vec<u64> {
    let mut positions = Vec::new();
    let mut row_targets = targets.to_vec();

    for row in 0..=forest_rows {
        if row_targets.is_empty() {
            break;
        }
        let root = root_present(num_leaves, row).then(|| root_position(num_leaves, row, forest_rows));

        let mut next = Vec::with_capacity(row_targets.len());
        let mut i = 0;
        while i < row_targets.len() {
            let pos = row_targets[i];
            if Some(pos) == root {
                i += 1;
                continue;
            }
            if row_targets.get(i + 1) == Some(&sibling(pos)) {
                i += 2;
            } else {
                positions.push(sibling(pos));
                i += 1;
            }
            next.push(parent(pos, forest_rows));
        }
        row_targets = next;
    }

    positions
}

/// Recomputes every node on the paths from the targets to their roots.
///
/// `target_hashes[i]` is the leaf hash expected at `proof.targets[i]`.
pub fn reconstruct(
    proof: &BatchProof,
    target_hashes: &[Hash],
    num_leaves: u64,
    forest_rows: u8,
) -> Result<Reconstructed> {
    if proof.targets.len() != target_hashes.len() {
        return Err(Error::ProofMalformed(format!(
            "{} targets but {} leaf hashes",
            proof.targets.len(),
            target_hashes.len()
        )));
    }

    let mut row_nodes: Vec<(u64, Hash)> = proof
        .targets
        .iter()
        .copied()
        .zip(target_hashes.iter().copied())
        .collect();
    row_nodes.sort_unstable_by_key(|(pos, _)| *pos);

    if let Some(&(last, _)) = row_nodes.last() {
        if last >= num_leaves {
            return Err(Error::OutOfRange {
                position: last,
                num_leaves,
            });
        }
    }
    if row_nodes.windows(2).any(|w| w[0].0 == w[1].0) {
        return Err(Error::ProofMalformed("duplicate target".to_string()));
    }

    let mut hashes = proof.proof.iter();
    let mut out = Reconstructed::default();

    for row in 0..=forest_rows {
        if row_nodes.is_empty() {
            break;
        }
        let root = root_present(num_leaves, row).then(|| root_position(num_leaves, row, forest_rows));

        let mut next = Vec::with_capacity(row_nodes.len());
        let mut i = 0;
        while i < row_nodes.len() {
            let (pos, hash) = row_nodes[i];
            out.nodes.insert(pos, hash);

            if Some(pos) == root {
                out.roots.push((row, hash));
                i += 1;
                continue;
            }

            let sibling_hash = match row_nodes.get(i + 1) {
                Some(&(next_pos, next_hash)) if next_pos == sibling(pos) => {
                    i += 2;
                    next_hash
                }
                _ => {
                    let hash = hashes.next().ok_or_else(|| {
                        Error::ProofMalformed(format!("missing sibling of position {pos}"))
                    })?;
                    i += 1;
                    *hash
                }
            };
            out.nodes.insert(sibling(pos), sibling_hash);

            let up = if pos & 1 == 0 {
                parent_hash(&hash, &sibling_hash)
            } else {
                parent_hash(&sibling_hash, &hash)
            };
            next.push((parent(pos, forest_rows), up));
        }
        row_nodes = next;
    }

    if !row_nodes.is_empty() {
        return Err(Error::Inconsistent(format!(
            "targets climbed past {forest_rows} rows"
        )));
    }

    let extra = hashes.count();
    if extra > 0 {
        return Err(Error::ProofMalformed(format!("{extra} unused proof hashes")));
    }

    out.roots.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    Ok(out)
}

/// Reconstructs `proof` and checks every reached root against `roots`.
///
/// `roots` holds the accumulator roots highest row first.
pub fn verify(
    proof: &BatchProof,
    target_hashes: &[Hash],
    roots: &[Hash],
    num_leaves: u64,
    forest_rows: u8,
) -> Result<Reconstructed> {
    let reconstructed = reconstruct(proof, target_hashes, num_leaves, forest_rows)?;

    let root_rows: Vec<u8> = (0..=forest_rows)
        .rev()
        .filter(|&row| root_present(num_leaves, row))
        .collect();
    if root_rows.len() != roots.len() {
        return Err(Error::Inconsistent(format!(
            "{} roots for {num_leaves} leaves",
            roots.len()
        )));
    }

    for (row, hash) in &reconstructed.roots {
        let expected = root_rows
            .iter()
            .position(|r| r == row)
            .map(|index| roots[index])
            .ok_or_else(|| Error::ProofInvalid(format!("no root at row {row}")))?;
        if expected != *hash {
            return Err(Error::ProofInvalid(format!(
                "row {row} root mismatch: computed {hash}, expected {expected}"
            )));
        }
    }

    Ok(reconstructed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(i: u8) -> Hash {
        Hash([i + 1; 32])
    }

    #[test]
    fn positions_skip_targets_and_computed_nodes() {
        // 8 leaves, 3 rows: proving 0 needs 1, 9 and 13.
        assert_eq!(proof_positions(&[0], 8, 3), vec![1, 9, 13]);
        // 0 and 1 are twins: 9 and 13.
        assert_eq!(proof_positions(&[0, 1], 8, 3), vec![9, 13]);
        // 0 and 3: 1, 2 then 8 and 9 are computed, then 13.
        assert_eq!(proof_positions(&[0, 3], 8, 3), vec![1, 2, 13]);
        // A root proves itself.
        assert_eq!(proof_positions(&[4], 5, 3), Vec::<u64>::new());
    }

    #[test]
    fn positions_are_row_independent() {
        let shallow = proof_positions(&[2, 5], 7, 3);
        let deep = proof_positions(&[2, 5], 7, 5);
        assert_eq!(shallow.len(), deep.len());
        for (a, b) in shallow.iter().zip(&deep) {
            assert_eq!(
                crate::position::detect_row(*a, 3),
                crate::position::detect_row(*b, 5)
            );
        }
    }

    #[test]
    fn reconstruct_two_leaves() {
        let l0 = leaf(0);
        let l1 = leaf(1);
        let root = parent_hash(&l0, &l1);
        let proof = BatchProof {
            targets: vec![1],
            proof: vec![l0],
        };
        let out = verify(&proof, &[l1], &[root], 2, 1).unwrap();
        assert_eq!(out.roots, vec![(1, root)]);
        assert_eq!(out.nodes.get(&0), Some(&l0));

        let err = verify(&proof, &[l0], &[root], 2, 1).unwrap_err();
        assert!(matches!(err, Error::ProofInvalid(_)));
    }

    #[test]
    fn reconstruct_rejects_wrong_hash_counts() {
        let proof = BatchProof {
            targets: vec![0],
            proof: vec![],
        };
        assert!(matches!(
            reconstruct(&proof, &[leaf(0)], 2, 1),
            Err(Error::ProofMalformed(_))
        ));

        let proof = BatchProof {
            targets: vec![0],
            proof: vec![leaf(1), leaf(2)],
        };
        assert!(matches!(
            reconstruct(&proof, &[leaf(0)], 2, 1),
            Err(Error::ProofMalformed(_))
        ));

        let proof = BatchProof {
            targets: vec![2],
            proof: vec![],
        };
        assert!(matches!(
            reconstruct(&proof, &[leaf(0)], 2, 1),
            Err(Error::OutOfRange { .. })
        ));
    }
}
