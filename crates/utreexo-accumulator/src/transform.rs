//! Planning of batch deletions.
//!
//! A deletion never moves single hashes around: every step of a [`RemovePlan`]
//! is a subtree swap, a zeroing of a dead node or a re-hash of a live node.
//! The plan only depends on the deleted positions and the forest shape, so
//! the full forest and the pollard execute the very same plan.

use crate::position::{
    child_many, in_forest, parent, root_position, root_positions, root_present, sibling,
    translate_swap,
};

/// Move of the subtree rooted at `from` into `to`; the subtree at `to` goes to `from`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Arrow {
    pub from: u64,
    pub to: u64,
}

impl Arrow {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }
}

/// Work to perform on a single row, in order: zero `dead`, re-hash `rehash`, apply `swaps`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowPlan {
    pub row: u8,
    /// Positions whose children changed on the row below.
    pub rehash: Vec<u64>,
    /// Positions no longer holding live data, sorted.
    pub dead: Vec<u64>,
    pub swaps: Vec<Arrow>,
}

/// Final move of a surviving root into its slot of the shrunk forest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocation {
    pub row: u8,
    pub arrow: Arrow,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemovePlan {
    pub rows: Vec<RowPlan>,
    pub relocations: Vec<Relocation>,
}

impl RemovePlan {
    /// Every subtree swap of the plan in execution order.
    pub fn swap_log(&self) -> Vec<(u8, Arrow)> {
        self.rows
            .iter()
            .flat_map(|row_plan| row_plan.swaps.iter().map(|arrow| (row_plan.row, *arrow)))
            .chain(self.relocations.iter().map(|r| (r.row, r.arrow)))
            .collect()
    }
}

/// Splits sorted positions of a single row into the parents of twin pairs and the lonely rest.
///
/// A twin is a pair `p, p ^ 1` where both are present.
pub fn ex_twin(dels: &[u64], forest_rows: u8) -> (Vec<u64>, Vec<u64>) {
    let mut parents = Vec::new();
    let mut lonely = Vec::new();
    let mut i = 0;
    while i < dels.len() {
        let pos = dels[i];
        if pos & 1 == 0 && dels.get(i + 1) == Some(&sibling(pos)) {
            parents.push(parent(pos, forest_rows));
            i += 2;
        } else {
            lonely.push(pos);
            i += 1;
        }
    }
    (parents, lonely)
}

/// Sorted union of the dirty positions and the arrow destinations.
pub fn dedupe_swap_dirt(dirt: &[u64], swaps: &[Arrow]) -> Vec<u64> {
    let mut merged: Vec<u64> = dirt.iter().copied().chain(swaps.iter().map(|a| a.to)).collect();
    merged.sort_unstable();
    merged.dedup();
    merged
}

/// Plans the deletion of the sorted, distinct leaf positions `dels`.
///
/// `dels` must be validated by the caller: strictly ascending and below `num_leaves`.
pub fn remove_transform(dels: &[u64], num_leaves: u64, forest_rows: u8) -> RemovePlan {
    let next_num_leaves = num_leaves - dels.len() as u64;

    let mut plan = RemovePlan::default();
    let mut dead = dels.to_vec();
    let mut dirty: Vec<u64> = Vec::new();
    // Subtrees cut loose from their deleted sibling, waiting to become roots.
    let mut floaters: Vec<(u8, u64)> = Vec::new();
    let mut removed_roots = vec![false; forest_rows as usize + 1];

    for row in 0..=forest_rows {
        if dead.is_empty() && dirty.is_empty() {
            break;
        }

        let mut row_plan = RowPlan {
            row,
            rehash: dirty.clone(),
            dead: dead.clone(),
            swaps: Vec::new(),
        };

        let mut root = root_present(num_leaves, row)
            .then(|| root_position(num_leaves, row, forest_rows));

        if root.is_some() && dead.last() == root.as_ref() {
            dead.pop();
            root = None;
            removed_roots[row as usize] = true;
        }

        let (mut next_dead, lonely) = ex_twin(&dead, forest_rows);

        let mut pairs = lonely.chunks_exact(2);
        for pair in &mut pairs {
            let (a, b) = (pair[0], pair[1]);
            row_plan.swaps.push(Arrow::new(sibling(b), a));
            next_dead.push(parent(b, forest_rows));
        }

        if let [d] = pairs.remainder() {
            let d = *d;
            match root.take() {
                Some(root_pos) => {
                    row_plan.swaps.push(Arrow::new(root_pos, d));
                    removed_roots[row as usize] = true;
                }
                None => {
                    floaters.push((row, sibling(d)));
                    next_dead.push(parent(d, forest_rows));
                }
            }
        }

        for arrow in &row_plan.swaps {
            for floater in floaters.iter_mut().filter(|(r, _)| *r < row) {
                floater.1 = translate_swap(floater.1, arrow.from, arrow.to, row, forest_rows);
            }
        }

        let mut next_dirty: Vec<u64> = dedupe_swap_dirt(&dirty, &row_plan.swaps)
            .into_iter()
            .map(|pos| parent(pos, forest_rows))
            .filter(|&pos| in_forest(pos, num_leaves, forest_rows))
            .collect();
        next_dirty.dedup();

        next_dead.sort_unstable();
        next_dead.dedup();

        plan.rows.push(row_plan);
        dead = next_dead;
        dirty = next_dirty;
    }

    let mut survivors: Vec<(u8, u64)> = root_positions(num_leaves, forest_rows)
        .into_iter()
        .filter(|(row, _)| !removed_roots[*row as usize])
        .chain(floaters)
        .collect();
    survivors.sort_unstable_by(|a, b| b.0.cmp(&a.0));

    for i in 0..survivors.len() {
        let (row, pos) = survivors[i];
        let target = root_position(next_num_leaves, row, forest_rows);
        if pos == target {
            continue;
        }
        plan.relocations.push(Relocation {
            row,
            arrow: Arrow::new(pos, target),
        });
        for pending in survivors[i + 1..].iter_mut() {
            pending.1 = translate_swap(pending.1, pos, target, row, forest_rows);
        }
    }

    plan
}

/// Positions of `row` under the subtree rooted at `top` (at `top_row`).
pub(crate) fn subtree_row_range(top: u64, top_row: u8, row: u8, forest_rows: u8) -> (u64, u64) {
    let depth = top_row - row;
    (child_many(top, depth, forest_rows), 1u64 << depth)
}
