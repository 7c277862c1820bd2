use crate::transform::{Arrow, RemovePlan};
use crate::{Hash, Result, rehash};

/// Positional node storage a [`RemovePlan`] executes against.
pub(crate) trait NodeStore {
    fn forest_rows(&self) -> u8;

    fn read(&mut self, position: u64) -> Result<Hash>;

    fn write(&mut self, position: u64, hash: Hash) -> Result<()>;

    /// Exchanges the subtrees rooted at `a` and `b`, both at `row`.
    fn swap_subtrees(&mut self, a: u64, b: u64, row: u8) -> Result<()>;

    /// Recomputes the hashes of `positions` from their children.
    fn rehash_row(&mut self, positions: &[u64]) -> Result<()> {
        let forest_rows = self.forest_rows();
        for &position in positions {
            let left = self.read(crate::position::left_child(position, forest_rows))?;
            let right = self.read(crate::position::right_child(position, forest_rows))?;
            self.write(position, rehash(&left, &right))?;
        }
        Ok(())
    }
}

/// Applies `plan` to `store`, returning the swaps in the order they were applied.
pub(crate) fn execute_plan<S: NodeStore>(store: &mut S, plan: &RemovePlan) -> Result<Vec<(u8, Arrow)>> {
    let mut log = Vec::new();

    for row_plan in &plan.rows {
        for &position in &row_plan.dead {
            store.write(position, Hash::ZERO)?;
        }

        let live: Vec<u64> = row_plan
            .rehash
            .iter()
            .copied()
            .filter(|position| row_plan.dead.binary_search(position).is_err())
            .collect();
        if !live.is_empty() {
            store.rehash_row(&live)?;
        }

        for arrow in &row_plan.swaps {
            store.swap_subtrees(arrow.from, arrow.to, row_plan.row)?;
            log.push((row_plan.row, *arrow));
        }
    }

    for relocation in &plan.relocations {
        store.swap_subtrees(relocation.arrow.from, relocation.arrow.to, relocation.row)?;
        log.push((relocation.row, relocation.arrow));
    }

    Ok(log)
}
