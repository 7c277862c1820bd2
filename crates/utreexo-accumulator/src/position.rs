//! Position arithmetic on a virtual perfect forest of `2^forest_rows` leaves.
//!
//! Positions are numbered left to right, bottom to top: row 0 holds the
//! leaves `0..2^forest_rows`, row `h` starts right after row `h - 1` ends.
//! All functions are pure and total for positions of the given forest.

/// Returns `(2 << forest_rows) - 1`, the mask keeping a position inside the forest.
#[inline]
fn mask(forest_rows: u8) -> u64 {
    (2u64 << forest_rows) - 1
}

/// Number of position slots a forest of `forest_rows` rows spans.
#[inline]
pub fn forest_size(forest_rows: u8) -> u64 {
    2u64 << forest_rows
}

/// First position of `row`.
#[inline]
pub fn row_offset(row: u8, forest_rows: u8) -> u64 {
    let size = 2u64 << forest_rows;
    size - (size >> row)
}

#[inline]
pub fn parent(position: u64, forest_rows: u8) -> u64 {
    (position >> 1) | (1u64 << forest_rows)
}

/// Ancestor `rise` rows above `position`.
#[inline]
pub fn parent_many(position: u64, rise: u8, forest_rows: u8) -> u64 {
    if rise == 0 {
        return position;
    }
    let mask = mask(forest_rows);
    ((position >> rise) | (mask << (forest_rows + 1 - rise))) & mask
}

#[inline]
pub fn left_child(position: u64, forest_rows: u8) -> u64 {
    (position << 1) & mask(forest_rows)
}

#[inline]
pub fn right_child(position: u64, forest_rows: u8) -> u64 {
    left_child(position, forest_rows) | 1
}

/// Leftmost descendant `drop` rows below `position`.
#[inline]
pub fn child_many(position: u64, drop: u8, forest_rows: u8) -> u64 {
    (position << drop) & mask(forest_rows)
}

#[inline]
pub fn sibling(position: u64) -> u64 {
    position ^ 1
}

#[inline]
pub fn cousin(position: u64) -> u64 {
    position ^ 2
}

#[inline]
pub fn is_left_child(position: u64) -> bool {
    position & 1 == 0
}

/// Row of `position`: the number of consecutive 1-bits starting at bit `forest_rows`.
pub fn detect_row(position: u64, forest_rows: u8) -> u8 {
    let mut marker = 1u64 << forest_rows;
    let mut row = 0u8;
    while row <= forest_rows && position & marker != 0 {
        marker >>= 1;
        row += 1;
    }
    row
}

/// Smallest `r` with `2^r >= num_leaves`.
pub fn tree_rows(num_leaves: u64) -> u8 {
    if num_leaves <= 1 {
        0
    } else {
        (64 - (num_leaves - 1).leading_zeros()) as u8
    }
}

#[inline]
pub fn root_present(num_leaves: u64, row: u8) -> bool {
    row < 64 && (num_leaves >> row) & 1 == 1
}

#[inline]
pub fn num_roots(num_leaves: u64) -> usize {
    num_leaves.count_ones() as usize
}

/// Position of the root at `row`. Only meaningful when [`root_present`] holds.
#[inline]
pub fn root_position(num_leaves: u64, row: u8, forest_rows: u8) -> u64 {
    row_offset(row, forest_rows) + (num_leaves >> row) - 1
}

/// `(row, position)` of every root, highest row first.
pub fn root_positions(num_leaves: u64, forest_rows: u8) -> Vec<(u8, u64)> {
    (0..=forest_rows)
        .rev()
        .filter(|&row| root_present(num_leaves, row))
        .map(|row| (row, root_position(num_leaves, row, forest_rows)))
        .collect()
}

/// Whether `position` is a node of a tree of the forest holding `num_leaves` leaves.
pub fn in_forest(position: u64, num_leaves: u64, forest_rows: u8) -> bool {
    if position >= forest_size(forest_rows) - 1 {
        return false;
    }
    let row = detect_row(position, forest_rows);
    let index = position - row_offset(row, forest_rows);
    (index + 1) << row <= num_leaves
}

/// Moves `position` along with a subtree swap of `from` and `to` at `swap_row`.
///
/// Positions outside of both subtrees are returned unchanged.
pub fn translate_swap(position: u64, from: u64, to: u64, swap_row: u8, forest_rows: u8) -> u64 {
    let row = detect_row(position, forest_rows);
    if row >= swap_row {
        return if position == from {
            to
        } else if position == to {
            from
        } else {
            position
        };
    }
    let depth = swap_row - row;
    let ancestor = parent_many(position, depth, forest_rows);
    if ancestor == from {
        position - child_many(from, depth, forest_rows) + child_many(to, depth, forest_rows)
    } else if ancestor == to {
        position - child_many(to, depth, forest_rows) + child_many(from, depth, forest_rows)
    } else {
        position
    }
}

/// Position `p` at `row` of a forest with `old_rows`, expressed in a forest with `new_rows`.
pub fn remap_position(position: u64, old_rows: u8, new_rows: u8) -> u64 {
    let row = detect_row(position, old_rows);
    position - row_offset(row, old_rows) + row_offset(row, new_rows)
}
