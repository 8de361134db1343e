//! Node-split strategies.
//!
//! A full node is split by partitioning its cells (plus the incoming one)
//! between the original node and a fresh sibling. The partitioning algorithm
//! is chosen once per table: the linear and quadratic heuristics from
//! Guttman's original R-tree paper, or the margin-driven distribution from
//! the R*-tree paper.

use crate::cell::{overlap, Cell};
use crate::error::SpatialResult;
use crate::node::NodeLayout;

/// How an overflowing node's cells are distributed over the two halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitVariant {
    /// Guttman's linear-cost split.
    GuttmanLinear,
    /// Guttman's quadratic-cost split.
    GuttmanQuadratic,
    /// The R*-tree topological split.
    #[default]
    RStar,
}

/// The result of partitioning an overflowing cell set.
pub(crate) struct SplitPartition {
    /// Indices of the cells assigned to the original node.
    pub left: Vec<usize>,
    /// Indices of the cells assigned to the new sibling.
    pub right: Vec<usize>,
    /// Bounding cell over the left side.
    pub left_bbox: Cell,
    /// Bounding cell over the right side.
    pub right_bbox: Cell,
}

pub(crate) trait SplitStrategy: Send + Sync {
    fn split(&self, layout: &NodeLayout, cells: &[Cell]) -> SpatialResult<SplitPartition>;
}

pub(crate) fn strategy_for(variant: SplitVariant) -> Box<dyn SplitStrategy> {
    match variant {
        SplitVariant::GuttmanLinear => Box::new(GuttmanLinearSplit),
        SplitVariant::GuttmanQuadratic => Box::new(GuttmanQuadraticSplit),
        SplitVariant::RStar => Box::new(RStarSplit),
    }
}

// ---------------------------------------------------------------------------
// Stable merge sorts shared by the R*-tree split and forced reinsertion.
// ---------------------------------------------------------------------------

/// Sorts `idx` ascending by the keyed `distance` values. Stable.
pub(crate) fn sort_by_distance(idx: &mut [usize], distance: &[f64]) {
    let mut spare = vec![0usize; idx.len() / 2 + 1];
    sort_by_distance_inner(idx, distance, &mut spare);
}

fn sort_by_distance_inner(idx: &mut [usize], distance: &[f64], spare: &mut [usize]) {
    let n = idx.len();
    if n <= 1 {
        return;
    }
    let n_left = n / 2;
    {
        let (left, right) = idx.split_at_mut(n_left);
        sort_by_distance_inner(left, distance, spare);
        sort_by_distance_inner(right, distance, spare);
    }
    spare[..n_left].copy_from_slice(&idx[..n_left]);
    let mut li = 0;
    let mut ri = n_left;
    let mut out = 0;
    while li < n_left || ri < n {
        if ri == n || (li < n_left && distance[spare[li]] <= distance[idx[ri]]) {
            idx[out] = spare[li];
            li += 1;
        } else {
            idx[out] = idx[ri];
            ri += 1;
        }
        out += 1;
    }
}

/// Sorts `idx` ascending by dimension `dim` of the referenced cells: by the
/// minimum coordinate first, ties broken by the maximum. Stable.
pub(crate) fn sort_by_dimension(idx: &mut [usize], dim: usize, cells: &[Cell]) {
    let mut spare = vec![0usize; idx.len() / 2 + 1];
    sort_by_dimension_inner(idx, dim, cells, &mut spare);
}

fn sort_by_dimension_inner(idx: &mut [usize], dim: usize, cells: &[Cell], spare: &mut [usize]) {
    let n = idx.len();
    if n <= 1 {
        return;
    }
    let n_left = n / 2;
    {
        let (left, right) = idx.split_at_mut(n_left);
        sort_by_dimension_inner(left, dim, cells, spare);
        sort_by_dimension_inner(right, dim, cells, spare);
    }
    spare[..n_left].copy_from_slice(&idx[..n_left]);
    let mut li = 0;
    let mut ri = n_left;
    let mut out = 0;
    while li < n_left || ri < n {
        let take_left = if ri == n {
            true
        } else if li == n_left {
            false
        } else {
            let lmin = cells[spare[li]].min(dim).to_f64();
            let lmax = cells[spare[li]].max(dim).to_f64();
            let rmin = cells[idx[ri]].min(dim).to_f64();
            let rmax = cells[idx[ri]].max(dim).to_f64();
            lmin < rmin || (lmin == rmin && lmax <= rmax)
        };
        if take_left {
            idx[out] = spare[li];
            li += 1;
        } else {
            idx[out] = idx[ri];
            ri += 1;
        }
        out += 1;
    }
}

// ---------------------------------------------------------------------------
// Guttman splits
// ---------------------------------------------------------------------------

fn guttman_split(
    layout: &NodeLayout,
    cells: &[Cell],
    pick_seeds: fn(&NodeLayout, &[Cell]) -> (usize, usize),
    pick_next: fn(&NodeLayout, &[Cell], &Cell, &Cell, &[bool]) -> usize,
) -> SplitPartition {
    let dims = layout.dims;
    let min_cells = layout.min_cells() as isize;
    let n = cells.len();
    let mut used = vec![false; n];

    let (left_seed, right_seed) = pick_seeds(layout, cells);
    let mut left_bbox = cells[left_seed];
    let mut right_bbox = cells[right_seed];
    let mut left = vec![left_seed];
    let mut right = vec![right_seed];
    used[left_seed] = true;
    used[right_seed] = true;

    // `remaining` counts the unassigned cells including the one picked this
    // iteration; it drives the forcing needed to satisfy the minimum cell
    // count on both sides.
    for remaining in (1..=(n as isize - 2)).rev() {
        let next = pick_next(layout, cells, &left_bbox, &right_bbox, &used);
        used[next] = true;
        let diff =
            left_bbox.growth(&cells[next], dims) - right_bbox.growth(&cells[next], dims);
        if min_cells - right.len() as isize == remaining
            || (diff > 0.0 && min_cells - left.len() as isize != remaining)
        {
            right.push(next);
            right_bbox.union_with(&cells[next], dims);
        } else {
            left.push(next);
            left_bbox.union_with(&cells[next], dims);
        }
    }

    SplitPartition { left, right, left_bbox, right_bbox }
}

fn linear_pick_seeds(layout: &NodeLayout, cells: &[Cell]) -> (usize, usize) {
    let mut left_seed = 0;
    let mut right_seed = 1;
    let mut max_normal_width = 0.0;

    // For each dimension, find the pair with the greatest separation
    // normalized by the total extent of the cell set in that dimension.
    for dim in 0..layout.dims {
        let mut x1 = cells[0].min(dim).to_f64(); // lowest min
        let mut x2 = cells[0].max(dim).to_f64(); // lowest max
        let mut x3 = x1; // highest min
        let mut x4 = x2; // highest max
        let mut left_cell = 0;
        let mut right_cell = 0;

        for (j, cell) in cells.iter().enumerate() {
            let low = cell.min(dim).to_f64();
            if low < x1 {
                x1 = low;
            } else if low > x3 {
                x3 = low;
                right_cell = j;
            }

            let high = cell.max(dim).to_f64();
            if high > x4 {
                x4 = high;
            } else if high < x2 {
                x2 = high;
                left_cell = j;
            }
        }

        if x4 != x1 {
            let normal_width = (x3 - x2) / (x4 - x1);
            if normal_width > max_normal_width {
                max_normal_width = normal_width;
                left_seed = left_cell;
                right_seed = right_cell;
            }
        }
    }

    if left_seed == right_seed {
        // Degenerate geometry (all cells identical); fall back to any pair.
        right_seed = if left_seed == 0 { 1 } else { 0 };
    }
    (left_seed, right_seed)
}

fn linear_pick_next(
    _layout: &NodeLayout,
    _cells: &[Cell],
    _left_bbox: &Cell,
    _right_bbox: &Cell,
    used: &[bool],
) -> usize {
    used.iter().position(|u| !u).unwrap_or(0)
}

fn quadratic_pick_seeds(layout: &NodeLayout, cells: &[Cell]) -> (usize, usize) {
    let dims = layout.dims;
    let mut left_seed = 0;
    let mut right_seed = 1;
    let mut max_waste = f64::NEG_INFINITY;

    // Pick the pair that would waste the most area if stored together.
    for i in 0..cells.len() {
        for j in (i + 1)..cells.len() {
            let waste = cells[i].growth(&cells[j], dims) - cells[j].area(dims);
            if waste > max_waste {
                max_waste = waste;
                left_seed = i;
                right_seed = j;
            }
        }
    }
    (left_seed, right_seed)
}

fn quadratic_pick_next(
    layout: &NodeLayout,
    cells: &[Cell],
    left_bbox: &Cell,
    right_bbox: &Cell,
    used: &[bool],
) -> usize {
    let dims = layout.dims;
    let mut selected = None;
    let mut max_diff = 0.0;

    // The most decisive cell first: the one whose growth cost differs most
    // between the two sides.
    for (i, cell) in cells.iter().enumerate() {
        if used[i] {
            continue;
        }
        let left_growth = left_bbox.growth(cell, dims);
        let right_growth = right_bbox.growth(cell, dims);
        let diff = (right_growth - left_growth).abs();
        if selected.is_none() || diff > max_diff {
            max_diff = diff;
            selected = Some(i);
        }
    }
    selected.unwrap_or(0)
}

pub(crate) struct GuttmanLinearSplit;

impl SplitStrategy for GuttmanLinearSplit {
    fn split(&self, layout: &NodeLayout, cells: &[Cell]) -> SpatialResult<SplitPartition> {
        Ok(guttman_split(layout, cells, linear_pick_seeds, linear_pick_next))
    }
}

pub(crate) struct GuttmanQuadraticSplit;

impl SplitStrategy for GuttmanQuadraticSplit {
    fn split(&self, layout: &NodeLayout, cells: &[Cell]) -> SpatialResult<SplitPartition> {
        Ok(guttman_split(layout, cells, quadratic_pick_seeds, quadratic_pick_next))
    }
}

// ---------------------------------------------------------------------------
// R*-tree split
// ---------------------------------------------------------------------------

pub(crate) struct RStarSplit;

impl SplitStrategy for RStarSplit {
    fn split(&self, layout: &NodeLayout, cells: &[Cell]) -> SpatialResult<SplitPartition> {
        let dims = layout.dims;
        let min_cells = layout.min_cells();
        let n = cells.len();

        // One index ordering per dimension: by minimum coordinate, ties by
        // maximum.
        let mut sorted: Vec<Vec<usize>> = Vec::with_capacity(dims);
        for dim in 0..dims {
            let mut idx: Vec<usize> = (0..n).collect();
            sort_by_dimension(&mut idx, dim, cells);
            sorted.push(idx);
        }

        let union_of = |indices: &[usize]| -> Cell {
            let mut bbox = cells[indices[0]];
            for &i in &indices[1..] {
                bbox.union_with(&cells[i], dims);
            }
            bbox
        };

        let mut best_dim = 0;
        let mut best_margin = 0.0;
        let mut best_split = min_cells;

        for dim in 0..dims {
            let order = &sorted[dim];
            let mut margin = 0.0;
            let mut dim_best_overlap = 0.0;
            let mut dim_best_area = 0.0;
            let mut dim_best_left = min_cells;

            // Every admissible split point leaves both sides with at least
            // the minimum cell count.
            for n_left in min_cells..=(n - min_cells) {
                let left_bbox = union_of(&order[..n_left]);
                let right_bbox = union_of(&order[n_left..]);
                margin += left_bbox.margin(dims) + right_bbox.margin(dims);
                let o = overlap(&left_bbox, std::slice::from_ref(&right_bbox), None, dims);
                let area = left_bbox.area(dims) + right_bbox.area(dims);
                if n_left == min_cells
                    || o < dim_best_overlap
                    || (o == dim_best_overlap && area < dim_best_area)
                {
                    dim_best_left = n_left;
                    dim_best_overlap = o;
                    dim_best_area = area;
                }
            }

            if dim == 0 || margin < best_margin {
                best_dim = dim;
                best_margin = margin;
                best_split = dim_best_left;
            }
        }

        let order = &sorted[best_dim];
        let left: Vec<usize> = order[..best_split].to_vec();
        let right: Vec<usize> = order[best_split..].to_vec();
        let left_bbox = union_of(&left);
        let right_bbox = union_of(&right);
        Ok(SplitPartition { left, right, left_bbox, right_bbox })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Coord, CoordKind};

    fn layout() -> NodeLayout {
        // Capacity 6, min_cells 2.
        NodeLayout::new(4 + 6 * 24, 2, CoordKind::Real32)
    }

    fn cell_2d(rowid: i64, x1: f32, x2: f32, y1: f32, y2: f32) -> Cell {
        let mut cell = Cell::new(rowid, CoordKind::Real32);
        cell.coords[0] = Coord::Real(x1);
        cell.coords[1] = Coord::Real(x2);
        cell.coords[2] = Coord::Real(y1);
        cell.coords[3] = Coord::Real(y2);
        cell
    }

    /// Two well-separated clusters; any sane strategy keeps them apart.
    fn clustered_cells() -> Vec<Cell> {
        vec![
            cell_2d(1, 0.0, 1.0, 0.0, 1.0),
            cell_2d(2, 0.5, 1.5, 0.5, 1.5),
            cell_2d(3, 1.0, 2.0, 0.0, 1.0),
            cell_2d(4, 100.0, 101.0, 100.0, 101.0),
            cell_2d(5, 100.5, 101.5, 100.5, 101.5),
            cell_2d(6, 101.0, 102.0, 100.0, 101.0),
            cell_2d(7, 100.0, 102.0, 101.0, 102.0),
        ]
    }

    fn check_partition(partition: &SplitPartition, n: usize, min_cells: usize) {
        assert_eq!(partition.left.len() + partition.right.len(), n);
        assert!(partition.left.len() >= min_cells);
        assert!(partition.right.len() >= min_cells);
        let mut seen = vec![false; n];
        for &i in partition.left.iter().chain(partition.right.iter()) {
            assert!(!seen[i], "cell {} assigned twice", i);
            seen[i] = true;
        }
    }

    fn check_bboxes(partition: &SplitPartition, cells: &[Cell]) {
        for &i in &partition.left {
            assert!(partition.left_bbox.contains(&cells[i], 2));
        }
        for &i in &partition.right {
            assert!(partition.right_bbox.contains(&cells[i], 2));
        }
    }

    #[test]
    fn test_sort_by_distance() {
        let distance = [5.0, 2.0, 7.0, 2.0, 1.0];
        let mut idx = vec![0, 1, 2, 3, 4];
        sort_by_distance(&mut idx, &distance);
        // Stable: the tied keys 1 and 3 keep their input order.
        assert_eq!(idx, vec![4, 1, 3, 0, 2]);
    }

    #[test]
    fn test_sort_by_dimension() {
        let cells = vec![
            cell_2d(1, 3.0, 4.0, 0.0, 1.0),
            cell_2d(2, 1.0, 5.0, 0.0, 1.0),
            cell_2d(3, 1.0, 2.0, 0.0, 1.0),
            cell_2d(4, 0.0, 9.0, 0.0, 1.0),
        ];
        let mut idx = vec![0, 1, 2, 3];
        sort_by_dimension(&mut idx, 0, &cells);
        // Ascending by min, ties broken by max: (0,9) (1,2) (1,5) (3,4).
        assert_eq!(idx, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_linear_split_partition() {
        let cells = clustered_cells();
        let partition = GuttmanLinearSplit.split(&layout(), &cells).unwrap();
        check_partition(&partition, cells.len(), layout().min_cells());
        check_bboxes(&partition, &cells);
    }

    #[test]
    fn test_quadratic_split_partition() {
        let cells = clustered_cells();
        let partition = GuttmanQuadraticSplit.split(&layout(), &cells).unwrap();
        check_partition(&partition, cells.len(), layout().min_cells());
        check_bboxes(&partition, &cells);
    }

    #[test]
    fn test_rstar_split_partition() {
        let cells = clustered_cells();
        let partition = RStarSplit.split(&layout(), &cells).unwrap();
        check_partition(&partition, cells.len(), layout().min_cells());
        check_bboxes(&partition, &cells);
    }

    #[test]
    fn test_rstar_split_separates_clusters() {
        let cells = clustered_cells();
        let partition = RStarSplit.split(&layout(), &cells).unwrap();
        // The two clusters end up in different halves, so the halves do not
        // overlap at all.
        let o = overlap(
            &partition.left_bbox,
            std::slice::from_ref(&partition.right_bbox),
            None,
            2,
        );
        assert_eq!(o, 0.0);
    }

    #[test]
    fn test_splits_handle_identical_cells() {
        let cells = vec![cell_2d(1, 1.0, 2.0, 1.0, 2.0); 7];
        for strategy in [
            strategy_for(SplitVariant::GuttmanLinear),
            strategy_for(SplitVariant::GuttmanQuadratic),
            strategy_for(SplitVariant::RStar),
        ] {
            let partition = strategy.split(&layout(), &cells).unwrap();
            check_partition(&partition, cells.len(), layout().min_cells());
        }
    }
}
