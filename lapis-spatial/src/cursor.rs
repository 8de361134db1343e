//! Query cursors: constrained depth-first scans and direct rowid lookups.
//!
//! A cursor follows the open / filter / next / eof / column / rowid
//! protocol of the surrounding query engine. Internal levels test each
//! child's bounding box against the constraints and reject a subtree only
//! when it provably cannot contain a match; leaf levels test stored
//! coordinates exactly. Iteration order is an artifact of the left-to-right
//! descent, not a sorted order.

use crate::cache::NodeRef;
use crate::cell::Cell;
use crate::error::{SpatialError, SpatialResult};
use crate::geometry::MatchArg;
use crate::module::{
    decode_constraints, Constraint, ConstraintOp, IndexPlan, QueryValue, ScanStrategy,
};
use crate::storage::ROOT_NODE;
use crate::tree::{Ops, RTree};
use std::sync::atomic::Ordering;

/// A value read from a positioned cursor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnValue {
    Integer(i64),
    Real(f64),
}

struct CursorPos {
    node: Option<NodeRef>,
    cell_idx: usize,
    constraints: Vec<Constraint>,
}

impl CursorPos {
    fn current(&self) -> SpatialResult<&NodeRef> {
        self.node.as_ref().ok_or_else(|| {
            SpatialError::InvalidArgument("cursor is not positioned on a row".to_string())
        })
    }

    fn take_current(&mut self) -> SpatialResult<NodeRef> {
        self.node.take().ok_or_else(|| {
            SpatialError::InvalidArgument("cursor is not positioned on a row".to_string())
        })
    }
}

/// A cursor over one R-tree table.
pub struct RTreeCursor {
    tree: RTree,
    strategy: ScanStrategy,
    pos: CursorPos,
}

impl RTreeCursor {
    pub(crate) fn new(tree: RTree) -> RTreeCursor {
        tree.inner.busy.fetch_add(1, Ordering::SeqCst);
        RTreeCursor {
            tree,
            strategy: ScanStrategy::Scan,
            pos: CursorPos { node: None, cell_idx: 0, constraints: Vec::new() },
        }
    }

    /// Positions the cursor on the first matching row of `plan`, or at EOF
    /// when nothing matches.
    pub fn filter(&mut self, plan: &IndexPlan, args: &[QueryValue]) -> SpatialResult<()> {
        let inner = self.tree.inner.clone();
        let mut state = inner.state.lock();
        let mut ops = Ops::new(&inner, &mut state);

        if let Some(node) = self.pos.node.take() {
            ops.release(node)?;
        }
        self.pos.constraints.clear();
        self.pos.cell_idx = 0;
        self.strategy = plan.strategy;

        match plan.strategy {
            ScanStrategy::DirectRowid => {
                if args.len() != 1 {
                    return Err(SpatialError::InvalidArgument(
                        "rowid lookup takes exactly one argument".to_string(),
                    ));
                }
                let rowid = args[0].as_i64()?;
                if let Some(leaf_no) = ops.storage.read_rowid(rowid)? {
                    let leaf = ops.acquire(leaf_no, None)?;
                    match ops.node_rowid_index(&leaf, rowid) {
                        Ok(idx) => {
                            self.pos.node = Some(leaf);
                            self.pos.cell_idx = idx;
                        }
                        Err(e) => {
                            ops.release_quiet(leaf);
                            return Err(e);
                        }
                    }
                }
            }
            ScanStrategy::Scan => {
                self.pos.constraints =
                    decode_constraints(&plan.constraint_str, args, ops.meta.dims)?;
                let root = ops.acquire(ROOT_NODE, None)?;
                let depth = match ops.state.cache.depth() {
                    Ok(depth) => depth as i32,
                    Err(e) => {
                        ops.release_quiet(root);
                        return Err(e);
                    }
                };
                let count = ops.cell_count(&root);
                self.pos.node = Some(root);
                let mut found = false;
                while self.pos.cell_idx < count {
                    if !descend_to_cell(&mut self.pos, &mut ops, depth)? {
                        found = true;
                        break;
                    }
                    self.pos.cell_idx += 1;
                }
                if !found {
                    if let Some(node) = self.pos.node.take() {
                        ops.release(node)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Advances to the next matching row. A direct-rowid cursor has no next
    /// row and transitions straight to EOF.
    pub fn next(&mut self) -> SpatialResult<()> {
        let inner = self.tree.inner.clone();
        let mut state = inner.state.lock();
        let mut ops = Ops::new(&inner, &mut state);

        if self.pos.node.is_none() {
            return Ok(());
        }
        if self.strategy == ScanStrategy::DirectRowid {
            let node = self.pos.take_current()?;
            return ops.release(node);
        }

        let mut height = 0;
        while self.pos.node.is_some() {
            let count = ops.cell_count(self.pos.current()?);
            self.pos.cell_idx += 1;
            while self.pos.cell_idx < count {
                if !descend_to_cell(&mut self.pos, &mut ops, height)? {
                    return Ok(());
                }
                self.pos.cell_idx += 1;
            }

            let node = self.pos.take_current()?;
            match ops.node_parent_index(&node) {
                Ok(Some((parent_slot, idx))) => {
                    let parent = ops.state.cache.retain_slot(parent_slot);
                    ops.release(node)?;
                    self.pos.node = Some(parent);
                    self.pos.cell_idx = idx;
                }
                Ok(None) => {
                    // The root is exhausted.
                    ops.release(node)?;
                }
                Err(e) => {
                    ops.release_quiet(node);
                    return Err(e);
                }
            }
            height += 1;
        }
        Ok(())
    }

    /// True once the scan has finished.
    pub fn eof(&self) -> bool {
        self.pos.node.is_none()
    }

    /// The rowid of the current row.
    pub fn rowid(&self) -> SpatialResult<i64> {
        let state = self.tree.inner.state.lock();
        let node = self.pos.current()?;
        let layout = self.tree.inner.meta.layout;
        Ok(layout.get_rowid(state.cache.data(node), self.pos.cell_idx))
    }

    /// Reads column `i` of the current row: column 0 is the rowid, column
    /// `k > 0` is coordinate `k - 1`, decoded per the table's coordinate
    /// kind.
    pub fn column(&self, i: usize) -> SpatialResult<ColumnValue> {
        let state = self.tree.inner.state.lock();
        let node = self.pos.current()?;
        let layout = self.tree.inner.meta.layout;
        if i == 0 {
            return Ok(ColumnValue::Integer(
                layout.get_rowid(state.cache.data(node), self.pos.cell_idx),
            ));
        }
        if i > layout.dims * 2 {
            return Err(SpatialError::InvalidArgument(format!(
                "column {} out of range",
                i
            )));
        }
        let coord = layout.get_coord(state.cache.data(node), self.pos.cell_idx, i - 1);
        Ok(match coord {
            crate::cell::Coord::Real(f) => ColumnValue::Real(f as f64),
            crate::cell::Coord::Int(v) => ColumnValue::Integer(v as i64),
        })
    }

    /// Releases the cursor's position explicitly, surfacing any write-back
    /// error. Dropping the cursor does the same with the error logged.
    pub fn close(&mut self) -> SpatialResult<()> {
        if let Some(node) = self.pos.node.take() {
            let inner = self.tree.inner.clone();
            let mut state = inner.state.lock();
            let mut ops = Ops::new(&inner, &mut state);
            ops.release(node)?;
        }
        Ok(())
    }
}

impl Drop for RTreeCursor {
    fn drop(&mut self) {
        if let Some(node) = self.pos.node.take() {
            let inner = self.tree.inner.clone();
            let mut state = inner.state.lock();
            let mut ops = Ops::new(&inner, &mut state);
            ops.release_quiet(node);
        }
        self.tree.inner.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Evaluates a MATCH predicate against the decoded coordinates of `cell`.
fn test_geom(geom: &MatchArg, cell: &Cell, dims: usize) -> SpatialResult<bool> {
    let coords: Vec<f64> = (0..dims * 2).map(|i| cell.coords[i].to_f64()).collect();
    geom.test(&coords)
}

fn match_arg<'a>(constraint: &'a Constraint) -> SpatialResult<&'a MatchArg> {
    constraint.geom.as_ref().ok_or_else(|| {
        SpatialError::InvalidArgument("MATCH constraint lost its geometry".to_string())
    })
}

/// Tests the current cell of a leaf node against every constraint exactly.
/// Returns true when the row is excluded.
fn test_entry(pos: &CursorPos, ops: &Ops) -> SpatialResult<bool> {
    let node = pos.current()?;
    let cell = ops.get_cell(node, pos.cell_idx);
    let dims = ops.meta.dims;
    for constraint in &pos.constraints {
        let satisfied = if constraint.op == ConstraintOp::Match {
            test_geom(match_arg(constraint)?, &cell, dims)?
        } else {
            let coord = cell.coords[constraint.coord].to_f64();
            match constraint.op {
                ConstraintOp::Le => coord <= constraint.value,
                ConstraintOp::Lt => coord < constraint.value,
                ConstraintOp::Ge => coord >= constraint.value,
                ConstraintOp::Gt => coord > constraint.value,
                ConstraintOp::Eq => coord == constraint.value,
                ConstraintOp::Match => false,
            }
        };
        if !satisfied {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Tests the current cell of an internal node: the subtree under it is
/// excluded only when its bounding box provably cannot satisfy a
/// constraint. Returns true when excluded.
fn test_cell(pos: &CursorPos, ops: &Ops) -> SpatialResult<bool> {
    let node = pos.current()?;
    let cell = ops.get_cell(node, pos.cell_idx);
    let dims = ops.meta.dims;
    for constraint in &pos.constraints {
        let pair = constraint.coord >> 1;
        let cell_min = cell.coords[pair * 2].to_f64();
        let cell_max = cell.coords[pair * 2 + 1].to_f64();
        let excluded = match constraint.op {
            ConstraintOp::Le | ConstraintOp::Lt => constraint.value < cell_min,
            ConstraintOp::Ge | ConstraintOp::Gt => constraint.value > cell_max,
            ConstraintOp::Eq => {
                constraint.value > cell_max || constraint.value < cell_min
            }
            ConstraintOp::Match => !test_geom(match_arg(constraint)?, &cell, dims)?,
        };
        if excluded {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The cursor points at a cell heading a subtree `height` high. Descends to
/// the left-most cell of that subtree satisfying the constraints. Returns
/// true when the whole subtree is excluded, leaving the cursor where it
/// started.
fn descend_to_cell(pos: &mut CursorPos, ops: &mut Ops, height: i32) -> SpatialResult<bool> {
    let excluded = if height == 0 {
        test_entry(pos, ops)?
    } else {
        test_cell(pos, ops)?
    };
    if excluded || height == 0 {
        return Ok(excluded);
    }

    let saved_cell = pos.cell_idx;
    {
        let node = pos.current()?;
        let child_no = ops.get_rowid(node, pos.cell_idx);
        let child = ops.acquire(child_no, Some(node))?;
        let old = pos.take_current()?;
        // The child's parent link keeps the old node alive for the
        // backtrack below.
        pos.node = Some(child);
        ops.release(old)?;
    }

    let count = ops.cell_count(pos.current()?);
    for i in 0..count {
        pos.cell_idx = i;
        if !descend_to_cell(pos, ops, height - 1)? {
            return Ok(false);
        }
    }

    // Nothing in the subtree matched; climb back to the saved position.
    let child = pos.take_current()?;
    let parent_slot = ops.state.cache.parent_slot(&child).ok_or_else(|| {
        SpatialError::Corrupt("descended node has no parent".to_string())
    })?;
    let saved = ops.state.cache.retain_slot(parent_slot);
    pos.node = Some(saved);
    ops.release(child)?;
    pos.cell_idx = saved_cell;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{best_index, ConstraintInfo, IndexOp};
    use crate::tree::{RTree, RTreeConfig};
    use lapis::store::memory::{InMemoryStore, InMemoryStoreConfig};
    use lapis::store::Store;

    fn small_tree() -> RTree {
        let store = Store::new(InMemoryStore::new(
            InMemoryStoreConfig::new().with_page_size(164),
        ));
        RTree::create(
            &store,
            "rt",
            &["id", "x1", "x2", "y1", "y2"],
            RTreeConfig::default(),
        )
        .unwrap()
    }

    fn scan_plan(constraints: &[ConstraintInfo]) -> IndexPlan {
        let plan = best_index(constraints);
        assert_eq!(plan.strategy, ScanStrategy::Scan);
        plan
    }

    fn collect(cursor: &mut RTreeCursor) -> Vec<i64> {
        let mut rowids = Vec::new();
        while !cursor.eof() {
            rowids.push(cursor.rowid().unwrap());
            cursor.next().unwrap();
        }
        rowids
    }

    #[test]
    fn test_full_scan_empty_table() {
        let tree = small_tree();
        let mut cursor = tree.open_cursor();
        cursor.filter(&scan_plan(&[]), &[]).unwrap();
        assert!(cursor.eof());
    }

    #[test]
    fn test_full_scan_returns_all_rows() {
        let tree = small_tree();
        for i in 1..=3 {
            tree.insert(Some(i), &[i as f64, i as f64 + 1.0, 0.0, 1.0])
                .unwrap();
        }
        let mut cursor = tree.open_cursor();
        cursor.filter(&scan_plan(&[]), &[]).unwrap();
        let mut rowids = collect(&mut cursor);
        rowids.sort_unstable();
        assert_eq!(rowids, vec![1, 2, 3]);
    }

    #[test]
    fn test_direct_rowid_lookup() {
        let tree = small_tree();
        tree.insert(Some(7), &[0.0, 1.0, 0.0, 1.0]).unwrap();
        let plan = best_index(&[ConstraintInfo { column: 0, op: IndexOp::Eq, usable: true }]);
        let mut cursor = tree.open_cursor();
        cursor.filter(&plan, &[QueryValue::Integer(7)]).unwrap();
        assert!(!cursor.eof());
        assert_eq!(cursor.rowid().unwrap(), 7);
        assert_eq!(cursor.column(0).unwrap(), ColumnValue::Integer(7));
        assert_eq!(cursor.column(1).unwrap(), ColumnValue::Real(0.0));
        assert_eq!(cursor.column(2).unwrap(), ColumnValue::Real(1.0));
        // Direct lookups have no second row.
        cursor.next().unwrap();
        assert!(cursor.eof());
    }

    #[test]
    fn test_direct_rowid_lookup_missing() {
        let tree = small_tree();
        tree.insert(Some(7), &[0.0, 1.0, 0.0, 1.0]).unwrap();
        let plan = best_index(&[ConstraintInfo { column: 0, op: IndexOp::Eq, usable: true }]);
        let mut cursor = tree.open_cursor();
        cursor.filter(&plan, &[QueryValue::Integer(8)]).unwrap();
        assert!(cursor.eof());
    }

    #[test]
    fn test_constrained_scan() {
        let tree = small_tree();
        tree.insert(Some(1), &[0.0, 1.0, 0.0, 1.0]).unwrap();
        tree.insert(Some(2), &[5.0, 6.0, 5.0, 6.0]).unwrap();
        // dimension0 min >= 2
        let plan = scan_plan(&[ConstraintInfo { column: 1, op: IndexOp::Ge, usable: true }]);
        let mut cursor = tree.open_cursor();
        cursor.filter(&plan, &[QueryValue::Real(2.0)]).unwrap();
        assert_eq!(collect(&mut cursor), vec![2]);
    }

    #[test]
    fn test_column_out_of_range() {
        let tree = small_tree();
        tree.insert(Some(1), &[0.0, 1.0, 0.0, 1.0]).unwrap();
        let mut cursor = tree.open_cursor();
        cursor.filter(&scan_plan(&[]), &[]).unwrap();
        assert!(cursor.column(5).is_err());
    }

    #[test]
    fn test_rowid_on_eof_is_error() {
        let tree = small_tree();
        let mut cursor = tree.open_cursor();
        cursor.filter(&scan_plan(&[]), &[]).unwrap();
        assert!(cursor.rowid().is_err());
        assert!(cursor.column(0).is_err());
    }

    #[test]
    fn test_refilter_resets_cursor() {
        let tree = small_tree();
        tree.insert(Some(1), &[0.0, 1.0, 0.0, 1.0]).unwrap();
        let mut cursor = tree.open_cursor();
        cursor.filter(&scan_plan(&[]), &[]).unwrap();
        assert!(!cursor.eof());
        // Filtering again from the positioned state restarts the scan.
        cursor.filter(&scan_plan(&[]), &[]).unwrap();
        assert_eq!(collect(&mut cursor), vec![1]);
        cursor.close().unwrap();
    }
}
