//! The R-tree table object: lifecycle, insertion, splitting, deletion and
//! structural maintenance.
//!
//! All mutating algorithms live on [`Ops`], a short-lived view that borrows
//! the table's locked state. Insertion follows Guttman's ChooseLeaf with the
//! configured split strategy; deletion condenses underfull nodes by queueing
//! their content for reinsertion; the optional R*-tree forced reinsertion
//! defers the first split per level of each top-level insert.

use crate::cell::{overlap_enlargement, Cell, Coord, CoordKind, MAX_DIMENSIONS};
use crate::cursor::RTreeCursor;
use crate::error::{SpatialError, SpatialResult};
use crate::node::{write_u16, NodeLayout, MAX_CELLS_PER_NODE, NODE_HEADER_SIZE};
use crate::cache::{NodeCache, NodeRef};
use crate::split::{sort_by_distance, strategy_for, SplitStrategy, SplitVariant};
use crate::storage::{TableStorage, ROOT_NODE};
use lapis::store::Store;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Per-table configuration, fixed at create/connect time.
#[derive(Debug, Clone)]
pub struct RTreeConfig {
    /// Coordinate representation of the table.
    pub coord_kind: CoordKind,
    /// How overflowing nodes are split.
    pub split_variant: SplitVariant,
    /// Defer the first split per level of an insert by reinserting the
    /// farthest-from-centre cells (the R*-tree forced reinsertion).
    pub rstar_reinsert: bool,
    /// Break subtree-choice ties by overlap enlargement at the level above
    /// the leaves (the R*-tree ChooseSubtree refinement).
    pub rstar_choose_subtree: bool,
}

impl Default for RTreeConfig {
    fn default() -> Self {
        RTreeConfig {
            coord_kind: CoordKind::Real32,
            split_variant: SplitVariant::RStar,
            rstar_reinsert: true,
            rstar_choose_subtree: false,
        }
    }
}

/// A new record for [`RTree::update`]: an optional explicit rowid and
/// `2 * dims` coordinate values as (min, max) pairs per dimension.
#[derive(Debug, Clone)]
pub struct UpdateRecord {
    pub rowid: Option<i64>,
    pub coords: Vec<f64>,
}

/// Outcome of a structural integrity check.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub nodes_checked: u64,
    pub entries: u64,
    pub errors: Vec<String>,
}

/// A node removed from the tree during condensation, awaiting reinsertion
/// of its content. It carries the height of the subtree it headed instead
/// of a node number.
pub(crate) struct PendingNode {
    pub height: i32,
    pub data: Vec<u8>,
}

pub(crate) struct TableMeta {
    pub dims: usize,
    pub layout: NodeLayout,
    pub split: Box<dyn SplitStrategy>,
    pub rstar_reinsert: bool,
    pub rstar_choose_subtree: bool,
}

pub(crate) struct TreeState {
    pub cache: NodeCache,
    /// Lowest height that already performed a forced reinsertion during the
    /// current top-level operation; -1 when none has.
    pub reinsert_height: i32,
    /// Nodes unlinked by condensation, drained at the end of each delete.
    pub pending: Vec<PendingNode>,
}

pub(crate) struct RTreeInner {
    pub name: RwLock<String>,
    pub columns: Vec<String>,
    pub meta: TableMeta,
    pub storage: TableStorage,
    pub state: Mutex<TreeState>,
    pub busy: AtomicU32,
}

/// Counts entries into the table so teardown can be refused while cursors
/// or mutations are in flight.
pub(crate) struct BusyGuard<'a> {
    counter: &'a AtomicU32,
}

impl<'a> BusyGuard<'a> {
    pub fn enter(counter: &'a AtomicU32) -> BusyGuard<'a> {
        counter.fetch_add(1, Ordering::SeqCst);
        BusyGuard { counter }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A disk-backed R-tree index over one table of a backing store.
///
/// The handle is cheap to clone; all clones share the same node cache and
/// table state. Mutations and cursor steps serialize on an internal lock,
/// while write/write concurrency control across connections is the backing
/// store's responsibility.
#[derive(Clone)]
pub struct RTree {
    pub(crate) inner: Arc<RTreeInner>,
}

impl std::fmt::Debug for RTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RTree")
            .field("name", &*self.inner.name.read())
            .finish_non_exhaustive()
    }
}

impl RTree {
    /// Creates a new R-tree table in `store`.
    ///
    /// `columns` names the rowid column followed by min/max pairs per
    /// dimension, e.g. `["id", "x1", "x2", "y1", "y2"]`. The node size is
    /// derived from the store's page size so one node fills one page, capped
    /// so a node never holds more than [`MAX_CELLS_PER_NODE`] cells.
    pub fn create(
        store: &Store,
        name: &str,
        columns: &[&str],
        config: RTreeConfig,
    ) -> SpatialResult<RTree> {
        let dims = Self::validate_columns(columns)?;
        let bytes_per_cell = 8 + dims * 4 * 2;
        let mut node_size = store.page_size().saturating_sub(64);
        let capped = NODE_HEADER_SIZE + bytes_per_cell * MAX_CELLS_PER_NODE;
        if capped < node_size {
            node_size = capped;
        }
        let layout = NodeLayout::new(node_size, dims, config.coord_kind);
        if layout.capacity() < 3 {
            return Err(SpatialError::InvalidArgument(
                "Page size too small for an rtree table".to_string(),
            ));
        }
        let storage = TableStorage::open(store, name, node_size, true)?;
        log::debug!(
            "created rtree table {} ({} dimensions, node size {})",
            name,
            dims,
            node_size
        );
        Ok(Self::assemble(name, columns, config, layout, storage))
    }

    /// Connects to an existing R-tree table, recovering the node size from
    /// the stored root node.
    pub fn connect(
        store: &Store,
        name: &str,
        columns: &[&str],
        config: RTreeConfig,
    ) -> SpatialResult<RTree> {
        let dims = Self::validate_columns(columns)?;
        let storage = TableStorage::open(store, name, 0, false)?;
        let node_size = storage.root_node_size()?;
        let layout = NodeLayout::new(node_size, dims, config.coord_kind);
        if layout.capacity() < 3 {
            return Err(SpatialError::Corrupt(format!(
                "root node of {} is too small for its column count",
                name
            )));
        }
        log::debug!("connected to rtree table {} (node size {})", name, node_size);
        Ok(Self::assemble(name, columns, config, layout, storage))
    }

    fn validate_columns(columns: &[&str]) -> SpatialResult<usize> {
        if columns.len() < 3 {
            return Err(SpatialError::InvalidArgument(
                "Too few columns for an rtree table".to_string(),
            ));
        }
        if columns.len() > MAX_DIMENSIONS * 2 + 1 {
            return Err(SpatialError::InvalidArgument(
                "Too many columns for an rtree table".to_string(),
            ));
        }
        if columns.len() % 2 == 0 {
            return Err(SpatialError::InvalidArgument(
                "Wrong number of columns for an rtree table".to_string(),
            ));
        }
        Ok((columns.len() - 1) / 2)
    }

    fn assemble(
        name: &str,
        columns: &[&str],
        config: RTreeConfig,
        layout: NodeLayout,
        storage: TableStorage,
    ) -> RTree {
        RTree {
            inner: Arc::new(RTreeInner {
                name: RwLock::new(name.to_string()),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                meta: TableMeta {
                    dims: layout.dims,
                    layout,
                    split: strategy_for(config.split_variant),
                    rstar_reinsert: config.rstar_reinsert,
                    rstar_choose_subtree: config.rstar_choose_subtree,
                },
                storage,
                state: Mutex::new(TreeState {
                    cache: NodeCache::new(layout),
                    reinsert_height: -1,
                    pending: Vec::new(),
                }),
                busy: AtomicU32::new(0),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.name.read().clone()
    }

    pub fn columns(&self) -> &[String] {
        &self.inner.columns
    }

    pub fn dimensions(&self) -> usize {
        self.inner.meta.dims
    }

    pub fn coord_kind(&self) -> CoordKind {
        self.inner.meta.layout.coord_kind
    }

    /// How many cells one node holds.
    pub fn node_capacity(&self) -> usize {
        self.inner.meta.layout.capacity()
    }

    /// The current height of the tree; 0 when every cell lives in the root.
    pub fn depth(&self) -> SpatialResult<u16> {
        let _busy = BusyGuard::enter(&self.inner.busy);
        let mut state = self.inner.state.lock();
        let mut ops = Ops::new(&self.inner, &mut state);
        let root = ops.acquire(ROOT_NODE, None)?;
        let depth = ops.state.cache.depth();
        let released = ops.release(root);
        let depth = depth?;
        released?;
        Ok(depth)
    }

    /// Opens a query cursor against this table.
    pub fn open_cursor(&self) -> RTreeCursor {
        RTreeCursor::new(self.clone())
    }

    /// Writes to the table: deletes `delete_rowid` if given, then inserts
    /// `insert` if given (an update is a delete followed by an insert).
    /// Returns the rowid of the inserted record, generated when the record
    /// does not carry one.
    ///
    /// Two constraint failures are possible: a coordinate pair with
    /// `min > max`, and a duplicate rowid. A duplicate is tolerated when
    /// `on_conflict_replace` is set, in which case the conflicting row is
    /// removed first. Coordinate validation happens before any mutation.
    pub fn update(
        &self,
        delete_rowid: Option<i64>,
        insert: Option<UpdateRecord>,
        on_conflict_replace: bool,
    ) -> SpatialResult<Option<i64>> {
        let _busy = BusyGuard::enter(&self.inner.busy);
        let mut state = self.inner.state.lock();
        let mut ops = Ops::new(&self.inner, &mut state);

        let dims = self.inner.meta.dims;
        let kind = self.inner.meta.layout.coord_kind;

        // Build and validate the new cell before touching the tree, so a
        // constraint failure leaves the table exactly as it was.
        let mut new_cell = None;
        if let Some(record) = &insert {
            if record.coords.len() != dims * 2 {
                return Err(SpatialError::InvalidArgument(format!(
                    "expected {} coordinates, got {}",
                    dims * 2,
                    record.coords.len()
                )));
            }
            let mut cell = Cell::new(record.rowid.unwrap_or(0), kind);
            for dim in 0..dims {
                let (lo, hi) = (record.coords[dim * 2], record.coords[dim * 2 + 1]);
                let (lo, hi) = match kind {
                    // Round the stored bounds outward so the f32 box still
                    // covers the requested f64 box.
                    CoordKind::Real32 => (
                        Coord::Real(f32_down(lo)),
                        Coord::Real(f32_up(hi)),
                    ),
                    CoordKind::Int32 => (Coord::Int(lo as i32), Coord::Int(hi as i32)),
                };
                if lo.to_f64() > hi.to_f64() {
                    return Err(SpatialError::Constraint(format!(
                        "dimension {}: min {} is greater than max {}",
                        dim,
                        lo.to_f64(),
                        hi.to_f64()
                    )));
                }
                cell.coords[dim * 2] = lo;
                cell.coords[dim * 2 + 1] = hi;
            }

            // An explicitly supplied rowid must not collide with an existing
            // row, unless the caller asked for replacement or is updating
            // that same row.
            if let Some(rowid) = record.rowid {
                if delete_rowid != Some(rowid)
                    && ops.storage.read_rowid(rowid)?.is_some()
                {
                    if on_conflict_replace {
                        ops.delete_rowid(rowid)?;
                    } else {
                        return Err(SpatialError::Constraint(format!(
                            "rowid {} already exists",
                            rowid
                        )));
                    }
                }
            }
            new_cell = Some(cell);
        }

        if let Some(rowid) = delete_rowid {
            ops.delete_rowid(rowid)?;
        }

        if let Some(mut cell) = new_cell {
            let rowid = match insert.as_ref().and_then(|r| r.rowid) {
                Some(rowid) => rowid,
                None => ops.storage.new_rowid()?,
            };
            cell.rowid = rowid;
            ops.insert_record(&cell)?;
            return Ok(Some(rowid));
        }
        Ok(None)
    }

    /// Inserts a record, generating a rowid when none is supplied.
    pub fn insert(&self, rowid: Option<i64>, coords: &[f64]) -> SpatialResult<i64> {
        let inserted = self.update(
            None,
            Some(UpdateRecord { rowid, coords: coords.to_vec() }),
            false,
        )?;
        inserted.ok_or_else(|| {
            SpatialError::Io("insert returned no rowid".to_string())
        })
    }

    /// Removes the record with the given rowid.
    pub fn delete(&self, rowid: i64) -> SpatialResult<()> {
        self.update(Some(rowid), None, false).map(|_| ())
    }

    /// Renames the three underlying tables.
    pub fn rename(&self, new_name: &str) -> SpatialResult<()> {
        let old_name = self.inner.name.read().clone();
        self.inner.storage.rename(&old_name, new_name)?;
        *self.inner.name.write() = new_name.to_string();
        log::debug!("renamed rtree table {} to {}", old_name, new_name);
        Ok(())
    }

    /// Drops the three underlying tables. Refused while cursors or
    /// mutations are active.
    pub fn destroy(&self) -> SpatialResult<()> {
        if self.inner.busy.load(Ordering::SeqCst) > 0 {
            return Err(SpatialError::InvalidArgument(
                "cannot destroy an rtree table while it is in use".to_string(),
            ));
        }
        let name = self.inner.name.read().clone();
        log::debug!("destroying rtree table {}", name);
        self.inner.storage.destroy(&name)
    }

    /// Walks the whole structure checking the bounding-containment and
    /// occupancy invariants plus the consistency of the rowid and parent
    /// mapping tables.
    pub fn check_integrity(&self) -> SpatialResult<IntegrityReport> {
        let _busy = BusyGuard::enter(&self.inner.busy);
        let mut state = self.inner.state.lock();
        let mut ops = Ops::new(&self.inner, &mut state);

        let mut report = IntegrityReport { is_valid: true, ..Default::default() };
        let root = ops.acquire(ROOT_NODE, None)?;
        let depth = ops.state.cache.depth();
        let result = match depth {
            Ok(depth) => ops.verify_node(&root, depth as i32, &mut report),
            Err(e) => Err(e),
        };
        let released = ops.release(root);
        result?;
        released?;
        report.is_valid = report.errors.is_empty();
        Ok(report)
    }
}

// Rounding multipliers for narrowing f64 query values to stored f32
// coordinates without shrinking the requested box.
const RND_TOWARDS: f64 = 1.0 - 1.0 / 8388608.0;
const RND_AWAY: f64 = 1.0 + 1.0 / 8388608.0;

fn f32_down(d: f64) -> f32 {
    let f = d as f32;
    if f as f64 > d {
        if d < 0.0 {
            (d * RND_AWAY) as f32
        } else {
            (d * RND_TOWARDS) as f32
        }
    } else {
        f
    }
}

fn f32_up(d: f64) -> f32 {
    let f = d as f32;
    if (f as f64) < d {
        if d < 0.0 {
            (d * RND_TOWARDS) as f32
        } else {
            (d * RND_AWAY) as f32
        }
    } else {
        f
    }
}

/// A view over the locked table state carrying all structural algorithms.
pub(crate) struct Ops<'a> {
    pub meta: &'a TableMeta,
    pub storage: &'a TableStorage,
    pub state: &'a mut TreeState,
}

impl<'a> Ops<'a> {
    pub fn new(inner: &'a RTreeInner, state: &'a mut TreeState) -> Ops<'a> {
        Ops { meta: &inner.meta, storage: &inner.storage, state }
    }

    pub fn acquire(&mut self, node_no: i64, parent: Option<&NodeRef>) -> SpatialResult<NodeRef> {
        self.state.cache.acquire(self.storage, node_no, parent)
    }

    pub fn release(&mut self, node: NodeRef) -> SpatialResult<()> {
        self.state.cache.release(self.storage, node)
    }

    /// Release on an error path: the primary error wins, a secondary
    /// release failure is only logged.
    pub fn release_quiet(&mut self, node: NodeRef) {
        if let Err(e) = self.state.cache.release(self.storage, node) {
            log::warn!("node release failed on error path: {}", e);
        }
    }

    pub fn cell_count(&self, node: &NodeRef) -> usize {
        self.meta.layout.cell_count(self.state.cache.data(node))
    }

    pub fn get_cell(&self, node: &NodeRef, i: usize) -> Cell {
        self.meta.layout.get_cell(self.state.cache.data(node), i)
    }

    pub fn get_rowid(&self, node: &NodeRef, i: usize) -> i64 {
        self.meta.layout.get_rowid(self.state.cache.data(node), i)
    }

    /// Index of the cell holding `rowid` within `node`. The caller knows the
    /// cell is there; absence means the structure is corrupt.
    pub fn node_rowid_index(&self, node: &NodeRef, rowid: i64) -> SpatialResult<usize> {
        self.slot_rowid_index(node.slot(), rowid)
    }

    fn slot_rowid_index(&self, slot_id: usize, rowid: i64) -> SpatialResult<usize> {
        let layout = &self.meta.layout;
        let data = self.state.cache.slot_data(slot_id);
        let count = layout.cell_count(data);
        for i in 0..count {
            if layout.get_rowid(data, i) == rowid {
                return Ok(i);
            }
        }
        Err(SpatialError::Corrupt(format!(
            "node {} has no cell for {}",
            self.state.cache.slot_node_no(slot_id),
            rowid
        )))
    }

    /// The resident parent of `node` plus the index of the cell pointing at
    /// `node` within it; `None` for the root.
    pub fn node_parent_index(&self, node: &NodeRef) -> SpatialResult<Option<(usize, usize)>> {
        match self.state.cache.parent_slot(node) {
            Some(parent_slot) => {
                let idx =
                    self.slot_rowid_index(parent_slot, self.state.cache.node_no(node))?;
                Ok(Some((parent_slot, idx)))
            }
            None => Ok(None),
        }
    }

    /// Descends from the root to the node at `height` whose bounding box
    /// needs the least enlargement to absorb `cell` (Guttman's ChooseLeaf;
    /// ChooseSubtree in R*-tree terms). Ties fall to the smaller area; the
    /// R*-tree refinement additionally prefers the least overlap enlargement
    /// at the level immediately above the leaves.
    pub fn choose_subtree(&mut self, cell: &Cell, height: i32) -> SpatialResult<NodeRef> {
        let dims = self.meta.dims;
        let mut node = self.acquire(ROOT_NODE, None)?;
        let depth = match self.state.cache.depth() {
            Ok(d) => d as i32,
            Err(e) => {
                self.release_quiet(node);
                return Err(e);
            }
        };

        for level in 0..depth - height {
            let count = self.cell_count(&node);
            let use_overlap = self.meta.rstar_choose_subtree && level == depth - 1;
            let siblings: Vec<Cell> = if use_overlap {
                (0..count).map(|i| self.get_cell(&node, i)).collect()
            } else {
                Vec::new()
            };

            let mut best_rowid = 0;
            let mut min_growth = 0.0;
            let mut min_area = 0.0;
            let mut min_overlap = 0.0;
            for i in 0..count {
                let candidate = self.get_cell(&node, i);
                let growth = candidate.growth(cell, dims);
                let area = candidate.area(dims);
                let better = if use_overlap {
                    let enlargement =
                        overlap_enlargement(&candidate, cell, &siblings, i, dims);
                    let better = i == 0
                        || enlargement < min_overlap
                        || (enlargement == min_overlap && growth < min_growth)
                        || (enlargement == min_overlap
                            && growth == min_growth
                            && area < min_area);
                    if better {
                        min_overlap = enlargement;
                    }
                    better
                } else {
                    i == 0 || growth < min_growth || (growth == min_growth && area < min_area)
                };
                if better {
                    min_growth = growth;
                    min_area = area;
                    best_rowid = candidate.rowid;
                }
            }

            let child = match self.acquire(best_rowid, Some(&node)) {
                Ok(child) => child,
                Err(e) => {
                    self.release_quiet(node);
                    return Err(e);
                }
            };
            if let Err(e) = self.release(node) {
                self.release_quiet(child);
                return Err(e);
            }
            node = child;
        }
        Ok(node)
    }

    /// A cell with the bounds of `cell` was just written into `node`; widen
    /// every ancestor's bounding cell that does not already contain it.
    pub fn adjust_tree(&mut self, node: &NodeRef, cell: &Cell) -> SpatialResult<()> {
        let dims = self.meta.dims;
        let layout = self.meta.layout;
        let mut child_slot = node.slot();
        while let Some(parent_slot) = self.state.cache.slot_parent(child_slot) {
            let child_no = self.state.cache.slot_node_no(child_slot);
            let idx = self.slot_rowid_index(parent_slot, child_no)?;
            let mut parent_cell =
                layout.get_cell(self.state.cache.slot_data(parent_slot), idx);
            if parent_cell.contains(cell, dims) {
                // Ancestors contain their children's bounds, so containment
                // here implies containment all the way up.
                break;
            }
            parent_cell.union_with(cell, dims);
            layout.overwrite_cell(
                self.state.cache.slot_data_mut(parent_slot),
                &parent_cell,
                idx,
            );
            child_slot = parent_slot;
        }
        Ok(())
    }

    /// Records that the entry `rowid` now lives in `node`: the rowid table
    /// for leaf entries, the parent table (plus the in-cache parent link)
    /// for child nodes.
    fn update_mapping(&mut self, rowid: i64, node: &NodeRef, height: i32) -> SpatialResult<()> {
        let node_no = self.state.cache.node_no(node);
        if height > 0 {
            self.state.cache.reparent_cached(self.storage, rowid, node)?;
            self.storage.write_parent(rowid, node_no)
        } else {
            self.storage.write_rowid(rowid, node_no)
        }
    }

    /// Inserts `cell` into `node`, which heads a subtree `height` high
    /// (leaves are height 0). A full node either splits or, under the
    /// R*-tree policy, performs one forced reinsertion per height per
    /// top-level operation (never on the root).
    pub fn insert_cell(&mut self, node: &NodeRef, cell: &Cell, height: i32) -> SpatialResult<()> {
        if height > 0 {
            self.state.cache.reparent_cached(self.storage, cell.rowid, node)?;
        }
        let layout = self.meta.layout;
        let full =
            layout.cell_count(self.state.cache.data(node)) >= layout.capacity();
        if full {
            if self.meta.rstar_reinsert
                && height > self.state.reinsert_height
                && self.state.cache.node_no(node) != ROOT_NODE
            {
                self.state.reinsert_height = height;
                self.reinsert(node, cell, height)
            } else {
                self.split_node(node, cell, height)
            }
        } else {
            let _ = layout.append_cell(self.state.cache.data_mut(node), cell);
            self.adjust_tree(node, cell)?;
            let node_no = self.state.cache.node_no(node);
            if height == 0 {
                self.storage.write_rowid(cell.rowid, node_no)
            } else {
                self.storage.write_parent(cell.rowid, node_no)
            }
        }
    }

    /// Splits the full `node`, distributing its cells plus `cell` between it
    /// and a fresh sibling with the configured strategy. A root split grows
    /// the tree by one level.
    fn split_node(&mut self, node: &NodeRef, cell: &Cell, height: i32) -> SpatialResult<()> {
        let layout = self.meta.layout;
        let count = self.cell_count(node);
        let mut cells: Vec<Cell> = Vec::new();
        cells
            .try_reserve_exact(count + 1)
            .map_err(|_| SpatialError::OutOfMemory)?;
        for i in 0..count {
            cells.push(self.get_cell(node, i));
        }
        cells.push(*cell);
        self.state.cache.zero(node);

        let is_root = self.state.cache.node_no(node) == ROOT_NODE;
        let (left, right) = if is_root {
            // The root keeps its number; both halves become fresh children
            // and the tree deepens by one.
            let right = self.state.cache.new_node(Some(node));
            let left = self.state.cache.new_node(Some(node));
            let depth = self.state.cache.depth()? + 1;
            self.state.cache.set_depth(depth);
            write_u16(self.state.cache.data_mut(node), depth);
            (left, right)
        } else {
            let left = self.state.cache.retain(node);
            let right = match self.state.cache.parent_slot(node) {
                Some(parent_slot) => {
                    let parent = self.state.cache.retain_slot(parent_slot);
                    let right = self.state.cache.new_node(Some(&parent));
                    self.release(parent)?;
                    right
                }
                None => {
                    self.state.cache.release(self.storage, left).ok();
                    return Err(SpatialError::Corrupt(
                        "splitting a non-root node with no parent".to_string(),
                    ));
                }
            };
            (left, right)
        };

        let result = self.split_node_finish(node, &left, &right, &cells, cell, height, is_root);
        let released_right = self.release(right);
        let released_left = self.release(left);
        result.and(released_right).and(released_left)
    }

    #[allow(clippy::too_many_arguments)]
    fn split_node_finish(
        &mut self,
        node: &NodeRef,
        left: &NodeRef,
        right: &NodeRef,
        cells: &[Cell],
        new_cell: &Cell,
        height: i32,
        is_root: bool,
    ) -> SpatialResult<()> {
        let layout = self.meta.layout;
        let partition = self.meta.split.split(&layout, cells)?;

        for &i in &partition.left {
            let _ = layout.append_cell(self.state.cache.data_mut(left), &cells[i]);
        }
        for &i in &partition.right {
            let _ = layout.append_cell(self.state.cache.data_mut(right), &cells[i]);
        }

        // Both halves need node numbers before their bounding cells can be
        // written into the parent.
        self.state.cache.write(self.storage, right)?;
        if self.state.cache.node_no(left) == 0 {
            self.state.cache.write(self.storage, left)?;
        }

        let mut left_bbox = partition.left_bbox;
        let mut right_bbox = partition.right_bbox;
        left_bbox.rowid = self.state.cache.node_no(left);
        right_bbox.rowid = self.state.cache.node_no(right);

        if is_root {
            self.insert_cell(node, &left_bbox, height + 1)?;
        } else {
            let parent_slot = self.state.cache.parent_slot(left).ok_or_else(|| {
                SpatialError::Corrupt("split node lost its parent".to_string())
            })?;
            let idx = self.slot_rowid_index(parent_slot, left_bbox.rowid)?;
            layout.overwrite_cell(
                self.state.cache.slot_data_mut(parent_slot),
                &left_bbox,
                idx,
            );
            let parent = self.state.cache.retain_slot(parent_slot);
            let adjusted = self.adjust_tree(&parent, &left_bbox);
            let released = self.release(parent);
            adjusted.and(released)?;
        }

        {
            let parent_slot = self.state.cache.parent_slot(right).ok_or_else(|| {
                SpatialError::Corrupt("new sibling has no parent".to_string())
            })?;
            let parent = self.state.cache.retain_slot(parent_slot);
            let inserted = self.insert_cell(&parent, &right_bbox, height + 1);
            let released = self.release(parent);
            inserted.and(released)?;
        }

        // Every relocated cell needs its rowid/parent mapping rewritten.
        let mut new_cell_is_right = false;
        for i in 0..self.cell_count(right) {
            let rowid = self.get_rowid(right, i);
            if rowid == new_cell.rowid {
                new_cell_is_right = true;
            }
            self.update_mapping(rowid, right, height)?;
        }
        if is_root {
            for i in 0..self.cell_count(left) {
                let rowid = self.get_rowid(left, i);
                self.update_mapping(rowid, left, height)?;
            }
        } else if !new_cell_is_right {
            self.update_mapping(new_cell.rowid, left, height)?;
        }
        Ok(())
    }

    /// R*-tree forced reinsertion: keep the cells whose extent profile is
    /// closest to the node's centroid, rewrite the node's bounding
    /// structure, and reinsert the rest from the root at the same height.
    fn reinsert(&mut self, node: &NodeRef, cell: &Cell, height: i32) -> SpatialResult<()> {
        let layout = self.meta.layout;
        let dims = self.meta.dims;
        let count = self.cell_count(node) + 1;

        let mut cells: Vec<Cell> = Vec::new();
        cells
            .try_reserve_exact(count)
            .map_err(|_| SpatialError::OutOfMemory)?;
        for i in 0..count - 1 {
            cells.push(self.get_cell(node, i));
        }
        cells.push(*cell);

        let mut center = [0.0f64; MAX_DIMENSIONS];
        for c in &cells {
            for (dim, entry) in center.iter_mut().enumerate().take(dims) {
                *entry += c.min(dim).to_f64() + c.max(dim).to_f64();
            }
        }
        for entry in center.iter_mut().take(dims) {
            *entry /= (count * 2) as f64;
        }

        let mut distance = vec![0.0f64; count];
        for (i, c) in cells.iter().enumerate() {
            for (dim, entry) in center.iter().enumerate().take(dims) {
                let extent = c.max(dim).to_f64() - c.min(dim).to_f64();
                distance[i] += (extent - entry) * (extent - entry);
            }
        }

        let mut order: Vec<usize> = (0..count).collect();
        sort_by_distance(&mut order, &distance);
        self.state.cache.zero(node);

        let keep = count - (layout.min_cells() + 1);
        let node_no = self.state.cache.node_no(node);
        for &i in order.iter().take(keep) {
            let kept = &cells[i];
            let _ = layout.append_cell(self.state.cache.data_mut(node), kept);
            if kept.rowid == cell.rowid {
                if height == 0 {
                    self.storage.write_rowid(kept.rowid, node_no)?;
                } else {
                    self.storage.write_parent(kept.rowid, node_no)?;
                }
            }
        }
        self.fix_bounding_box(node)?;

        for &i in order.iter().skip(keep) {
            let relocated = cells[i];
            let target = self.choose_subtree(&relocated, height)?;
            let inserted = self.insert_cell(&target, &relocated, height);
            let released = self.release(target);
            inserted.and(released)?;
        }
        Ok(())
    }

    /// Recomputes the bounding cell of `node` in its parent, propagating
    /// upward.
    pub fn fix_bounding_box(&mut self, node: &NodeRef) -> SpatialResult<()> {
        let dims = self.meta.dims;
        let layout = self.meta.layout;
        let mut slot = node.slot();
        while let Some(parent_slot) = self.state.cache.slot_parent(slot) {
            let data = self.state.cache.slot_data(slot);
            let count = layout.cell_count(data);
            if count == 0 {
                return Err(SpatialError::Corrupt(
                    "interior node with no cells".to_string(),
                ));
            }
            let mut bbox = layout.get_cell(data, 0);
            for i in 1..count {
                bbox.union_with(&layout.get_cell(data, i), dims);
            }
            bbox.rowid = self.state.cache.slot_node_no(slot);
            let idx = self.slot_rowid_index(parent_slot, bbox.rowid)?;
            layout.overwrite_cell(self.state.cache.slot_data_mut(parent_slot), &bbox, idx);
            slot = parent_slot;
        }
        Ok(())
    }

    /// Loads the ancestor chain of `leaf` up to the root through the parent
    /// table. Deletion lands on a leaf via the rowid table, so the chain is
    /// not in memory yet.
    fn fix_leaf_parent(&mut self, leaf: &NodeRef) -> SpatialResult<()> {
        let mut child_slot = leaf.slot();
        loop {
            let child_no = self.state.cache.slot_node_no(child_slot);
            if child_no == ROOT_NODE || self.state.cache.slot_parent(child_slot).is_some() {
                return Ok(());
            }
            let parent_no = self.storage.read_parent(child_no)?.ok_or_else(|| {
                SpatialError::Corrupt(format!("node {} has no parent entry", child_no))
            })?;

            // Guard against a reference loop in the parent table before
            // linking it in.
            let mut probe = Some(leaf.slot());
            while let Some(p) = probe {
                if self.state.cache.slot_node_no(p) == parent_no {
                    return Err(SpatialError::Corrupt(format!(
                        "parent table forms a cycle through node {}",
                        parent_no
                    )));
                }
                probe = self.state.cache.slot_parent(p);
            }

            let parent = self.acquire(parent_no, None)?;
            let parent_slot = parent.slot();
            self.state.cache.adopt_parent(child_slot, parent);
            child_slot = parent_slot;
        }
    }

    /// Unlinks an underfull (or promoted-away) node from the tree: removes
    /// its cell from the parent, deletes its node/parent rows and queues its
    /// content for reinsertion at `height`.
    fn remove_node(&mut self, node: &NodeRef, height: i32) -> SpatialResult<()> {
        let node_no = self.state.cache.node_no(node);
        let parent = self.state.cache.detach_parent(node).ok_or_else(|| {
            SpatialError::Corrupt("removing a node with no parent".to_string())
        })?;
        let deleted = match self.slot_rowid_index(parent.slot(), node_no) {
            Ok(idx) => self.delete_cell(&parent, idx, height + 1),
            Err(e) => Err(e),
        };
        let released = self.release(parent);
        deleted.and(released)?;

        self.storage.delete_node(node_no)?;
        self.storage.delete_parent(node_no)?;

        let mut data = Vec::new();
        data.try_reserve_exact(self.meta.layout.node_size)
            .map_err(|_| SpatialError::OutOfMemory)?;
        data.extend_from_slice(self.state.cache.data(node));
        // The node is out of the structure; its content lives on in the
        // pending queue and must not be flushed back.
        self.state.cache.discard(node);
        self.state.pending.push(PendingNode { height, data });
        Ok(())
    }

    /// Deletes cell `idx` from `node` and restores the structure: an
    /// underfull non-root node is removed wholesale, otherwise the parent's
    /// bounding cell is tightened.
    fn delete_cell(&mut self, node: &NodeRef, idx: usize, height: i32) -> SpatialResult<()> {
        self.fix_leaf_parent(node)?;
        let layout = self.meta.layout;
        layout.delete_cell(self.state.cache.data_mut(node), idx);
        if self.state.cache.parent_slot(node).is_some() {
            if layout.cell_count(self.state.cache.data(node)) < layout.min_cells() {
                self.remove_node(node, height)?;
            } else {
                self.fix_bounding_box(node)?;
            }
        }
        Ok(())
    }

    fn reinsert_node_content(&mut self, pending: &PendingNode) -> SpatialResult<()> {
        let layout = self.meta.layout;
        let count = layout.cell_count(&pending.data);
        for i in 0..count {
            let cell = layout.get_cell(&pending.data, i);
            let target = self.choose_subtree(&cell, pending.height)?;
            let inserted = self.insert_cell(&target, &cell, pending.height);
            let released = self.release(target);
            inserted.and(released)?;
        }
        Ok(())
    }

    /// Top-level insert of a fully built cell.
    pub fn insert_record(&mut self, cell: &Cell) -> SpatialResult<()> {
        self.state.reinsert_height = -1;
        let leaf = self.choose_subtree(cell, 0)?;
        let inserted = self.insert_cell(&leaf, cell, 0);
        let released = self.release(leaf);
        inserted.and(released)
    }

    /// Top-level removal of the entry with the given rowid.
    pub fn delete_rowid(&mut self, rowid: i64) -> SpatialResult<()> {
        self.state.reinsert_height = -1;
        let root = self.acquire(ROOT_NODE, None)?;
        let result = self.delete_rowid_inner(&root, rowid);
        let released = self.release(root);
        result.and(released)
    }

    fn delete_rowid_inner(&mut self, root: &NodeRef, rowid: i64) -> SpatialResult<()> {
        if let Some(leaf_no) = self.storage.read_rowid(rowid)? {
            let leaf = self.acquire(leaf_no, None)?;
            let deleted = match self.node_rowid_index(&leaf, rowid) {
                Ok(idx) => self.delete_cell(&leaf, idx, 0),
                Err(e) => Err(e),
            };
            let released = self.release(leaf);
            deleted.and(released)?;
        }

        self.storage.delete_rowid(rowid)?;

        // A root left with a single child absorbs it: the child is removed
        // and queued for reinsertion one level down, undoing a root split.
        let depth = self.state.cache.depth()? as i32;
        if depth > 0 && self.cell_count(root) == 1 {
            let child_no = self.get_rowid(root, 0);
            let child = self.acquire(child_no, Some(root))?;
            let removed = self.remove_node(&child, depth - 1);
            let released = self.release(child);
            removed.and(released)?;
            let new_depth = (depth - 1) as u16;
            self.state.cache.set_depth(new_depth);
            write_u16(self.state.cache.data_mut(root), new_depth);
        }

        // Drain the pending queue even when a reinsertion fails; content
        // behind the failure is discarded with the error.
        let mut result = Ok(());
        while let Some(pending) = self.state.pending.pop() {
            if result.is_ok() {
                result = self.reinsert_node_content(&pending);
            }
        }
        result
    }

    fn verify_node(
        &mut self,
        node: &NodeRef,
        height: i32,
        report: &mut IntegrityReport,
    ) -> SpatialResult<()> {
        let layout = self.meta.layout;
        let node_no = self.state.cache.node_no(node);
        let count = self.cell_count(node);
        report.nodes_checked += 1;

        if node_no != ROOT_NODE && (count < layout.min_cells() || count > layout.capacity()) {
            report.errors.push(format!(
                "node {} holds {} cells outside [{}, {}]",
                node_no,
                count,
                layout.min_cells(),
                layout.capacity()
            ));
        }

        if height == 0 {
            for i in 0..count {
                let rowid = self.get_rowid(node, i);
                if self.storage.read_rowid(rowid)? != Some(node_no) {
                    report.errors.push(format!(
                        "rowid {} does not map back to leaf {}",
                        rowid, node_no
                    ));
                }
                report.entries += 1;
            }
            return Ok(());
        }

        for i in 0..count {
            let cell = self.get_cell(node, i);
            let child = self.acquire(cell.rowid, Some(node))?;
            let verified = self.verify_child(node_no, &cell, &child, height, report);
            let released = self.release(child);
            verified.and(released)?;
        }
        Ok(())
    }

    fn verify_child(
        &mut self,
        node_no: i64,
        cell: &Cell,
        child: &NodeRef,
        height: i32,
        report: &mut IntegrityReport,
    ) -> SpatialResult<()> {
        let dims = self.meta.dims;
        let child_count = self.cell_count(child);
        if child_count > 0 {
            let mut bbox = self.get_cell(child, 0);
            for j in 1..child_count {
                let c = self.get_cell(child, j);
                bbox.union_with(&c, dims);
            }
            if !cell.contains(&bbox, dims) {
                report.errors.push(format!(
                    "cell for child {} in node {} does not contain the child's bounds",
                    cell.rowid, node_no
                ));
            }
        }
        if self.storage.read_parent(cell.rowid)? != Some(node_no) {
            report.errors.push(format!(
                "parent table does not map node {} to {}",
                cell.rowid, node_no
            ));
        }
        self.verify_node(child, height - 1, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapis::store::memory::{InMemoryStore, InMemoryStoreConfig};

    fn small_store() -> Store {
        // node size 164 - 64 = 100 bytes: capacity 4 for a 2-D table.
        Store::new(InMemoryStore::new(
            InMemoryStoreConfig::new().with_page_size(164),
        ))
    }

    fn columns_2d() -> Vec<&'static str> {
        vec!["id", "x1", "x2", "y1", "y2"]
    }

    #[test]
    fn test_validate_columns() {
        let store = small_store();
        let err = RTree::create(&store, "a", &["id", "x1"], RTreeConfig::default()).unwrap_err();
        assert!(err.to_string().contains("Too few columns"));

        let too_many: Vec<&str> = vec!["c"; 13];
        let err = RTree::create(&store, "b", &too_many, RTreeConfig::default()).unwrap_err();
        assert!(err.to_string().contains("Too many columns"));

        let err = RTree::create(&store, "c", &["id", "x1", "x2", "y1"], RTreeConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("Wrong number of columns"));
    }

    #[test]
    fn test_create_derives_node_size_from_page_size() {
        let store = small_store();
        let tree = RTree::create(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap();
        assert_eq!(tree.node_capacity(), 4);
        assert_eq!(tree.dimensions(), 2);
        assert_eq!(tree.depth().unwrap(), 0);
    }

    #[test]
    fn test_create_caps_node_size() {
        let store = Store::new(InMemoryStore::new(
            InMemoryStoreConfig::new().with_page_size(1 << 20),
        ));
        let tree = RTree::create(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap();
        assert_eq!(tree.node_capacity(), MAX_CELLS_PER_NODE);
    }

    #[test]
    fn test_create_rejects_tiny_page() {
        let store = Store::new(InMemoryStore::new(
            InMemoryStoreConfig::new().with_page_size(100),
        ));
        let err =
            RTree::create(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap_err();
        assert!(matches!(err, SpatialError::InvalidArgument(_)));
    }

    #[test]
    fn test_connect_recovers_node_size() {
        let store = small_store();
        {
            let tree =
                RTree::create(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap();
            tree.insert(Some(1), &[0.0, 1.0, 0.0, 1.0]).unwrap();
        }
        let tree = RTree::connect(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap();
        assert_eq!(tree.node_capacity(), 4);
        let report = tree.check_integrity().unwrap();
        assert!(report.is_valid);
        assert_eq!(report.entries, 1);
    }

    #[test]
    fn test_connect_missing_table_is_corrupt() {
        let store = small_store();
        let err =
            RTree::connect(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap_err();
        assert!(matches!(err, SpatialError::Corrupt(_)));
    }

    #[test]
    fn test_insert_generates_rowids() {
        let store = small_store();
        let tree = RTree::create(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap();
        let r1 = tree.insert(None, &[0.0, 1.0, 0.0, 1.0]).unwrap();
        let r2 = tree.insert(None, &[2.0, 3.0, 2.0, 3.0]).unwrap();
        assert!(r2 > r1);
    }

    #[test]
    fn test_insert_min_greater_than_max_is_constraint() {
        let store = small_store();
        let tree = RTree::create(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap();
        tree.insert(Some(1), &[0.0, 1.0, 0.0, 1.0]).unwrap();
        let err = tree.insert(Some(2), &[5.0, 2.0, 0.0, 1.0]).unwrap_err();
        assert!(matches!(err, SpatialError::Constraint(_)));
        // The failed insert mutated nothing.
        let report = tree.check_integrity().unwrap();
        assert!(report.is_valid);
        assert_eq!(report.entries, 1);
    }

    #[test]
    fn test_duplicate_rowid_constraint_and_replace() {
        let store = small_store();
        let tree = RTree::create(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap();
        tree.insert(Some(5), &[0.0, 1.0, 0.0, 1.0]).unwrap();
        let err = tree.insert(Some(5), &[2.0, 3.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, SpatialError::Constraint(_)));

        // Replace policy removes the old row first.
        let record = UpdateRecord { rowid: Some(5), coords: vec![2.0, 3.0, 2.0, 3.0] };
        tree.update(None, Some(record), true).unwrap();
        let report = tree.check_integrity().unwrap();
        assert!(report.is_valid);
        assert_eq!(report.entries, 1);
    }

    #[test]
    fn test_update_same_rowid_is_not_a_conflict() {
        let store = small_store();
        let tree = RTree::create(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap();
        tree.insert(Some(9), &[0.0, 1.0, 0.0, 1.0]).unwrap();
        let record = UpdateRecord { rowid: Some(9), coords: vec![4.0, 5.0, 4.0, 5.0] };
        tree.update(Some(9), Some(record), false).unwrap();
        assert_eq!(tree.check_integrity().unwrap().entries, 1);
    }

    #[test]
    fn test_split_grows_tree() {
        let store = small_store();
        let tree = RTree::create(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap();
        for i in 0..8 {
            let base = i as f64;
            tree.insert(Some(i + 1), &[base, base + 0.5, base, base + 0.5])
                .unwrap();
        }
        assert_eq!(tree.depth().unwrap(), 1);
        let report = tree.check_integrity().unwrap();
        assert!(report.is_valid, "errors: {:?}", report.errors);
        assert_eq!(report.entries, 8);
    }

    #[test]
    fn test_int32_table_round_trip() {
        let store = small_store();
        let config = RTreeConfig { coord_kind: CoordKind::Int32, ..Default::default() };
        let tree = RTree::create(&store, "rt", &columns_2d(), config).unwrap();
        tree.insert(Some(1), &[-5.0, 5.0, -5.0, 5.0]).unwrap();
        let mut cursor = tree.open_cursor();
        let plan = crate::module::best_index(&[crate::module::ConstraintInfo {
            column: 0,
            op: crate::module::IndexOp::Eq,
            usable: true,
        }]);
        cursor
            .filter(&plan, &[crate::module::QueryValue::Integer(1)])
            .unwrap();
        assert!(!cursor.eof());
        assert_eq!(
            cursor.column(1).unwrap(),
            crate::cursor::ColumnValue::Integer(-5)
        );
    }

    #[test]
    fn test_rename_and_destroy() {
        let store = small_store();
        let tree = RTree::create(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap();
        tree.insert(Some(1), &[0.0, 1.0, 0.0, 1.0]).unwrap();
        tree.rename("rt2").unwrap();
        assert_eq!(tree.name(), "rt2");
        assert!(store.has_map("rt2_node").unwrap());
        assert!(!store.has_map("rt_node").unwrap());
        // Still queryable after the rename.
        assert_eq!(tree.check_integrity().unwrap().entries, 1);

        tree.destroy().unwrap();
        assert!(!store.has_map("rt2_node").unwrap());
    }

    #[test]
    fn test_destroy_refused_while_cursor_open() {
        let store = small_store();
        let tree = RTree::create(&store, "rt", &columns_2d(), RTreeConfig::default()).unwrap();
        let cursor = tree.open_cursor();
        assert!(tree.destroy().is_err());
        drop(cursor);
        tree.destroy().unwrap();
    }

    #[test]
    fn test_f32_rounding_preserves_containment() {
        // A value that f32 cannot represent exactly.
        let v = 1.000000059604644775390625e-1_f64 * 3.0;
        assert!(f32_down(v) as f64 <= v);
        assert!(f32_up(v) as f64 >= v);
        assert!(f32_down(-v) as f64 <= -v);
        assert!(f32_up(-v) as f64 >= -v);
    }
}
