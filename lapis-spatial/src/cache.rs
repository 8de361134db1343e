//! In-memory node cache with reference counting and write-back.
//!
//! Nodes live in an arena of slots. A hash index keyed by node number covers
//! exactly the nodes that currently hold a positive reference count and have
//! an assigned number; freshly created nodes stay unindexed until their
//! first write assigns one. Releasing the last reference writes the node
//! back (if dirty), drops it from the index and recycles the slot, so each
//! checkout episode costs at most one flush.
//!
//! Parent links are counted references between slots. They are released as
//! part of finalizing a child, with the whole chain walked by an explicit
//! loop so the depth cap never turns into call-stack depth.

use crate::error::{SpatialError, SpatialResult};
use crate::node::{node_depth, read_u16, NodeLayout, MAX_DEPTH};
use crate::storage::{TableStorage, ROOT_NODE};
use std::collections::HashMap;

/// An owned reference to a cached node. Must be given back through
/// [`NodeCache::release`]; holding it keeps the slot alive.
#[derive(Debug)]
pub(crate) struct NodeRef {
    slot: usize,
}

impl NodeRef {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

struct Slot {
    /// Assigned node number, 0 while the node has never been written.
    node_no: i64,
    ref_count: u32,
    dirty: bool,
    /// Counted reference to the parent slot.
    parent: Option<usize>,
    data: Vec<u8>,
}

pub(crate) struct NodeCache {
    layout: NodeLayout,
    slots: Vec<Option<Slot>>,
    free_slots: Vec<usize>,
    index: HashMap<i64, usize>,
    /// Tree depth read from the root header; invalidated when the root
    /// leaves the cache.
    depth: Option<u16>,
}

impl NodeCache {
    pub fn new(layout: NodeLayout) -> NodeCache {
        NodeCache {
            layout,
            slots: Vec::new(),
            free_slots: Vec::new(),
            index: HashMap::new(),
            depth: None,
        }
    }

    fn slot(&self, id: usize) -> &Slot {
        self.slots[id].as_ref().expect("released node slot")
    }

    fn slot_mut(&mut self, id: usize) -> &mut Slot {
        self.slots[id].as_mut().expect("released node slot")
    }

    fn alloc(&mut self, slot: Slot) -> usize {
        match self.free_slots.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    /// The cached tree depth. Only meaningful while the root is resident;
    /// acquire node 1 first.
    pub fn depth(&self) -> SpatialResult<u16> {
        self.depth
            .ok_or_else(|| SpatialError::Corrupt("tree depth is not resident".to_string()))
    }

    pub fn set_depth(&mut self, depth: u16) {
        self.depth = Some(depth);
    }

    /// Obtains a reference to node `node_no`, loading it from the backing
    /// store on a cache miss.
    ///
    /// A resident node gets its reference count bumped; the parent link is
    /// attached when one is supplied and none is set yet. A loaded node is
    /// validated: the buffer must be exactly one node long and the cell
    /// count must fit the capacity. Loading the root additionally reads the
    /// depth header, bounded by [`MAX_DEPTH`]. A missing node is corruption:
    /// the root always exists, and any other number was reached through a
    /// child pointer.
    pub fn acquire(
        &mut self,
        storage: &TableStorage,
        node_no: i64,
        parent: Option<&NodeRef>,
    ) -> SpatialResult<NodeRef> {
        if let Some(&slot_id) = self.index.get(&node_no) {
            if let Some(parent) = parent {
                if self.slot(slot_id).parent.is_none() {
                    let parent_slot = parent.slot;
                    self.slot_mut(parent_slot).ref_count += 1;
                    self.slot_mut(slot_id).parent = Some(parent_slot);
                }
            }
            self.slot_mut(slot_id).ref_count += 1;
            return Ok(NodeRef { slot: slot_id });
        }

        let data = storage.read_node(node_no)?.ok_or_else(|| {
            log::error!("node {} is missing from the node table", node_no);
            SpatialError::Corrupt(format!("node {} is missing", node_no))
        })?;
        if data.len() != self.layout.node_size {
            return Err(SpatialError::Corrupt(format!(
                "node {} is {} bytes, expected {}",
                node_no,
                data.len(),
                self.layout.node_size
            )));
        }
        if node_no == ROOT_NODE {
            let depth = node_depth(&data)?;
            if depth > MAX_DEPTH {
                return Err(SpatialError::Corrupt(format!(
                    "tree depth {} exceeds the maximum of {}",
                    depth, MAX_DEPTH
                )));
            }
            self.depth = Some(depth);
        }
        if read_u16(&data[2..]) as usize > self.layout.capacity() {
            return Err(SpatialError::Corrupt(format!(
                "node {} holds more cells than fit",
                node_no
            )));
        }

        if let Some(parent) = parent {
            let parent_slot = parent.slot;
            self.slot_mut(parent_slot).ref_count += 1;
        }
        let slot_id = self.alloc(Slot {
            node_no,
            ref_count: 1,
            dirty: false,
            parent: parent.map(|p| p.slot),
            data,
        });
        self.index.insert(node_no, slot_id);
        Ok(NodeRef { slot: slot_id })
    }

    /// Allocates a new, zeroed, dirty node with no number yet. It is
    /// assigned one (and indexed) when first written out.
    pub fn new_node(&mut self, parent: Option<&NodeRef>) -> NodeRef {
        if let Some(parent) = parent {
            let parent_slot = parent.slot;
            self.slot_mut(parent_slot).ref_count += 1;
        }
        let slot_id = self.alloc(Slot {
            node_no: 0,
            ref_count: 1,
            dirty: true,
            parent: parent.map(|p| p.slot),
            data: vec![0u8; self.layout.node_size],
        });
        NodeRef { slot: slot_id }
    }

    /// Takes an additional reference to an already-held node.
    pub fn retain(&mut self, node: &NodeRef) -> NodeRef {
        self.retain_slot(node.slot)
    }

    pub fn retain_slot(&mut self, slot_id: usize) -> NodeRef {
        self.slot_mut(slot_id).ref_count += 1;
        NodeRef { slot: slot_id }
    }

    /// Gives up a node reference.
    ///
    /// When the count reaches zero the parent chain is walked first, then
    /// every node that reached zero is finalized parent-most first: written
    /// out if dirty (a first write assigns the node number), dropped from
    /// the index and recycled. A write failure skips the remaining writes
    /// but never the cleanup.
    pub fn release(&mut self, storage: &TableStorage, node: NodeRef) -> SpatialResult<()> {
        self.release_slot(storage, node.slot)
    }

    pub fn release_slot(&mut self, storage: &TableStorage, slot_id: usize) -> SpatialResult<()> {
        let mut finalize = Vec::new();
        let mut cursor = Some(slot_id);
        while let Some(id) = cursor {
            let slot = self.slot_mut(id);
            slot.ref_count -= 1;
            if slot.ref_count == 0 {
                cursor = slot.parent;
                finalize.push(id);
            } else {
                cursor = None;
            }
        }

        let mut result = Ok(());
        for &id in finalize.iter().rev() {
            if self.slot(id).node_no == ROOT_NODE {
                self.depth = None;
            }
            if result.is_ok() {
                result = self.write_slot(storage, id);
            }
            if let Some(slot) = self.slots[id].take() {
                if slot.node_no != 0 {
                    self.index.remove(&slot.node_no);
                }
            }
            self.free_slots.push(id);
        }
        result
    }

    /// Writes the node out if it is dirty. A node without a number gets one
    /// assigned by the store and becomes visible in the index.
    pub fn write(&mut self, storage: &TableStorage, node: &NodeRef) -> SpatialResult<()> {
        self.write_slot(storage, node.slot)
    }

    fn write_slot(&mut self, storage: &TableStorage, slot_id: usize) -> SpatialResult<()> {
        let (node_no, dirty) = {
            let slot = self.slot(slot_id);
            (slot.node_no, slot.dirty)
        };
        if !dirty {
            return Ok(());
        }
        if node_no == 0 {
            let assigned = storage.write_node_auto(&self.slot(slot_id).data)?;
            let slot = self.slot_mut(slot_id);
            slot.node_no = assigned;
            slot.dirty = false;
            self.index.insert(assigned, slot_id);
        } else {
            storage.write_node(node_no, &self.slot(slot_id).data)?;
            self.slot_mut(slot_id).dirty = false;
        }
        Ok(())
    }

    pub fn node_no(&self, node: &NodeRef) -> i64 {
        self.slot(node.slot).node_no
    }

    pub fn data(&self, node: &NodeRef) -> &[u8] {
        &self.slot(node.slot).data
    }

    /// Mutable access to the node image; marks the node dirty.
    pub fn data_mut(&mut self, node: &NodeRef) -> &mut [u8] {
        let slot = self.slot_mut(node.slot);
        slot.dirty = true;
        &mut slot.data
    }

    /// Zeroes the node image.
    pub fn zero(&mut self, node: &NodeRef) {
        let slot = self.slot_mut(node.slot);
        slot.data.fill(0);
        slot.dirty = true;
    }

    pub fn parent_slot(&self, node: &NodeRef) -> Option<usize> {
        self.slot(node.slot).parent
    }

    pub fn slot_parent(&self, slot_id: usize) -> Option<usize> {
        self.slot(slot_id).parent
    }

    pub fn slot_node_no(&self, slot_id: usize) -> i64 {
        self.slot(slot_id).node_no
    }

    pub fn slot_data(&self, slot_id: usize) -> &[u8] {
        &self.slot(slot_id).data
    }

    /// Mutable access to a slot's node image; marks the node dirty.
    pub fn slot_data_mut(&mut self, slot_id: usize) -> &mut [u8] {
        let slot = self.slot_mut(slot_id);
        slot.dirty = true;
        &mut slot.data
    }

    /// The slot currently caching `node_no`, if any.
    pub fn lookup(&self, node_no: i64) -> Option<usize> {
        self.index.get(&node_no).copied()
    }

    /// Hands ownership of an acquired `parent` reference to the child in
    /// `child_slot`, whose parent link must be unset.
    pub fn adopt_parent(&mut self, child_slot: usize, parent: NodeRef) {
        let slot = self.slot_mut(child_slot);
        debug_assert!(slot.parent.is_none());
        slot.parent = Some(parent.slot);
    }

    /// Detaches and returns the child's counted parent reference; the caller
    /// becomes responsible for releasing it.
    pub fn detach_parent(&mut self, child: &NodeRef) -> Option<NodeRef> {
        self.slot_mut(child.slot)
            .parent
            .take()
            .map(|slot| NodeRef { slot })
    }

    /// Points a cached child node at a new parent, dropping its reference to
    /// the old one. Used when a split or reinsertion relocates child
    /// entries between internal nodes.
    pub fn reparent_cached(
        &mut self,
        storage: &TableStorage,
        child_no: i64,
        new_parent: &NodeRef,
    ) -> SpatialResult<()> {
        if let Some(child_slot) = self.lookup(child_no) {
            let old_parent = self.slot_mut(child_slot).parent.take();
            let parent_slot = new_parent.slot;
            self.slot_mut(parent_slot).ref_count += 1;
            self.slot_mut(child_slot).parent = Some(parent_slot);
            if let Some(old) = old_parent {
                self.release_slot(storage, old)?;
            }
        }
        Ok(())
    }

    /// Drops the node from the number index without touching its reference
    /// count, and clears the dirty flag so the final release will not write
    /// it back. Used for nodes structurally removed from the tree whose
    /// content is queued for reinsertion.
    pub fn discard(&mut self, node: &NodeRef) {
        let slot = self.slot_mut(node.slot);
        slot.dirty = false;
        let node_no = slot.node_no;
        slot.node_no = 0;
        if node_no != 0 {
            self.index.remove(&node_no);
        }
    }

    /// The number of live (referenced) nodes.
    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// True when the index covers exactly the live, number-assigned slots.
    #[cfg(test)]
    pub fn index_is_consistent(&self) -> bool {
        let assigned = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, s)| s.as_ref().map(|s| (id, s)))
            .filter(|(_, s)| s.node_no != 0)
            .count();
        if assigned != self.index.len() {
            return false;
        }
        self.index.iter().all(|(no, &slot_id)| {
            self.slots
                .get(slot_id)
                .and_then(|s| s.as_ref())
                .map(|s| s.node_no == *no && s.ref_count > 0)
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CoordKind;
    use crate::node::write_u16;
    use lapis::store::memory::{InMemoryStore, InMemoryStoreConfig};
    use lapis::store::Store;

    const NODE_SIZE: usize = 100; // 2-D float cells, capacity 4

    fn setup() -> (TableStorage, NodeCache) {
        let store = Store::new(InMemoryStore::new(InMemoryStoreConfig::new()));
        let storage = TableStorage::open(&store, "t", NODE_SIZE, true).unwrap();
        let cache = NodeCache::new(NodeLayout::new(NODE_SIZE, 2, CoordKind::Real32));
        (storage, cache)
    }

    #[test]
    fn test_acquire_root_and_release() {
        let (storage, mut cache) = setup();
        let root = cache.acquire(&storage, ROOT_NODE, None).unwrap();
        assert_eq!(cache.node_no(&root), 1);
        assert_eq!(cache.depth().unwrap(), 0);
        assert!(cache.index_is_consistent());
        cache.release(&storage, root).unwrap();
        assert_eq!(cache.live_count(), 0);
        // Depth is forgotten once the root leaves the cache.
        assert!(cache.depth().is_err());
    }

    #[test]
    fn test_acquire_missing_node_is_corrupt() {
        let (storage, mut cache) = setup();
        let err = cache.acquire(&storage, 99, None).unwrap_err();
        assert!(matches!(err, SpatialError::Corrupt(_)));
    }

    #[test]
    fn test_acquire_wrong_length_is_corrupt() {
        let (storage, mut cache) = setup();
        storage.write_node(2, &[0u8; 10]).unwrap();
        let err = cache.acquire(&storage, 2, None).unwrap_err();
        assert!(matches!(err, SpatialError::Corrupt(_)));
    }

    #[test]
    fn test_acquire_excessive_depth_is_corrupt() {
        let (storage, mut cache) = setup();
        let mut data = vec![0u8; NODE_SIZE];
        write_u16(&mut data, MAX_DEPTH + 1);
        storage.write_node(ROOT_NODE, &data).unwrap();
        let err = cache.acquire(&storage, ROOT_NODE, None).unwrap_err();
        assert!(matches!(err, SpatialError::Corrupt(_)));
    }

    #[test]
    fn test_acquire_oversized_cell_count_is_corrupt() {
        let (storage, mut cache) = setup();
        let mut data = vec![0u8; NODE_SIZE];
        write_u16(&mut data[2..], 5); // capacity is 4
        storage.write_node(ROOT_NODE, &data).unwrap();
        let err = cache.acquire(&storage, ROOT_NODE, None).unwrap_err();
        assert!(matches!(err, SpatialError::Corrupt(_)));
    }

    #[test]
    fn test_acquire_cached_bumps_ref_count() {
        let (storage, mut cache) = setup();
        let a = cache.acquire(&storage, ROOT_NODE, None).unwrap();
        let b = cache.acquire(&storage, ROOT_NODE, None).unwrap();
        assert_eq!(a.slot(), b.slot());
        assert_eq!(cache.live_count(), 1);
        cache.release(&storage, a).unwrap();
        assert_eq!(cache.live_count(), 1);
        cache.release(&storage, b).unwrap();
        assert_eq!(cache.live_count(), 0);
    }

    #[test]
    fn test_release_writes_dirty_node() {
        let (storage, mut cache) = setup();
        let root = cache.acquire(&storage, ROOT_NODE, None).unwrap();
        cache.data_mut(&root)[4] = 0xAB;
        cache.release(&storage, root).unwrap();
        let data = storage.read_node(ROOT_NODE).unwrap().unwrap();
        assert_eq!(data[4], 0xAB);
    }

    #[test]
    fn test_release_clean_node_does_not_write() {
        let (storage, mut cache) = setup();
        let root = cache.acquire(&storage, ROOT_NODE, None).unwrap();
        // Mutate the stored image behind the cache's back; a clean release
        // must not clobber it.
        storage.write_node(ROOT_NODE, &[7u8; NODE_SIZE]).unwrap();
        cache.release(&storage, root).unwrap();
        let data = storage.read_node(ROOT_NODE).unwrap().unwrap();
        assert_eq!(data[0], 7);
    }

    #[test]
    fn test_new_node_gets_number_on_write() {
        let (storage, mut cache) = setup();
        let node = cache.new_node(None);
        assert_eq!(cache.node_no(&node), 0);
        cache.write(&storage, &node).unwrap();
        let no = cache.node_no(&node);
        assert!(no > 1);
        assert_eq!(cache.lookup(no), Some(node.slot()));
        assert!(cache.index_is_consistent());
        cache.release(&storage, node).unwrap();
        assert!(storage.read_node(no).unwrap().is_some());
    }

    #[test]
    fn test_release_chain_frees_parent() {
        let (storage, mut cache) = setup();
        let root = cache.acquire(&storage, ROOT_NODE, None).unwrap();
        let child = cache.new_node(Some(&root));
        // Drop our own root reference; the child's parent link keeps it.
        cache.release(&storage, root).unwrap();
        assert_eq!(cache.live_count(), 2);
        // Releasing the child unwinds the chain and frees both.
        cache.release(&storage, child).unwrap();
        assert_eq!(cache.live_count(), 0);
        assert!(cache.index_is_consistent());
    }

    #[test]
    fn test_reparent_cached() {
        let (storage, mut cache) = setup();
        let root = cache.acquire(&storage, ROOT_NODE, None).unwrap();
        let child = cache.new_node(Some(&root));
        cache.write(&storage, &child).unwrap();
        let child_no = cache.node_no(&child);

        let other = cache.new_node(None);
        cache.reparent_cached(&storage, child_no, &other).unwrap();
        assert_eq!(cache.parent_slot(&child), Some(other.slot()));

        cache.release(&storage, child).unwrap();
        cache.release(&storage, other).unwrap();
        cache.release(&storage, root).unwrap();
        assert_eq!(cache.live_count(), 0);
    }

    #[test]
    fn test_discard_suppresses_write_back() {
        let (storage, mut cache) = setup();
        let root = cache.acquire(&storage, ROOT_NODE, None).unwrap();
        cache.data_mut(&root)[4] = 0xFF;
        cache.discard(&root);
        cache.release(&storage, root).unwrap();
        // The dirty byte never reached the store.
        let data = storage.read_node(ROOT_NODE).unwrap().unwrap();
        assert_eq!(data[4], 0);
    }

    #[test]
    fn test_reference_accounting_invariant() {
        let (storage, mut cache) = setup();
        let root = cache.acquire(&storage, ROOT_NODE, None).unwrap();
        let extra = cache.retain(&root);
        let fresh = cache.new_node(Some(&root));
        assert!(cache.index_is_consistent());
        cache.write(&storage, &fresh).unwrap();
        assert!(cache.index_is_consistent());
        cache.release(&storage, fresh).unwrap();
        cache.release(&storage, extra).unwrap();
        cache.release(&storage, root).unwrap();
        assert_eq!(cache.live_count(), 0);
        assert!(cache.index_is_consistent());
    }
}
