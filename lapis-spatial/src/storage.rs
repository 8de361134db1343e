//! Backing-store access for one R-tree table.
//!
//! The structure of a single R-tree table lives in three maps of the backing
//! store. The `%` below stands for the user-supplied table name:
//!
//! ```text
//! %_node   : nodeno -> node image blob    (node 1 is the root, always present)
//! %_rowid  : rowid  -> owning leaf nodeno
//! %_parent : nodeno -> parent nodeno     (every node except the root)
//! ```
//!
//! All tree I/O funnels through the nine point operations here, mirroring
//! the read/write/delete statement triple per map.

use crate::error::{SpatialError, SpatialResult};
use lapis::store::{Store, StoreMap, Value};

pub(crate) const NODE_SUFFIX: &str = "_node";
pub(crate) const ROWID_SUFFIX: &str = "_rowid";
pub(crate) const PARENT_SUFFIX: &str = "_parent";

/// The root node number. The root always exists, even in an empty table.
pub(crate) const ROOT_NODE: i64 = 1;

pub(crate) struct TableStorage {
    store: Store,
    node_map: StoreMap,
    rowid_map: StoreMap,
    parent_map: StoreMap,
}

impl TableStorage {
    /// Opens the three maps of `name`, creating the zeroed root node when
    /// `is_create` is set.
    pub fn open(store: &Store, name: &str, node_size: usize, is_create: bool) -> SpatialResult<TableStorage> {
        let node_map = store.open_map(&format!("{}{}", name, NODE_SUFFIX))?;
        let rowid_map = store.open_map(&format!("{}{}", name, ROWID_SUFFIX))?;
        let parent_map = store.open_map(&format!("{}{}", name, PARENT_SUFFIX))?;
        if is_create {
            node_map.put(ROOT_NODE, Value::Blob(vec![0u8; node_size]))?;
        }
        Ok(TableStorage {
            store: store.clone(),
            node_map,
            rowid_map,
            parent_map,
        })
    }

    /// Reads a node image. `Ok(None)` when no such node exists.
    pub fn read_node(&self, node_no: i64) -> SpatialResult<Option<Vec<u8>>> {
        match self.node_map.get(node_no)? {
            Some(value) => Ok(Some(value.as_blob()?.to_vec())),
            None => Ok(None),
        }
    }

    /// The size of the stored root node, used to recover the node size when
    /// connecting to an existing table.
    pub fn root_node_size(&self) -> SpatialResult<usize> {
        match self.node_map.get(ROOT_NODE)? {
            Some(value) => Ok(value.as_blob()?.len()),
            None => Err(SpatialError::Corrupt("root node is missing".to_string())),
        }
    }

    pub fn write_node(&self, node_no: i64, data: &[u8]) -> SpatialResult<()> {
        self.node_map.put(node_no, Value::Blob(data.to_vec()))?;
        Ok(())
    }

    /// Writes a node image under a freshly assigned node number and returns
    /// that number.
    pub fn write_node_auto(&self, data: &[u8]) -> SpatialResult<i64> {
        Ok(self.node_map.put_auto(Value::Blob(data.to_vec()))?)
    }

    pub fn delete_node(&self, node_no: i64) -> SpatialResult<()> {
        self.node_map.remove(node_no)?;
        Ok(())
    }

    /// Looks up the leaf node owning `rowid`.
    pub fn read_rowid(&self, rowid: i64) -> SpatialResult<Option<i64>> {
        match self.rowid_map.get(rowid)? {
            Some(value) => Ok(Some(value.as_integer()?)),
            None => Ok(None),
        }
    }

    /// Writes the (rowid -> leaf node) mapping.
    pub fn write_rowid(&self, rowid: i64, node_no: i64) -> SpatialResult<()> {
        self.rowid_map.put(rowid, Value::Integer(node_no))?;
        Ok(())
    }

    /// Reserves a currently unused rowid by inserting a placeholder row.
    pub fn new_rowid(&self) -> SpatialResult<i64> {
        Ok(self.rowid_map.put_auto(Value::Null)?)
    }

    pub fn delete_rowid(&self, rowid: i64) -> SpatialResult<()> {
        self.rowid_map.remove(rowid)?;
        Ok(())
    }

    /// Looks up the parent of a non-root node.
    pub fn read_parent(&self, node_no: i64) -> SpatialResult<Option<i64>> {
        match self.parent_map.get(node_no)? {
            Some(value) => Ok(Some(value.as_integer()?)),
            None => Ok(None),
        }
    }

    /// Writes the (node -> parent node) mapping.
    pub fn write_parent(&self, node_no: i64, parent_no: i64) -> SpatialResult<()> {
        self.parent_map.put(node_no, Value::Integer(parent_no))?;
        Ok(())
    }

    pub fn delete_parent(&self, node_no: i64) -> SpatialResult<()> {
        self.parent_map.remove(node_no)?;
        Ok(())
    }

    /// Renames the three underlying maps.
    pub fn rename(&self, old_name: &str, new_name: &str) -> SpatialResult<()> {
        for suffix in [NODE_SUFFIX, ROWID_SUFFIX, PARENT_SUFFIX] {
            if self
                .store
                .has_map(&format!("{}{}", new_name, suffix))?
            {
                return Err(SpatialError::InvalidArgument(format!(
                    "table {}{} already exists",
                    new_name, suffix
                )));
            }
        }
        for suffix in [NODE_SUFFIX, ROWID_SUFFIX, PARENT_SUFFIX] {
            self.store.rename_map(
                &format!("{}{}", old_name, suffix),
                &format!("{}{}", new_name, suffix),
            )?;
        }
        Ok(())
    }

    /// Drops the three underlying maps.
    pub fn destroy(&self, name: &str) -> SpatialResult<()> {
        for suffix in [NODE_SUFFIX, ROWID_SUFFIX, PARENT_SUFFIX] {
            self.store.remove_map(&format!("{}{}", name, suffix))?;
        }
        Ok(())
    }
}
