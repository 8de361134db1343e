//! # Lapis Spatial - R-tree index for the Lapis database
//!
//! This crate provides the R-tree spatial index module of the Lapis
//! database: a disk-backed, balanced multi-dimensional index supporting
//! insertion, deletion and constrained range/spatial queries over a generic
//! paged key-value backing store.
//!
//! ## Features
//!
//! - **Disk-Backed Nodes**: fixed-size node pages persisted through three
//!   logical tables of the backing store, loaded on demand
//! - **Reference-Counted Cache**: resident nodes are shared across cursors
//!   and written back when the last reference is released
//! - **Configurable Splits**: Guttman linear/quadratic and R*-tree split
//!   strategies, with optional R*-tree forced reinsertion
//! - **Constraint Pushdown**: a `best_index` planner contract with direct
//!   rowid lookup and constrained-scan strategies
//! - **Geometry Callbacks**: named MATCH predicates over decoded bounding
//!   boxes
//!
//! ## Quick Start
//!
//! ```rust
//! use lapis::store::memory::{InMemoryStore, InMemoryStoreConfig};
//! use lapis::store::Store;
//! use lapis_spatial::{best_index, ConstraintInfo, IndexOp, QueryValue};
//! use lapis_spatial::{RTree, RTreeConfig};
//!
//! # fn main() -> lapis_spatial::SpatialResult<()> {
//! let store = Store::new(InMemoryStore::new(InMemoryStoreConfig::new()));
//! let tree = RTree::create(
//!     &store,
//!     "demo",
//!     &["id", "x1", "x2", "y1", "y2"],
//!     RTreeConfig::default(),
//! )?;
//!
//! tree.insert(Some(1), &[0.0, 1.0, 0.0, 1.0])?;
//! tree.insert(Some(2), &[5.0, 6.0, 5.0, 6.0])?;
//!
//! // Scan everything with x1 >= 2.
//! let plan = best_index(&[ConstraintInfo { column: 1, op: IndexOp::Ge, usable: true }]);
//! let mut cursor = tree.open_cursor();
//! cursor.filter(&plan, &[QueryValue::Real(2.0)])?;
//! assert_eq!(cursor.rowid()?, 2);
//! # Ok(())
//! # }
//! ```

pub mod cell;
pub mod cursor;
pub mod error;
pub mod geometry;
pub mod module;
pub mod node;
pub mod tree;

mod cache;
mod split;
mod storage;

pub use cell::{Cell, Coord, CoordKind, MAX_DIMENSIONS};
pub use cursor::{ColumnValue, RTreeCursor};
pub use error::{SpatialError, SpatialResult};
pub use geometry::{GeometryPredicate, GeometryRegistry, MatchArg};
pub use module::{
    best_index, ConstraintInfo, ConstraintUsage, IndexOp, IndexPlan, QueryValue, ScanStrategy,
};
pub use node::{describe_node, node_depth, MAX_CELLS_PER_NODE, MAX_DEPTH};
pub use split::SplitVariant;
pub use tree::{IntegrityReport, RTree, RTreeConfig, UpdateRecord};
