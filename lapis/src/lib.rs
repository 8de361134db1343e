//! # Lapis - an embedded database engine
//!
//! This crate carries the storage-facing core of the Lapis database: the
//! error taxonomy shared by all engine modules and the backing-store
//! abstraction index modules persist through. Higher-level modules (such as
//! the `lapis-spatial` R-tree index) consume the store through named
//! integer-keyed maps and never see the backend behind them.
//!
//! ## Quick Start
//!
//! ```rust
//! use lapis::store::memory::{InMemoryStore, InMemoryStoreConfig};
//! use lapis::store::{Store, Value};
//!
//! # fn main() -> lapis::errors::LapisResult<()> {
//! let store = Store::new(InMemoryStore::new(InMemoryStoreConfig::new()));
//! let map = store.open_map("demo")?;
//! map.put(1, Value::Integer(42))?;
//! assert_eq!(map.get(1)?, Some(Value::Integer(42)));
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod store;

pub use errors::{ErrorKind, LapisError, LapisResult};
pub use store::{Store, StoreMap, Value};
