//! Geometry predicates for MATCH constraints.
//!
//! A query can constrain rows with an arbitrary spatial predicate instead of
//! per-coordinate comparisons. Predicates are registered under a name and
//! bound to parameter lists at query-build time; during a scan the predicate
//! receives the decoded bounding coordinates of each candidate cell and
//! decides whether the cell (and, at internal levels, the whole subtree
//! under it) can be excluded.

use crate::error::{SpatialError, SpatialResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A spatial predicate invoked for MATCH constraints.
///
/// `params` are the values the predicate was bound with when the query was
/// built. `coords` holds the candidate cell's bounding coordinates decoded
/// to `f64`, `2 * dimensions` values as (min, max) pairs. Returning
/// `Ok(false)` excludes the cell; an error aborts the scan and surfaces
/// verbatim.
pub trait GeometryPredicate: Send + Sync {
    fn test(&self, params: &[f64], coords: &[f64]) -> SpatialResult<bool>;
}

impl<F> GeometryPredicate for F
where
    F: Fn(&[f64], &[f64]) -> SpatialResult<bool> + Send + Sync,
{
    fn test(&self, params: &[f64], coords: &[f64]) -> SpatialResult<bool> {
        self(params, coords)
    }
}

/// A named predicate bound to its parameter list, ready to be passed as a
/// MATCH argument to a query.
#[derive(Clone)]
pub struct MatchArg {
    name: String,
    predicate: Arc<dyn GeometryPredicate>,
    params: Vec<f64>,
}

impl MatchArg {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub(crate) fn test(&self, coords: &[f64]) -> SpatialResult<bool> {
        self.predicate.test(&self.params, coords)
    }
}

impl fmt::Debug for MatchArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchArg")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Registry of named geometry predicates.
///
/// One registry typically lives beside the database handle; tables resolve
/// MATCH arguments through it when queries are built.
#[derive(Default)]
pub struct GeometryRegistry {
    predicates: RwLock<HashMap<String, Arc<dyn GeometryPredicate>>>,
}

impl GeometryRegistry {
    pub fn new() -> GeometryRegistry {
        GeometryRegistry {
            predicates: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a predicate under `name`, replacing any previous
    /// registration.
    pub fn register(&self, name: &str, predicate: Arc<dyn GeometryPredicate>) {
        self.predicates
            .write()
            .insert(name.to_string(), predicate);
    }

    /// Binds the named predicate to `params`, producing a MATCH argument.
    pub fn match_arg(&self, name: &str, params: Vec<f64>) -> SpatialResult<MatchArg> {
        let predicate = self
            .predicates
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                SpatialError::InvalidArgument(format!("no geometry function named {}", name))
            })?;
        Ok(MatchArg {
            name: name.to_string(),
            predicate,
            params,
        })
    }
}
