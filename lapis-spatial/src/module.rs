//! Query planning: translating the constraints the surrounding query engine
//! offers into a scan strategy for the cursor.
//!
//! There are two strategies, from most to least desirable:
//!
//! | strategy       | constraint string | meaning                         |
//! |----------------|-------------------|---------------------------------|
//! | `DirectRowid`  | unused            | direct lookup by rowid          |
//! | `Scan`         | see below         | r-tree query or full-table scan |
//!
//! For a `Scan`, the constraint string holds two bytes per consumed
//! constraint: an operator letter, then the constrained coordinate column as
//! a letter from `a`. Operator letters:
//!
//! ```text
//! =  A    <= B    <  C    >= D    >  E    MATCH  F
//! ```

use crate::cell::MAX_DIMENSIONS;
use crate::error::{SpatialError, SpatialResult};
use crate::geometry::MatchArg;

/// Constraint operators the query engine can offer to [`best_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
}

/// One constraint available to the planner. `column` 0 is the rowid column;
/// columns `1..=2*dims` are the coordinate columns in declaration order.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintInfo {
    pub column: usize,
    pub op: IndexOp,
    pub usable: bool,
}

/// How the chosen plan consumes one offered constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConstraintUsage {
    /// 1-based position of this constraint's value in the filter argument
    /// list, or `None` when the constraint is not consumed.
    pub argv_index: Option<usize>,
    /// True when the query engine no longer needs to re-check the
    /// constraint itself.
    pub omit: bool,
}

/// The planner's chosen strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStrategy {
    /// Direct lookup by rowid equality.
    DirectRowid,
    /// Constrained depth-first tree scan.
    Scan,
}

/// A query plan produced by [`best_index`] and consumed by
/// [`crate::cursor::RTreeCursor::filter`].
#[derive(Debug, Clone)]
pub struct IndexPlan {
    pub strategy: ScanStrategy,
    /// Two bytes per consumed constraint (scan strategy only).
    pub constraint_str: String,
    pub usage: Vec<ConstraintUsage>,
    pub estimated_cost: f64,
}

const OP_EQ: u8 = 0x41;
const OP_LE: u8 = 0x42;
const OP_LT: u8 = 0x43;
const OP_GE: u8 = 0x44;
const OP_GT: u8 = 0x45;
const OP_MATCH: u8 = 0x46;

/// A bound value passed to a cursor filter.
#[derive(Debug, Clone)]
pub enum QueryValue {
    Integer(i64),
    Real(f64),
    Match(MatchArg),
}

impl QueryValue {
    pub(crate) fn as_f64(&self) -> SpatialResult<f64> {
        match self {
            QueryValue::Integer(i) => Ok(*i as f64),
            QueryValue::Real(f) => Ok(*f),
            QueryValue::Match(_) => Err(SpatialError::InvalidArgument(
                "geometry argument where a number was expected".to_string(),
            )),
        }
    }

    pub(crate) fn as_i64(&self) -> SpatialResult<i64> {
        match self {
            QueryValue::Integer(i) => Ok(*i),
            QueryValue::Real(f) => Ok(*f as i64),
            QueryValue::Match(_) => Err(SpatialError::InvalidArgument(
                "geometry argument where a rowid was expected".to_string(),
            )),
        }
    }
}

/// Chooses a strategy for the offered constraints.
///
/// An equality constraint on the rowid column wins outright: that plan is a
/// pair of keyed lookups plus a linear cell search, almost as cheap as a
/// plain rowid probe. Otherwise every usable coordinate or MATCH constraint
/// is encoded into the constraint string and the cost falls with the number
/// of constraints consumed.
pub fn best_index(constraints: &[ConstraintInfo]) -> IndexPlan {
    let mut usage = vec![ConstraintUsage::default(); constraints.len()];
    let mut idx_str = String::new();

    for (i, constraint) in constraints.iter().enumerate() {
        if constraint.usable && constraint.column == 0 && constraint.op == IndexOp::Eq {
            // Equality on the rowid; none of the other constraints matter.
            for u in usage.iter_mut().take(i) {
                *u = ConstraintUsage::default();
            }
            usage[i] = ConstraintUsage { argv_index: Some(1), omit: true };
            return IndexPlan {
                strategy: ScanStrategy::DirectRowid,
                constraint_str: String::new(),
                usage,
                estimated_cost: 10.0,
            };
        }

        if constraint.usable
            && (constraint.column > 0 || constraint.op == IndexOp::Match)
            && idx_str.len() < MAX_DIMENSIONS * 8
        {
            let op = match constraint.op {
                IndexOp::Eq => OP_EQ,
                IndexOp::Gt => OP_GT,
                IndexOp::Le => OP_LE,
                IndexOp::Lt => OP_LT,
                IndexOp::Ge => OP_GE,
                IndexOp::Match => OP_MATCH,
            };
            idx_str.push(op as char);
            // MATCH can arrive without a coordinate column; pin it to the
            // first coordinate.
            let column = constraint.column.max(1);
            idx_str.push((b'a' + (column - 1) as u8) as char);
            usage[i] = ConstraintUsage {
                argv_index: Some(idx_str.len() / 2),
                omit: true,
            };
        }
    }

    let estimated_cost = 2_000_000.0 / (idx_str.len() + 1) as f64;
    IndexPlan {
        strategy: ScanStrategy::Scan,
        constraint_str: idx_str,
        usage,
        estimated_cost,
    }
}

/// The comparison operator of one decoded scan constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConstraintOp {
    Eq,
    Le,
    Lt,
    Ge,
    Gt,
    Match,
}

/// A materialized scan constraint.
pub(crate) struct Constraint {
    /// Index of the constrained coordinate, `0..2*dims`.
    pub coord: usize,
    pub op: ConstraintOp,
    pub value: f64,
    pub geom: Option<MatchArg>,
}

/// Decodes a constraint string plus its bound arguments into the cursor's
/// constraint array.
pub(crate) fn decode_constraints(
    constraint_str: &str,
    args: &[QueryValue],
    dims: usize,
) -> SpatialResult<Vec<Constraint>> {
    let bytes = constraint_str.as_bytes();
    if bytes.len() % 2 != 0 || bytes.len() / 2 != args.len() {
        return Err(SpatialError::InvalidArgument(format!(
            "constraint string length {} does not match {} arguments",
            bytes.len(),
            args.len()
        )));
    }

    let mut constraints = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let op = match bytes[i * 2] {
            OP_EQ => ConstraintOp::Eq,
            OP_LE => ConstraintOp::Le,
            OP_LT => ConstraintOp::Lt,
            OP_GE => ConstraintOp::Ge,
            OP_GT => ConstraintOp::Gt,
            OP_MATCH => ConstraintOp::Match,
            other => {
                return Err(SpatialError::InvalidArgument(format!(
                    "unknown constraint operator {:#x}",
                    other
                )))
            }
        };
        let coord = (bytes[i * 2 + 1].wrapping_sub(b'a')) as usize;
        if coord >= dims * 2 {
            return Err(SpatialError::InvalidArgument(format!(
                "constraint on coordinate {} of a {}-dimensional table",
                coord, dims
            )));
        }
        let constraint = match op {
            ConstraintOp::Match => match arg {
                QueryValue::Match(geom) => Constraint {
                    coord,
                    op,
                    value: 0.0,
                    geom: Some(geom.clone()),
                },
                _ => {
                    return Err(SpatialError::InvalidArgument(
                        "MATCH constraint requires a geometry argument".to_string(),
                    ))
                }
            },
            _ => Constraint {
                coord,
                op,
                value: arg.as_f64()?,
                geom: None,
            },
        };
        constraints.push(constraint);
    }
    Ok(constraints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_index_prefers_rowid_eq() {
        let constraints = [
            ConstraintInfo { column: 1, op: IndexOp::Ge, usable: true },
            ConstraintInfo { column: 0, op: IndexOp::Eq, usable: true },
        ];
        let plan = best_index(&constraints);
        assert_eq!(plan.strategy, ScanStrategy::DirectRowid);
        assert_eq!(plan.estimated_cost, 10.0);
        assert_eq!(plan.usage[0], ConstraintUsage::default());
        assert_eq!(plan.usage[1].argv_index, Some(1));
        assert!(plan.usage[1].omit);
    }

    #[test]
    fn test_best_index_ignores_unusable_rowid_eq() {
        let constraints = [ConstraintInfo { column: 0, op: IndexOp::Eq, usable: false }];
        let plan = best_index(&constraints);
        assert_eq!(plan.strategy, ScanStrategy::Scan);
        assert!(plan.constraint_str.is_empty());
    }

    #[test]
    fn test_best_index_encodes_scan_constraints() {
        let constraints = [
            ConstraintInfo { column: 1, op: IndexOp::Ge, usable: true },
            ConstraintInfo { column: 2, op: IndexOp::Lt, usable: true },
            ConstraintInfo { column: 3, op: IndexOp::Match, usable: true },
        ];
        let plan = best_index(&constraints);
        assert_eq!(plan.strategy, ScanStrategy::Scan);
        assert_eq!(plan.constraint_str, "DaCbFc");
        assert_eq!(plan.usage[0].argv_index, Some(1));
        assert_eq!(plan.usage[1].argv_index, Some(2));
        assert_eq!(plan.usage[2].argv_index, Some(3));
        assert!(plan.estimated_cost < 2_000_000.0);
    }

    #[test]
    fn test_best_index_skips_unusable_and_rowid_range() {
        let constraints = [
            ConstraintInfo { column: 1, op: IndexOp::Ge, usable: false },
            // A range constraint on the rowid column cannot help the scan.
            ConstraintInfo { column: 0, op: IndexOp::Gt, usable: true },
        ];
        let plan = best_index(&constraints);
        assert_eq!(plan.strategy, ScanStrategy::Scan);
        assert!(plan.constraint_str.is_empty());
        assert_eq!(plan.usage[0].argv_index, None);
        assert_eq!(plan.usage[1].argv_index, None);
    }

    #[test]
    fn test_best_index_cost_falls_with_constraints() {
        let one = best_index(&[ConstraintInfo { column: 1, op: IndexOp::Ge, usable: true }]);
        let two = best_index(&[
            ConstraintInfo { column: 1, op: IndexOp::Ge, usable: true },
            ConstraintInfo { column: 2, op: IndexOp::Le, usable: true },
        ]);
        assert!(two.estimated_cost < one.estimated_cost);
    }

    #[test]
    fn test_decode_constraints_round_trip() {
        let args = [QueryValue::Real(2.0), QueryValue::Integer(7)];
        let constraints = decode_constraints("DaCb", &args, 2).unwrap();
        assert_eq!(constraints.len(), 2);
        assert_eq!(constraints[0].coord, 0);
        assert_eq!(constraints[0].op, ConstraintOp::Ge);
        assert_eq!(constraints[0].value, 2.0);
        assert_eq!(constraints[1].coord, 1);
        assert_eq!(constraints[1].op, ConstraintOp::Lt);
        assert_eq!(constraints[1].value, 7.0);
    }

    #[test]
    fn test_decode_constraints_rejects_bad_input() {
        // Argument count mismatch.
        assert!(decode_constraints("Da", &[], 2).is_err());
        // Coordinate out of range for the table's dimension count.
        let args = [QueryValue::Real(0.0)];
        assert!(decode_constraints("Dz", &args, 2).is_err());
        // Numeric argument where MATCH expects geometry.
        assert!(decode_constraints("Fa", &args, 2).is_err());
    }

    #[test]
    fn test_query_value_coercions() {
        assert_eq!(QueryValue::Integer(3).as_f64().unwrap(), 3.0);
        assert_eq!(QueryValue::Real(3.7).as_i64().unwrap(), 3);
    }
}
