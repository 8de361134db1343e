//! Coordinate and cell model with the geometry primitives used by the
//! insertion, split and query engines.
//!
//! Coordinates are 4-byte values, either IEEE-754 single floats or signed
//! 32-bit integers, fixed per table at creation. All arithmetic decodes to
//! `f64` (both kinds embed exactly), and values are re-encoded to the stored
//! kind only when a node image is written.

/// The maximum number of dimensions an R-tree table can index.
pub const MAX_DIMENSIONS: usize = 5;

/// Coordinate representation chosen once per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordKind {
    /// IEEE-754 single-precision floating point coordinates.
    #[default]
    Real32,
    /// Signed 32-bit integer coordinates.
    Int32,
}

/// A single stored coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coord {
    Real(f32),
    Int(i32),
}

impl Coord {
    /// The zero coordinate of the given kind.
    pub fn zero(kind: CoordKind) -> Coord {
        match kind {
            CoordKind::Real32 => Coord::Real(0.0),
            CoordKind::Int32 => Coord::Int(0),
        }
    }

    /// Decodes the coordinate to the common arithmetic representation.
    /// Exact for both kinds: every f32 and every i32 embeds into f64.
    pub fn to_f64(self) -> f64 {
        match self {
            Coord::Real(f) => f as f64,
            Coord::Int(i) => i as f64,
        }
    }

    /// Serializes to the big-endian wire form.
    pub fn to_be_bytes(self) -> [u8; 4] {
        match self {
            Coord::Real(f) => f.to_be_bytes(),
            Coord::Int(i) => i.to_be_bytes(),
        }
    }

    /// Deserializes from the big-endian wire form.
    pub fn from_be_bytes(kind: CoordKind, bytes: [u8; 4]) -> Coord {
        match kind {
            CoordKind::Real32 => Coord::Real(f32::from_be_bytes(bytes)),
            CoordKind::Int32 => Coord::Int(i32::from_be_bytes(bytes)),
        }
    }
}

/// A deserialized node entry: a rowid (or child node number, for internal
/// nodes) plus `2 * dims` coordinates as (min, max) pairs per dimension.
///
/// The coordinate array is sized for the maximum dimension count; only the
/// first `2 * dims` slots of a given table are meaningful.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub rowid: i64,
    pub coords: [Coord; 2 * MAX_DIMENSIONS],
}

impl Cell {
    pub fn new(rowid: i64, kind: CoordKind) -> Cell {
        Cell {
            rowid,
            coords: [Coord::zero(kind); 2 * MAX_DIMENSIONS],
        }
    }

    /// The lower bound of the cell in `dim`.
    pub fn min(&self, dim: usize) -> Coord {
        self.coords[dim * 2]
    }

    /// The upper bound of the cell in `dim`.
    pub fn max(&self, dim: usize) -> Coord {
        self.coords[dim * 2 + 1]
    }

    /// The N-dimensional volume of the cell. Degenerate (point-like) cells
    /// yield zero.
    pub fn area(&self, dims: usize) -> f64 {
        let mut area = 1.0;
        for dim in 0..dims {
            area *= self.max(dim).to_f64() - self.min(dim).to_f64();
        }
        area
    }

    /// The margin length of the cell: the sum of its extents over all
    /// dimensions.
    pub fn margin(&self, dims: usize) -> f64 {
        let mut margin = 0.0;
        for dim in 0..dims {
            margin += self.max(dim).to_f64() - self.min(dim).to_f64();
        }
        margin
    }

    /// Grows this cell to the componentwise union with `other`.
    pub fn union_with(&mut self, other: &Cell, dims: usize) {
        for dim in 0..dims {
            let i = dim * 2;
            if other.coords[i].to_f64() < self.coords[i].to_f64() {
                self.coords[i] = other.coords[i];
            }
            if other.coords[i + 1].to_f64() > self.coords[i + 1].to_f64() {
                self.coords[i + 1] = other.coords[i + 1];
            }
        }
    }

    /// Returns true when the area covered by `other` is a subset of the
    /// area covered by this cell.
    pub fn contains(&self, other: &Cell, dims: usize) -> bool {
        for dim in 0..dims {
            if other.min(dim).to_f64() < self.min(dim).to_f64()
                || other.max(dim).to_f64() > self.max(dim).to_f64()
            {
                return false;
            }
        }
        true
    }

    /// The amount this cell's area would grow if it absorbed `other`.
    pub fn growth(&self, other: &Cell, dims: usize) -> f64 {
        let mut grown = *self;
        let before = grown.area(dims);
        grown.union_with(other, dims);
        grown.area(dims) - before
    }
}

/// The summed intersection volume of `cell` against every cell in `others`,
/// skipping the entry at `exclude` if given. Disjoint pairs contribute zero.
pub fn overlap(cell: &Cell, others: &[Cell], exclude: Option<usize>, dims: usize) -> f64 {
    let mut total = 0.0;
    for (i, other) in others.iter().enumerate() {
        if Some(i) == exclude {
            continue;
        }
        let mut o = 1.0;
        for dim in 0..dims {
            let x1 = cell.min(dim).to_f64().max(other.min(dim).to_f64());
            let x2 = cell.max(dim).to_f64().min(other.max(dim).to_f64());
            if x2 < x1 {
                o = 0.0;
                break;
            }
            o *= x2 - x1;
        }
        total += o;
    }
    total
}

/// How much the overlap of `cell` with its siblings would increase if it
/// absorbed `insert`. Used by the R*-tree subtree choice at the level above
/// the leaves.
pub fn overlap_enlargement(
    cell: &Cell,
    insert: &Cell,
    others: &[Cell],
    exclude: usize,
    dims: usize,
) -> f64 {
    let before = overlap(cell, others, Some(exclude), dims);
    let mut grown = *cell;
    grown.union_with(insert, dims);
    let after = overlap(&grown, others, Some(exclude), dims);
    after - before
}
