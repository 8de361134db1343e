//! Fixed-size node images and their byte layout.
//!
//! A node is a `node_size`-byte buffer:
//!
//! - bytes `[0, 2)`: big-endian tree depth (meaningful on the root only)
//! - bytes `[2, 4)`: big-endian cell count
//! - then `cell_count` packed cells of `8 + 4 * 2 * dims` bytes each: an
//!   8-byte big-endian rowid (leaf) or child node number (internal),
//!   followed by `2 * dims` 4-byte big-endian coordinates.

use crate::cell::{Cell, Coord, CoordKind};
use crate::error::{SpatialError, SpatialResult};

/// No node ever holds more cells than this, regardless of page size.
pub const MAX_CELLS_PER_NODE: usize = 51;

/// Depth bound used as a corruption guard; a tree with 3 cells per node
/// already addresses more than 2^63 rows at this depth.
pub const MAX_DEPTH: u16 = 40;

/// Bytes reserved at the front of every node for depth and cell count.
pub(crate) const NODE_HEADER_SIZE: usize = 4;

pub(crate) fn read_u16(p: &[u8]) -> u16 {
    u16::from_be_bytes([p[0], p[1]])
}

pub(crate) fn write_u16(p: &mut [u8], v: u16) {
    p[..2].copy_from_slice(&v.to_be_bytes());
}

pub(crate) fn read_i64(p: &[u8]) -> i64 {
    i64::from_be_bytes([p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]])
}

pub(crate) fn write_i64(p: &mut [u8], v: i64) {
    p[..8].copy_from_slice(&v.to_be_bytes());
}

/// Per-table node geometry: how cells are laid out in a node image.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeLayout {
    pub node_size: usize,
    pub dims: usize,
    pub bytes_per_cell: usize,
    pub coord_kind: CoordKind,
}

impl NodeLayout {
    pub fn new(node_size: usize, dims: usize, coord_kind: CoordKind) -> NodeLayout {
        NodeLayout {
            node_size,
            dims,
            bytes_per_cell: 8 + dims * 4 * 2,
            coord_kind,
        }
    }

    /// How many cells fit in one node.
    pub fn capacity(&self) -> usize {
        (self.node_size - NODE_HEADER_SIZE) / self.bytes_per_cell
    }

    /// The minimum cell count for non-root nodes: a third of the capacity.
    /// The R*-tree reinsertion count equals this value.
    pub fn min_cells(&self) -> usize {
        self.capacity() / 3
    }

    pub fn cell_count(&self, data: &[u8]) -> usize {
        read_u16(&data[2..]) as usize
    }

    pub fn set_cell_count(&self, data: &mut [u8], count: usize) {
        write_u16(&mut data[2..], count as u16);
    }

    fn cell_offset(&self, i: usize) -> usize {
        NODE_HEADER_SIZE + self.bytes_per_cell * i
    }

    /// The 64-bit integer of cell `i`: a rowid on leaves, a child node
    /// number on internal nodes.
    pub fn get_rowid(&self, data: &[u8], i: usize) -> i64 {
        read_i64(&data[self.cell_offset(i)..])
    }

    pub fn get_coord(&self, data: &[u8], i: usize, j: usize) -> Coord {
        let off = self.cell_offset(i) + 8 + 4 * j;
        Coord::from_be_bytes(self.coord_kind, [data[off], data[off + 1], data[off + 2], data[off + 3]])
    }

    /// Deserializes cell `i` of the node image.
    pub fn get_cell(&self, data: &[u8], i: usize) -> Cell {
        let mut cell = Cell::new(self.get_rowid(data, i), self.coord_kind);
        for j in 0..self.dims * 2 {
            cell.coords[j] = self.get_coord(data, i, j);
        }
        cell
    }

    /// Overwrites slot `i` with `cell`.
    pub fn overwrite_cell(&self, data: &mut [u8], cell: &Cell, i: usize) {
        let mut off = self.cell_offset(i);
        write_i64(&mut data[off..], cell.rowid);
        off += 8;
        for j in 0..self.dims * 2 {
            data[off..off + 4].copy_from_slice(&cell.coords[j].to_be_bytes());
            off += 4;
        }
    }

    /// Removes cell `i`, shifting the trailing cells down.
    pub fn delete_cell(&self, data: &mut [u8], i: usize) {
        let count = self.cell_count(data);
        let dst = self.cell_offset(i);
        let src = dst + self.bytes_per_cell;
        let tail = (count - i - 1) * self.bytes_per_cell;
        data.copy_within(src..src + tail, dst);
        self.set_cell_count(data, count - 1);
    }

    /// Appends `cell` in the next free slot. Returns false when the node is
    /// already at capacity (the caller must split).
    pub fn append_cell(&self, data: &mut [u8], cell: &Cell) -> bool {
        let count = self.cell_count(data);
        if count >= self.capacity() {
            return false;
        }
        self.overwrite_cell(data, cell, count);
        self.set_cell_count(data, count + 1);
        true
    }
}

/// Reads the tree depth stored in the first two bytes of a root node image.
pub fn node_depth(data: &[u8]) -> SpatialResult<u16> {
    if data.len() < 2 {
        return Err(SpatialError::InvalidArgument(
            "node image shorter than the depth header".to_string(),
        ));
    }
    Ok(read_u16(data))
}

/// Decodes a node image into a human-readable cell list, one
/// `{rowid c0 c1 ...}` group per cell. Coordinates are rendered as
/// single-precision floats. Intended for debugging and analysis.
pub fn describe_node(dims: usize, data: &[u8]) -> SpatialResult<String> {
    if dims == 0 || dims > crate::cell::MAX_DIMENSIONS {
        return Err(SpatialError::InvalidArgument(format!(
            "dimension count {} out of range",
            dims
        )));
    }
    let layout = NodeLayout::new(data.len(), dims, CoordKind::Real32);
    if data.len() < NODE_HEADER_SIZE {
        return Err(SpatialError::InvalidArgument(
            "node image shorter than the header".to_string(),
        ));
    }
    let count = layout.cell_count(data);
    if NODE_HEADER_SIZE + count * layout.bytes_per_cell > data.len() {
        return Err(SpatialError::InvalidArgument(
            "cell count exceeds the node image".to_string(),
        ));
    }

    let mut text = String::new();
    for i in 0..count {
        let cell = layout.get_cell(data, i);
        if !text.is_empty() {
            text.push(' ');
        }
        text.push('{');
        text.push_str(&cell.rowid.to_string());
        for j in 0..dims * 2 {
            text.push_str(&format!(" {:.6}", cell.coords[j].to_f64()));
        }
        text.push('}');
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_2d() -> NodeLayout {
        // 2-D float table with room for 4 cells: 4 + 4 * 24 = 100 bytes.
        NodeLayout::new(100, 2, CoordKind::Real32)
    }

    fn sample_cell(rowid: i64) -> Cell {
        let mut cell = Cell::new(rowid, CoordKind::Real32);
        cell.coords[0] = Coord::Real(1.0);
        cell.coords[1] = Coord::Real(2.0);
        cell.coords[2] = Coord::Real(3.0);
        cell.coords[3] = Coord::Real(4.0);
        cell
    }

    #[test]
    fn test_layout_capacity() {
        let layout = layout_2d();
        assert_eq!(layout.bytes_per_cell, 24);
        assert_eq!(layout.capacity(), 4);
        assert_eq!(layout.min_cells(), 1);
    }

    #[test]
    fn test_u16_i64_round_trip() {
        let mut buf = [0u8; 8];
        write_u16(&mut buf, 0xBEEF);
        assert_eq!(read_u16(&buf), 0xBEEF);
        write_i64(&mut buf, -99_999_999_999);
        assert_eq!(read_i64(&buf), -99_999_999_999);
    }

    #[test]
    fn test_cell_round_trip() {
        let layout = layout_2d();
        let mut data = vec![0u8; layout.node_size];
        let cell = sample_cell(77);
        assert!(layout.append_cell(&mut data, &cell));
        assert_eq!(layout.cell_count(&data), 1);
        assert_eq!(layout.get_cell(&data, 0), cell);
    }

    #[test]
    fn test_cell_round_trip_int() {
        let layout = NodeLayout::new(100, 2, CoordKind::Int32);
        let mut data = vec![0u8; layout.node_size];
        let mut cell = Cell::new(-5, CoordKind::Int32);
        cell.coords[0] = Coord::Int(i32::MIN);
        cell.coords[1] = Coord::Int(i32::MAX);
        cell.coords[2] = Coord::Int(-7);
        cell.coords[3] = Coord::Int(7);
        layout.append_cell(&mut data, &cell);
        // Bit-exact for integer coordinates.
        assert_eq!(layout.get_cell(&data, 0), cell);
    }

    #[test]
    fn test_append_until_full() {
        let layout = layout_2d();
        let mut data = vec![0u8; layout.node_size];
        for i in 0..4 {
            assert!(layout.append_cell(&mut data, &sample_cell(i)));
        }
        assert!(!layout.append_cell(&mut data, &sample_cell(99)));
        assert_eq!(layout.cell_count(&data), 4);
    }

    #[test]
    fn test_delete_cell_shifts_tail() {
        let layout = layout_2d();
        let mut data = vec![0u8; layout.node_size];
        for i in 0..4 {
            layout.append_cell(&mut data, &sample_cell(i));
        }
        layout.delete_cell(&mut data, 1);
        assert_eq!(layout.cell_count(&data), 3);
        assert_eq!(layout.get_rowid(&data, 0), 0);
        assert_eq!(layout.get_rowid(&data, 1), 2);
        assert_eq!(layout.get_rowid(&data, 2), 3);
    }

    #[test]
    fn test_node_depth() {
        let mut data = vec![0u8; 100];
        write_u16(&mut data, 3);
        assert_eq!(node_depth(&data).unwrap(), 3);
        assert!(node_depth(&[0u8]).is_err());
    }

    #[test]
    fn test_describe_node() {
        let layout = layout_2d();
        let mut data = vec![0u8; layout.node_size];
        layout.append_cell(&mut data, &sample_cell(7));
        let text = describe_node(2, &data).unwrap();
        assert_eq!(text, "{7 1.000000 2.000000 3.000000 4.000000}");
    }

    #[test]
    fn test_describe_node_rejects_bad_input() {
        assert!(describe_node(0, &[0u8; 100]).is_err());
        assert!(describe_node(2, &[0u8; 2]).is_err());
        // Cell count larger than the buffer can hold.
        let mut data = vec![0u8; 30];
        write_u16(&mut data[2..], 5);
        assert!(describe_node(2, &data).is_err());
    }
}
