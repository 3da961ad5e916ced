//! Residual file header and offset table.
//!
//! Layout, all little endian:
//!
//! | Bytes | Content |
//! |---|---|
//! | 0..28 | `i32 minLevel, maxLevel, tileSize, rootLevel, rootTx, rootTy`, `f32 scale` |
//! | 28..28+8N | `N` pairs of `u32` (payload offset, payload size) |
//! | 28+8N.. | payloads |
//!
//! Payload offsets are relative to the end of the offset table. A payload
//! size of zero stands for a tile whose residuals are all zero.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use proland_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 28;

/// Largest `tileSize + 5` a residual file may declare.
pub const MAX_TILE_SIZE: u32 = 512;

/// The fixed header at the start of every residual file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidualHeader {
    /// First level stored with the quadtree layout; coarser levels hold one tile each.
    pub min_level: u32,
    pub max_level: u32,
    /// Tile size at `min_level` and deeper, borders excluded.
    pub tile_size: u32,
    /// Quadtree level of the tile this pyramid refines.
    pub root_level: u32,
    pub root_tx: u32,
    pub root_ty: u32,
    /// Factor from stored samples to elevation.
    pub scale: f32,
}

impl ResidualHeader {
    /// Create a new header for a pyramid rooted at the quadtree root.
    pub const fn new(min_level: u32, max_level: u32, tile_size: u32, scale: f32) -> Self {
        Self {
            min_level,
            max_level,
            tile_size,
            root_level: 0,
            root_tx: 0,
            root_ty: 0,
            scale,
        }
    }

    /// Attach the pyramid below quadtree tile `(level, tx, ty)`.
    #[must_use]
    pub const fn with_root(mut self, level: u32, tx: u32, ty: u32) -> Self {
        self.root_level = level;
        self.root_tx = tx;
        self.root_ty = ty;
        self
    }

    pub fn read(mut reader: impl Read) -> Result<Self> {
        let mut fields = [0i32; 6];
        for field in &mut fields {
            *field = reader.read_i32::<LittleEndian>()?;
        }
        let scale = reader.read_f32::<LittleEndian>()?;
        if let Some(negative) = fields.iter().find(|&&v| v < 0) {
            return Err(Error::Format(format!(
                "negative header field {negative} in residual file"
            )));
        }
        let [min_level, max_level, tile_size, root_level, root_tx, root_ty] =
            fields.map(|v| v as u32);
        let header = Self {
            min_level,
            max_level,
            tile_size,
            root_level,
            root_tx,
            root_ty,
            scale,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn write(&self, mut writer: impl Write) -> Result<()> {
        for value in [
            self.min_level,
            self.max_level,
            self.tile_size,
            self.root_level,
            self.root_tx,
            self.root_ty,
        ] {
            writer.write_i32::<LittleEndian>(value as i32)?;
        }
        writer.write_f32::<LittleEndian>(self.scale)?;
        Ok(())
    }

    /// Reject headers no producer could serve.
    pub fn validate(&self) -> Result<()> {
        if self.min_level > self.max_level {
            return Err(Error::Format(format!(
                "minLevel {} above maxLevel {}",
                self.min_level, self.max_level
            )));
        }
        if self.max_level - self.min_level > 15 {
            return Err(Error::Format(format!(
                "{} quadtree levels do not fit an offset table",
                self.max_level - self.min_level + 1
            )));
        }
        let shrink = 1u32.checked_shl(self.min_level).unwrap_or(0);
        if self.tile_size == 0
            || shrink == 0
            || self.tile_size % shrink != 0
            || (self.tile_size >> self.min_level) % 2 != 0
        {
            return Err(Error::Format(format!(
                "tileSize {} cannot be halved down to level 0 over {} levels",
                self.tile_size, self.min_level
            )));
        }
        if self.tile_size + 5 > MAX_TILE_SIZE {
            return Err(Error::Format(format!(
                "tileSize {} exceeds the maximum of {}",
                self.tile_size,
                MAX_TILE_SIZE - 5
            )));
        }
        let root_tiles = 1u64 << self.root_level.min(62);
        if u64::from(self.root_tx) >= root_tiles || u64::from(self.root_ty) >= root_tiles {
            return Err(Error::Format(format!(
                "root ({}, {}, {}) outside the quadtree",
                self.root_level, self.root_tx, self.root_ty
            )));
        }
        if !self.scale.is_finite() {
            return Err(Error::Format("non-finite scale".into()));
        }
        Ok(())
    }

    /// Number of entries in the offset table.
    pub const fn tile_count(&self) -> usize {
        let levels = self.max_level - self.min_level + 1;
        self.min_level as usize + ((1usize << (2 * levels)) - 1) / 3
    }

    /// Byte offset of the first payload.
    pub const fn data_start(&self) -> usize {
        HEADER_SIZE + 8 * self.tile_count()
    }

    /// Tile size at a file level, borders excluded.
    pub const fn tile_size_at(&self, level: u32) -> u32 {
        if level >= self.min_level {
            self.tile_size
        } else {
            self.tile_size >> (self.min_level - level)
        }
    }

    /// Samples per row of a stored tile at a file level.
    pub const fn samples_at(&self, level: u32) -> u32 {
        self.tile_size_at(level) + 5
    }

    /// Offset table index of file tile `(level, tx, ty)`.
    ///
    /// Levels below `min_level` hold a single tile and ignore `tx, ty`.
    pub const fn tile_id(&self, level: u32, tx: u32, ty: u32) -> usize {
        if level < self.min_level {
            return level as usize;
        }
        let l = level - self.min_level;
        self.min_level as usize
            + tx as usize
            + (ty as usize) * (1usize << l)
            + ((1usize << (2 * l)) - 1) / 3
    }

    /// Whether file tile `(level, tx, ty)` has an entry in the table.
    pub const fn contains(&self, level: u32, tx: u32, ty: u32) -> bool {
        if level > self.max_level {
            return false;
        }
        if level < self.min_level {
            return true;
        }
        let n = 1u32 << (level - self.min_level);
        tx < n && ty < n
    }
}

/// One offset table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileEntry {
    /// Relative to [`ResidualHeader::data_start`].
    pub offset: u32,
    pub size: u32,
}

/// The `(offset, size)` pairs of every tile id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetTable {
    entries: Vec<TileEntry>,
}

impl OffsetTable {
    pub fn new(entries: Vec<TileEntry>) -> Self {
        Self { entries }
    }

    pub fn read(mut reader: impl Read, header: &ResidualHeader) -> Result<Self> {
        let count = header.tile_count();
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = reader.read_u32::<LittleEndian>()?;
            let size = reader.read_u32::<LittleEndian>()?;
            entries.push(TileEntry { offset, size });
        }
        Ok(Self { entries })
    }

    pub fn write(&self, mut writer: impl Write) -> Result<()> {
        for entry in &self.entries {
            writer.write_u32::<LittleEndian>(entry.offset)?;
            writer.write_u32::<LittleEndian>(entry.size)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: usize) -> Result<TileEntry> {
        self.entries.get(id).copied().ok_or_else(|| {
            Error::OutOfBounds(format!("tile id {id} in a table of {}", self.entries.len()))
        })
    }

    /// Check every payload against the data section length.
    pub fn check_bounds(&self, data_len: u64) -> Result<()> {
        for (id, entry) in self.entries.iter().enumerate() {
            let end = u64::from(entry.offset) + u64::from(entry.size);
            if end > data_len {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("tile {id} ends at {end}, past the {data_len} payload bytes"),
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_count_matches_levels() {
        assert_eq!(ResidualHeader::new(0, 0, 6, 1.0).tile_count(), 1);
        assert_eq!(ResidualHeader::new(0, 2, 8, 1.0).tile_count(), 1 + 4 + 16);
        // Two packed levels, then levels 2 and 3.
        assert_eq!(ResidualHeader::new(2, 3, 8, 1.0).tile_count(), 2 + 1 + 4);
    }

    #[test]
    fn tile_ids_are_dense_and_unique() {
        let header = ResidualHeader::new(2, 4, 16, 1.0);
        let mut seen = vec![false; header.tile_count()];
        for level in 0..=header.max_level {
            let n = if level < header.min_level {
                1
            } else {
                1 << (level - header.min_level)
            };
            for ty in 0..n {
                for tx in 0..n {
                    let id = header.tile_id(level, tx, ty);
                    assert!(!seen[id], "id {id} used twice");
                    seen[id] = true;
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn packed_levels_shrink_tiles() {
        let header = ResidualHeader::new(2, 3, 16, 1.0);
        assert_eq!(header.tile_size_at(0), 4);
        assert_eq!(header.tile_size_at(1), 8);
        assert_eq!(header.tile_size_at(2), 16);
        assert_eq!(header.tile_size_at(3), 16);
        assert_eq!(header.samples_at(0), 9);
    }

    #[test]
    fn header_round_trip_is_28_bytes() {
        let header = ResidualHeader::new(1, 3, 8, 0.25).with_root(2, 1, 3);
        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..4], &1i32.to_le_bytes());
        assert_eq!(ResidualHeader::read(bytes.as_slice()).unwrap(), header);
    }

    #[test]
    fn bad_headers_are_format_errors() {
        let mut bytes = Vec::new();
        ResidualHeader::new(3, 1, 8, 1.0).write(&mut bytes).unwrap();
        assert!(matches!(
            ResidualHeader::read(bytes.as_slice()),
            Err(Error::Format(_))
        ));

        // Odd tile size at level 0.
        assert!(ResidualHeader::new(1, 1, 6, 1.0).validate().is_err());
        assert!(ResidualHeader::new(0, 0, 6, 1.0).with_root(1, 2, 0).validate().is_err());
    }

    #[test]
    fn truncated_header_is_io_error() {
        let err = ResidualHeader::read(&[0u8; 10][..]).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn out_of_range_payload_is_rejected() {
        let table = OffsetTable::new(vec![
            TileEntry { offset: 0, size: 10 },
            TileEntry { offset: 10, size: 6 },
        ]);
        assert!(table.check_bounds(16).is_ok());
        assert!(matches!(table.check_bounds(15), Err(Error::Io(_))));
        assert!(matches!(table.get(2), Err(Error::OutOfBounds(_))));
    }
}
