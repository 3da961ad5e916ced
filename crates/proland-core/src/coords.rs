//! Quadtree tile coordinates.

use crate::constants::MAX_LEVEL;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Position of a tile in the terrain quadtree.
///
/// Level 0 is the single root tile; level `l` has `2^l` tiles per axis and
/// valid coordinates satisfy `0 <= tx, ty < 2^l`.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Pod,
    Zeroable,
    Serialize,
    Deserialize,
)]
#[repr(C)]
pub struct TileCoord {
    pub level: u32,
    pub tx: u32,
    pub ty: u32,
}

impl TileCoord {
    /// The root tile.
    pub const ROOT: Self = Self {
        level: 0,
        tx: 0,
        ty: 0,
    };

    /// Create a new tile coordinate
    #[inline]
    pub const fn new(level: u32, tx: u32, ty: u32) -> Self {
        Self { level, tx, ty }
    }

    /// Number of tiles per axis at the given level.
    #[inline]
    pub const fn tiles_per_axis(level: u32) -> u64 {
        1u64 << level
    }

    /// Returns true if the coordinates lie inside the level's grid.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.level <= MAX_LEVEL
            && (self.tx as u64) < Self::tiles_per_axis(self.level)
            && (self.ty as u64) < Self::tiles_per_axis(self.level)
    }

    /// The tile one level up that contains this one.
    #[inline]
    pub const fn parent(self) -> Option<Self> {
        if self.level == 0 {
            None
        } else {
            Some(Self::new(self.level - 1, self.tx / 2, self.ty / 2))
        }
    }

    /// The ancestor at `level`, or `self` when `level == self.level`.
    pub const fn ancestor(self, level: u32) -> Option<Self> {
        if level > self.level {
            return None;
        }
        let shift = self.level - level;
        Some(Self::new(level, self.tx >> shift, self.ty >> shift))
    }

    /// Child `i` in `0..4`: `(2tx + i % 2, 2ty + i / 2)`.
    #[inline]
    pub const fn child(self, i: usize) -> Self {
        debug_assert!(i < 4);
        Self::new(
            self.level + 1,
            2 * self.tx + (i % 2) as u32,
            2 * self.ty + (i / 2) as u32,
        )
    }

    /// All four children in index order.
    pub const fn children(self) -> [Self; 4] {
        [self.child(0), self.child(1), self.child(2), self.child(3)]
    }

    /// Index of this tile among its parent's children.
    #[inline]
    pub const fn child_index(self) -> usize {
        ((self.tx % 2) + 2 * (self.ty % 2)) as usize
    }

    /// Returns true if `other` is this tile or one of its descendants.
    pub const fn contains(self, other: Self) -> bool {
        if other.level < self.level {
            return false;
        }
        let shift = other.level - self.level;
        (other.tx >> shift) == self.tx && (other.ty >> shift) == self.ty
    }

    /// Position and size of this tile inside `ancestor`, in ancestor tile units.
    ///
    /// Returns `(dx, dy, scale)` where the tile covers
    /// `[dx, dx + scale] x [dy, dy + scale]` of the unit square of `ancestor`.
    pub fn offset_in(self, ancestor: Self) -> Option<(f64, f64, f64)> {
        if !ancestor.contains(self) {
            return None;
        }
        let shift = self.level - ancestor.level;
        let scale = 1.0 / f64::from(1u32 << shift);
        let dx = f64::from(self.tx - (ancestor.tx << shift)) * scale;
        let dy = f64::from(self.ty - (ancestor.ty << shift)) * scale;
        Some((dx, dy, scale))
    }

    /// Neighbors in the 3x3 block around this tile (itself included) that
    /// lie inside the level's grid.
    pub fn neighborhood(self) -> impl Iterator<Item = Self> {
        let n = Self::tiles_per_axis(self.level) as i64;
        let (tx, ty, level) = (i64::from(self.tx), i64::from(self.ty), self.level);
        (-1i64..=1).flat_map(move |dy| {
            (-1i64..=1).filter_map(move |dx| {
                let (x, y) = (tx + dx, ty + dy);
                (x >= 0 && y >= 0 && x < n && y < n).then(|| Self::new(level, x as u32, y as u32))
            })
        })
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.level, self.tx, self.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_coordinates() {
        let parent = TileCoord::new(2, 1, 3);
        assert_eq!(parent.child(0), TileCoord::new(3, 2, 6));
        assert_eq!(parent.child(1), TileCoord::new(3, 3, 6));
        assert_eq!(parent.child(2), TileCoord::new(3, 2, 7));
        assert_eq!(parent.child(3), TileCoord::new(3, 3, 7));
        for (i, child) in parent.children().into_iter().enumerate() {
            assert_eq!(child.parent(), Some(parent));
            assert_eq!(child.child_index(), i);
        }
    }

    #[test]
    fn root_has_no_parent() {
        assert_eq!(TileCoord::ROOT.parent(), None);
        assert!(TileCoord::ROOT.is_valid());
        assert!(!TileCoord::new(1, 2, 0).is_valid());
    }

    #[test]
    fn containment_and_offsets() {
        let ancestor = TileCoord::new(1, 1, 0);
        let tile = TileCoord::new(3, 5, 2);
        assert!(ancestor.contains(tile));
        assert!(!TileCoord::new(1, 0, 0).contains(tile));
        assert_eq!(tile.ancestor(1), Some(ancestor));
        let (dx, dy, scale) = tile.offset_in(ancestor).unwrap();
        assert_eq!((dx, dy, scale), (0.25, 0.5, 0.25));
    }

    #[test]
    fn neighborhood_is_clamped_to_grid() {
        assert_eq!(TileCoord::ROOT.neighborhood().count(), 1);
        assert_eq!(TileCoord::new(2, 0, 0).neighborhood().count(), 4);
        assert_eq!(TileCoord::new(2, 1, 2).neighborhood().count(), 9);
    }
}
