//! Terrain quadtree nodes.

use glam::DVec2;
use proland_core::{Box3, TileCoord, Visibility};

/// One square patch of the terrain quadtree, in local (undeformed) space.
#[derive(Debug, Clone)]
pub struct TerrainQuad {
    /// Quadtree coordinates; also the tile coordinates producers are asked for.
    pub coord: TileCoord,
    /// Lower corner.
    pub ox: f64,
    pub oy: f64,
    /// Side length.
    pub l: f64,
    /// Elevation range of the quad, refined as elevation tiles arrive.
    pub zmin: f64,
    pub zmax: f64,
    pub visible: Visibility,
    pub occluded: bool,
    pub drawable: bool,
    children: Option<Box<[TerrainQuad; 4]>>,
}

impl TerrainQuad {
    /// Create a new leaf quad.
    pub const fn new(coord: TileCoord, ox: f64, oy: f64, l: f64, zmin: f64, zmax: f64) -> Self {
        Self {
            coord,
            ox,
            oy,
            l,
            zmin,
            zmax,
            visible: Visibility::Partially,
            occluded: false,
            drawable: false,
            children: None,
        }
    }

    /// The root quad `[-size, size]²`.
    pub const fn root(size: f64, zmin: f64, zmax: f64) -> Self {
        Self::new(TileCoord::ROOT, -size, -size, 2.0 * size, zmin, zmax)
    }

    #[inline]
    pub const fn level(&self) -> u32 {
        self.coord.level
    }

    #[inline]
    pub const fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    #[inline]
    pub const fn is_visible(&self) -> bool {
        self.visible.is_visible()
    }

    pub fn children(&self) -> Option<&[Self; 4]> {
        self.children.as_deref()
    }

    pub fn children_mut(&mut self) -> Option<&mut [Self; 4]> {
        self.children.as_deref_mut()
    }

    /// Bounding box from the current elevation range.
    pub fn local_box(&self) -> Box3 {
        Box3::from_footprint(self.ox, self.oy, self.l, self.zmin, self.zmax)
    }

    /// Create the four children, inheriting this quad's elevation range.
    ///
    /// Child `i` covers the `(i % 2, i / 2)` quarter.
    pub fn subdivide(&mut self) {
        if self.children.is_some() {
            return;
        }
        let hl = self.l / 2.0;
        let child = |i: usize| {
            Self::new(
                self.coord.child(i),
                self.ox + (i % 2) as f64 * hl,
                self.oy + (i / 2) as f64 * hl,
                hl,
                self.zmin,
                self.zmax,
            )
        };
        self.children = Some(Box::new([child(0), child(1), child(2), child(3)]));
    }

    /// Drop the whole subtree below this quad.
    pub fn collapse(&mut self) {
        self.children = None;
    }

    /// Child indices ordered from the one containing `camera` outwards.
    pub fn child_order(&self, camera: DVec2) -> [usize; 4] {
        let cx = self.ox + self.l / 2.0;
        let cy = self.oy + self.l / 2.0;
        match (camera.x < cx, camera.y < cy) {
            (true, true) => [0, 1, 2, 3],
            (false, true) => [1, 0, 3, 2],
            (true, false) => [2, 0, 3, 1],
            (false, false) => [3, 1, 2, 0],
        }
    }

    /// Visit this quad and its descendants depth first, parents before children.
    pub fn visit(&self, f: &mut impl FnMut(&Self)) {
        f(self);
        if let Some(children) = self.children() {
            for child in children {
                child.visit(f);
            }
        }
    }

    /// Mutable depth-first visit, parents before children.
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut Self)) {
        f(self);
        if let Some(children) = self.children_mut() {
            for child in children {
                child.visit_mut(f);
            }
        }
    }

    /// Number of quads in this subtree.
    pub fn count(&self) -> usize {
        let mut n = 0;
        self.visit(&mut |_| n += 1);
        n
    }

    /// Deepest level in this subtree.
    pub fn depth(&self) -> u32 {
        let mut depth = 0;
        self.visit(&mut |q| depth = depth.max(q.level()));
        depth
    }

    /// Leaf coordinates of this subtree.
    pub fn leaves(&self) -> Vec<TileCoord> {
        let mut leaves = Vec::new();
        self.visit(&mut |q| {
            if q.is_leaf() {
                leaves.push(q.coord);
            }
        });
        leaves
    }

    /// The quad with coordinates `coord`, if it is part of this subtree.
    pub fn find(&self, coord: TileCoord) -> Option<&Self> {
        if coord == self.coord {
            return Some(self);
        }
        if !self.coord.contains(coord) {
            return None;
        }
        self.children()?.iter().find_map(|c| c.find(coord))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_split_the_footprint() {
        let mut root = TerrainQuad::root(100.0, -5.0, 20.0);
        root.subdivide();
        let children = root.children().unwrap();
        assert_eq!(children[0].coord, TileCoord::new(1, 0, 0));
        assert_eq!(children[3].coord, TileCoord::new(1, 1, 1));
        assert_eq!((children[1].ox, children[1].oy, children[1].l), (0.0, -100.0, 100.0));
        assert_eq!((children[2].ox, children[2].oy), (-100.0, 0.0));
        assert!(children.iter().all(|c| c.zmin == -5.0 && c.zmax == 20.0));
        assert_eq!(root.count(), 5);
        assert_eq!(root.depth(), 1);
    }

    #[test]
    fn nearest_child_comes_first() {
        let root = TerrainQuad::root(1.0, 0.0, 0.0);
        assert_eq!(root.child_order(DVec2::new(-0.5, -0.5))[0], 0);
        assert_eq!(root.child_order(DVec2::new(0.5, -0.5))[0], 1);
        assert_eq!(root.child_order(DVec2::new(-0.5, 0.5))[0], 2);
        assert_eq!(root.child_order(DVec2::new(0.5, 0.5)), [3, 1, 2, 0]);
    }

    #[test]
    fn find_follows_the_subtree() {
        let mut root = TerrainQuad::root(1.0, 0.0, 0.0);
        root.subdivide();
        root.children_mut().unwrap()[2].subdivide();
        assert!(root.find(TileCoord::new(2, 1, 3)).is_some());
        assert!(root.find(TileCoord::new(2, 3, 3)).is_none());
        assert_eq!(root.leaves().len(), 7);
        root.collapse();
        assert!(root.is_leaf());
    }
}
