//! Double precision math used by the terrain and producers.
//!
//! Terrain coordinates can reach planetary scale, so everything here works on
//! `f64` (`DVec*`, `DMat4`) rather than the `f32` types used for GPU uniforms.

use glam::{DMat4, DVec2, DVec3, DVec4};
use serde::{Deserialize, Serialize};

/// Result of a visibility test against a set of clip planes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    /// Entirely outside at least one plane.
    Invisible,
    /// Crosses at least one plane.
    #[default]
    Partially,
    /// Inside every plane.
    Fully,
}

impl Visibility {
    /// Returns true unless the tested volume is invisible.
    #[inline]
    pub const fn is_visible(self) -> bool {
        !matches!(self, Self::Invisible)
    }
}

/// Axis-aligned 2D box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Box2 {
    pub min: DVec2,
    pub max: DVec2,
}

impl Default for Box2 {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Box2 {
    /// An empty box that any point enlarges to itself.
    pub const EMPTY: Self = Self {
        min: DVec2::splat(f64::INFINITY),
        max: DVec2::splat(f64::NEG_INFINITY),
    };

    /// Create a new box from min and max corners
    #[inline]
    pub const fn new(min: DVec2, max: DVec2) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn center(&self) -> DVec2 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn size(&self) -> DVec2 {
        self.max - self.min
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y
    }

    #[inline]
    pub fn contains_point(&self, p: DVec2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    /// Grow the box to include a point.
    #[inline]
    pub fn enlarge(&mut self, p: DVec2) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Smallest box containing both boxes.
    #[inline]
    pub fn union(&self, other: &Self) -> Self {
        Self::new(self.min.min(other.min), self.max.max(other.max))
    }

    /// Distance from `p` to the box along the axis where it is furthest out.
    pub fn axis_distance(&self, p: DVec2) -> f64 {
        let dx = (self.min.x - p.x).max(p.x - self.max.x).max(0.0);
        let dy = (self.min.y - p.y).max(p.y - self.max.y).max(0.0);
        dx.max(dy)
    }
}

/// Axis-aligned 3D box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Box3 {
    pub min: DVec3,
    pub max: DVec3,
}

impl Default for Box3 {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Box3 {
    /// An empty box that any point enlarges to itself.
    pub const EMPTY: Self = Self {
        min: DVec3::splat(f64::INFINITY),
        max: DVec3::splat(f64::NEG_INFINITY),
    };

    /// Create a new box from min and max corners
    #[inline]
    pub const fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Box spanning a square footprint between two heights.
    #[inline]
    pub fn from_footprint(ox: f64, oy: f64, l: f64, zmin: f64, zmax: f64) -> Self {
        Self::new(DVec3::new(ox, oy, zmin), DVec3::new(ox + l, oy + l, zmax))
    }

    #[inline]
    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    #[inline]
    pub fn xy(&self) -> Box2 {
        Box2::new(self.min.truncate(), self.max.truncate())
    }

    #[inline]
    pub fn contains_point(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Grow the box to include a point.
    #[inline]
    pub fn enlarge(&mut self, p: DVec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// The eight corners, x varying fastest.
    pub fn corners(&self) -> [DVec3; 8] {
        std::array::from_fn(|i| {
            DVec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            )
        })
    }
}

/// Frustum clip planes in some coordinate frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    /// Six frustum planes (left, right, bottom, top, near, far).
    /// Each plane is (nx, ny, nz, d); a point is inside when `n·p + d >= 0`.
    pub planes: [DVec4; 6],
}

impl Frustum {
    /// Extract frustum planes from a projection or view-projection matrix.
    ///
    /// Planes are normalized so `n·p + d` is a signed distance. Degenerate
    /// planes (zero normal) are kept as-is.
    pub fn from_view_projection(vp: DMat4) -> Self {
        let row0 = vp.row(0);
        let row1 = vp.row(1);
        let row2 = vp.row(2);
        let row3 = vp.row(3);

        let planes = [
            row3 + row0, // Left
            row3 - row0, // Right
            row3 + row1, // Bottom
            row3 - row1, // Top
            row3 + row2, // Near
            row3 - row2, // Far
        ]
        .map(normalize_plane);

        Self { planes }
    }

    /// Classify a box against the left, right, bottom, top and near planes.
    ///
    /// The far plane is ignored: terrain quads beyond it are still drawn so
    /// that distant silhouettes stay stable.
    pub fn box_visibility(&self, b: &Box3) -> Visibility {
        let mut result = Visibility::Fully;
        for plane in &self.planes[..5] {
            match plane_visibility(*plane, b) {
                Visibility::Invisible => return Visibility::Invisible,
                Visibility::Partially => result = Visibility::Partially,
                Visibility::Fully => {}
            }
        }
        result
    }

    /// Returns false if the box lies entirely outside one of the side planes.
    #[inline]
    pub fn intersects(&self, b: &Box3) -> bool {
        self.box_visibility(b).is_visible()
    }
}

fn normalize_plane(p: DVec4) -> DVec4 {
    let len = p.truncate().length();
    if len > 0.0 && len.is_finite() {
        p / len
    } else {
        p
    }
}

/// Classify a box against one plane.
pub fn plane_visibility(plane: DVec4, b: &Box3) -> Visibility {
    let normal = plane.truncate();
    let mut inside = 0;
    for c in b.corners() {
        if normal.dot(c) + plane.w > 0.0 {
            inside += 1;
        }
    }
    match inside {
        0 => Visibility::Invisible,
        8 => Visibility::Fully,
        _ => Visibility::Partially,
    }
}

/// Signed distance of `p` to a normalized plane.
#[inline]
pub fn plane_distance(plane: DVec4, p: DVec3) -> f64 {
    plane.truncate().dot(p) + plane.w
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_frustum() -> Frustum {
        let proj = DMat4::perspective_rh_gl(90f64.to_radians(), 1.0, 0.1, 100.0);
        let view = DMat4::look_at_rh(DVec3::ZERO, DVec3::NEG_Z, DVec3::Y);
        Frustum::from_view_projection(proj * view)
    }

    #[test]
    fn box_in_front_is_fully_visible() {
        let frustum = test_frustum();
        let b = Box3::new(DVec3::new(-1.0, -1.0, -10.0), DVec3::new(1.0, 1.0, -8.0));
        assert_eq!(frustum.box_visibility(&b), Visibility::Fully);
    }

    #[test]
    fn box_behind_is_invisible() {
        let frustum = test_frustum();
        let b = Box3::new(DVec3::new(-1.0, -1.0, 5.0), DVec3::new(1.0, 1.0, 8.0));
        assert_eq!(frustum.box_visibility(&b), Visibility::Invisible);
    }

    #[test]
    fn straddling_box_is_partial() {
        let frustum = test_frustum();
        let b = Box3::new(DVec3::new(-50.0, -1.0, -10.0), DVec3::new(0.0, 1.0, -8.0));
        assert_eq!(frustum.box_visibility(&b), Visibility::Partially);
    }

    #[test]
    fn far_plane_is_ignored() {
        let frustum = test_frustum();
        let b = Box3::new(DVec3::new(-1.0, -1.0, -500.0), DVec3::new(1.0, 1.0, -400.0));
        assert!(frustum.intersects(&b));
    }

    #[test]
    fn planes_are_normalized() {
        for plane in test_frustum().planes {
            assert_relative_eq!(plane.truncate().length(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn box2_axis_distance() {
        let b = Box2::new(DVec2::ZERO, DVec2::splat(10.0));
        assert_eq!(b.axis_distance(DVec2::new(5.0, 5.0)), 0.0);
        assert_eq!(b.axis_distance(DVec2::new(13.0, 4.0)), 3.0);
        assert_eq!(b.axis_distance(DVec2::new(-2.0, 16.0)), 6.0);
    }

    #[test]
    fn empty_box_enlarges_to_point() {
        let mut b = Box3::EMPTY;
        b.enlarge(DVec3::new(1.0, 2.0, 3.0));
        assert_eq!(b.min, b.max);
        assert!(b.contains_point(DVec3::new(1.0, 2.0, 3.0)));
    }
}
