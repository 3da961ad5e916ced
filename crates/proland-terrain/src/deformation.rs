//! Deformations from the planar terrain space to its rendered embedding.
//!
//! The quadtree is always built in *local* space: a plane with `z` up, where
//! the root quad is `[-size, size]²`. A [`Deformation`] maps that plane into
//! the *deformed* frame the camera lives in. The spherical variant wraps the
//! plane onto one face of a sphere of radius `R` centered at `(0, 0, -R)` in
//! local terms (the origin of the deformed frame is the sphere center); the
//! cylindrical variant rolls the `y` axis onto the inside of a cylinder whose
//! axis is parallel to `x`.

use glam::{DMat3, DMat4, DVec2, DVec3, DVec4};
use proland_core::math::plane_distance;
use proland_core::{Box2, Box3, Visibility};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::camera::to_f32;
use crate::node::CameraFrame;
use crate::quad::TerrainQuad;
use crate::uniforms::QuadUniforms;

/// How local terrain coordinates are embedded in the deformed frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Deformation {
    /// Flat terrain; local and deformed frames coincide.
    #[default]
    Identity,
    /// One cube face of a planet of the given radius.
    Spherical { radius: f64 },
    /// The inside of a cylinder of the given radius, axis along `x`.
    Cylindrical { radius: f64 },
}

impl Deformation {
    /// Map a local point to the deformed frame.
    pub fn local_to_deformed(&self, p: DVec3) -> DVec3 {
        match *self {
            Self::Identity => p,
            Self::Spherical { radius: r } => DVec3::new(p.x, p.y, r).normalize() * (p.z + r),
            Self::Cylindrical { radius: r } => {
                let alpha = p.y / r;
                let d = r - p.z;
                DVec3::new(p.x, d * alpha.sin(), -d * alpha.cos())
            }
        }
    }

    /// Map a deformed point back to local space.
    ///
    /// Spherical points on the opposite hemisphere have no local preimage
    /// and map to infinity; points on the side faces map outside the root.
    pub fn deformed_to_local(&self, q: DVec3) -> DVec3 {
        match *self {
            Self::Identity => q,
            Self::Spherical { radius: r } => {
                let h = q.length() - r;
                let (ax, ay, az) = (q.x.abs(), q.y.abs(), q.z.abs());
                if q.z >= ax && q.z >= ay {
                    DVec3::new(q.x / q.z * r, q.y / q.z * r, h)
                } else if q.z <= -ax && q.z <= -ay {
                    DVec3::splat(f64::INFINITY)
                } else if q.y >= ax && q.y >= az {
                    DVec3::new(q.x / q.y * r, (2.0 - q.z / q.y) * r, h)
                } else if q.y <= -ax && q.y <= -az {
                    DVec3::new(-q.x / q.y * r, (-2.0 - q.z / q.y) * r, h)
                } else if q.x >= ay && q.x >= az {
                    DVec3::new((2.0 - q.z / q.x) * r, q.y / q.x * r, h)
                } else {
                    DVec3::new((-2.0 - q.z / q.x) * r, -q.y / q.x * r, h)
                }
            }
            Self::Cylindrical { radius: r } => DVec3::new(
                q.x,
                r * q.y.atan2(-q.z),
                r - DVec2::new(q.y, q.z).length(),
            ),
        }
    }

    /// First order approximation of the deformation around `p` (at `z = 0`).
    ///
    /// The result maps local offsets relative to `(p.x, p.y, 0)` to deformed
    /// points. With `clamp`, spherical coordinates are first wrapped into the
    /// root face so that the matrix stays well conditioned far from it.
    pub fn local_to_deformed_differential(&self, p: DVec3, clamp: bool) -> DMat4 {
        if !p.is_finite() {
            return DMat4::IDENTITY;
        }
        match *self {
            Self::Identity => DMat4::from_translation(DVec3::new(p.x, p.y, 0.0)),
            Self::Spherical { radius: r } => {
                let mut p = p;
                if clamp {
                    p.x -= ((p.x + r) / (2.0 * r)).floor() * 2.0 * r;
                    p.y -= ((p.y + r) / (2.0 * r)).floor() * 2.0 * r;
                }
                let (x, y) = (p.x, p.y);
                let l = x * x + y * y + r * r;
                let c0 = 1.0 / l.sqrt();
                let c1 = c0 * r / l;
                from_rows([
                    [(y * y + r * r) * c1, -x * y * c1, x * c0, r * x * c0],
                    [-x * y * c1, (x * x + r * r) * c1, y * c0, r * y * c0],
                    [-x * r * c1, -y * r * c1, r * c0, r * r * c0],
                    [0.0, 0.0, 0.0, 1.0],
                ])
            }
            Self::Cylindrical { radius: r } => {
                let (s, c) = (p.y / r).sin_cos();
                from_rows([
                    [1.0, 0.0, 0.0, p.x],
                    [0.0, c, -s, r * s],
                    [0.0, s, c, -r * c],
                    [0.0, 0.0, 0.0, 1.0],
                ])
            }
        }
    }

    /// Orthonormal frame at a deformed point: `x`, `y` tangent to the
    /// surface, `z` along the local vertical, origin on the surface.
    pub fn deformed_to_tangent_frame(&self, q: DVec3) -> DMat4 {
        match *self {
            Self::Identity => DMat4::from_translation(DVec3::new(-q.x, -q.y, 0.0)),
            Self::Spherical { radius: r } => {
                let uz = q.normalize_or(DVec3::Z);
                let ux = DVec3::Y.cross(uz).normalize_or(DVec3::X);
                let uy = uz.cross(ux);
                from_rows([
                    [ux.x, ux.y, ux.z, 0.0],
                    [uy.x, uy.y, uy.z, 0.0],
                    [uz.x, uz.y, uz.z, -r],
                    [0.0, 0.0, 0.0, 1.0],
                ])
            }
            Self::Cylindrical { radius: r } => {
                let uz = DVec3::new(0.0, -q.y, -q.z).normalize_or(DVec3::Z);
                let ux = DVec3::X;
                let uy = uz.cross(ux);
                let o = DVec3::new(q.x, -uz.y * r, -uz.z * r);
                from_rows([
                    [ux.x, ux.y, ux.z, -ux.dot(o)],
                    [uy.x, uy.y, uy.z, -uy.dot(o)],
                    [uz.x, uz.y, uz.z, -uz.dot(o)],
                    [0.0, 0.0, 0.0, 1.0],
                ])
            }
        }
    }

    /// Local `xy` bounds of the deformed ball `(center, radius)`.
    ///
    /// Returns an unbounded box when the ball has no bounded preimage.
    pub fn deformed_to_local_bounds(&self, center: DVec3, radius: f64) -> Box2 {
        let unbounded = Box2::new(DVec2::NEG_INFINITY, DVec2::INFINITY);
        let bounds = match *self {
            Self::Identity => Box2::new(center.truncate() - radius, center.truncate() + radius),
            Self::Spherical { radius: big_r } => {
                let p = self.deformed_to_local(center);
                let rr = big_r * big_r;
                let k = (1.0 - radius * radius / (2.0 * rr)) * DVec3::new(p.x, p.y, big_r).length();
                let a_ = k * k - p.x * p.x;
                let b_ = k * k - p.y * p.y;
                let c_ = -2.0 * p.x * p.y;
                let d_ = -2.0 * rr * p.x;
                let e_ = -2.0 * rr * p.y;
                let f_ = rr * (k * k - rr);
                let a = c_ * c_ - 4.0 * a_ * b_;
                let (x1, x2) = quadratic_roots(a, 2.0 * c_ * e_ - 4.0 * b_ * d_, e_ * e_ - 4.0 * b_ * f_);
                let (y1, y2) = quadratic_roots(a, 2.0 * c_ * d_ - 4.0 * a_ * e_, d_ * d_ - 4.0 * a_ * f_);
                Box2::new(DVec2::new(x1, y1), DVec2::new(x2, y2))
            }
            Self::Cylindrical { radius: big_r } => {
                let p = self.deformed_to_local(center);
                let rho = DVec2::new(center.y, center.z).length();
                if radius >= rho {
                    return unbounded;
                }
                let dy = big_r * (radius / rho).asin();
                Box2::new(DVec2::new(p.x - radius, p.y - dy), DVec2::new(p.x + radius, p.y + dy))
            }
        };
        if bounds.min.is_finite() && bounds.max.is_finite() {
            bounds
        } else {
            unbounded
        }
    }

    /// Classify a local box against the camera frame.
    ///
    /// A frame with non-finite camera state classifies everything as
    /// partially visible.
    pub fn visibility(&self, frame: &CameraFrame, b: &Box3) -> Visibility {
        if !frame.is_finite() {
            return Visibility::Partially;
        }
        match *self {
            Self::Identity => frame.frustum.box_visibility(b),
            Self::Spherical { radius } => spherical_visibility(radius, frame, b),
            Self::Cylindrical { radius } => cylindrical_visibility(self, radius, frame, b),
        }
    }

    /// Uniforms positioning `quad` on screen for this frame.
    pub fn quad_uniforms(&self, frame: &CameraFrame, quad: &TerrainQuad) -> QuadUniforms {
        let (ox, oy, l) = (quad.ox, quad.oy, quad.l);
        let camera = frame.local_camera;
        let local_corners = [
            DVec3::new(ox, oy, 0.0),
            DVec3::new(ox + l, oy, 0.0),
            DVec3::new(ox, oy + l, 0.0),
            DVec3::new(ox + l, oy + l, 0.0),
        ];
        let corners = local_corners.map(|p| self.local_to_deformed(p).extend(1.0));
        let verticals = local_corners.map(|p| {
            self.local_to_deformed_differential(p, false)
                .col(2)
                .truncate()
                .extend(0.0)
        });
        let norms = match *self {
            Self::Spherical { radius } => {
                local_corners.map(|p| (DVec3::new(p.x, p.y, radius).length() / radius) as f32)
            }
            _ => [1.0; 4],
        };
        let center = self.local_to_deformed(DVec3::new(ox + l / 2.0, oy + l / 2.0, 0.0));
        let tangent = DMat3::from_mat4(self.deformed_to_tangent_frame(center)).transpose();
        let ltos = frame.local_to_screen;

        QuadUniforms {
            offset: [ox as f32, oy as f32, l as f32, quad.level() as f32],
            camera: [
                ((camera.x - ox) / l) as f32,
                ((camera.y - oy) / l) as f32,
                ((camera.z - frame.ground_height) / (l * frame.dist_factor)) as f32,
                camera.z as f32,
            ],
            blending: [
                (frame.split_dist + 1.0) as f32,
                (frame.split_dist - 1.0) as f32,
                0.0,
                0.0,
            ],
            local_to_screen: to_f32(ltos),
            screen_quad_corners: to_f32(ltos * DMat4::from_cols(corners[0], corners[1], corners[2], corners[3])),
            screen_quad_verticals: to_f32(
                ltos * DMat4::from_cols(verticals[0], verticals[1], verticals[2], verticals[3]),
            ),
            screen_quad_corner_norms: norms,
            tangent_frame_to_world: to_f32(DMat4::from_mat3(tangent)),
        }
    }
}

fn from_rows(rows: [[f64; 4]; 4]) -> DMat4 {
    DMat4::from_cols_array_2d(&rows).transpose()
}

/// Sorted roots of `a x² + b x + c`.
fn quadratic_roots(a: f64, b: f64, c: f64) -> (f64, f64) {
    let d = (b * b - 4.0 * a * c).sqrt();
    let x1 = (-b - d) / (2.0 * a);
    let x2 = (-b + d) / (2.0 * a);
    (x1.min(x2), x1.max(x2))
}

/// Classify the four deformed bottom corners of a box against one plane.
///
/// `f` scales the corners to cover the top of the box and the bulge of the
/// sphere between them.
fn corners_visibility(plane: DVec4, corners: &[DVec3; 4], f: f64) -> Visibility {
    let n = plane.truncate();
    let o = n.dot(corners[0]);
    let inside = o + plane.w > 0.0;
    let consistent = |o: f64| (o + plane.w > 0.0) == inside && (o * f + plane.w > 0.0) == inside;
    if consistent(o) && corners[1..].iter().all(|c| consistent(n.dot(*c))) {
        if inside {
            Visibility::Fully
        } else {
            Visibility::Invisible
        }
    } else {
        Visibility::Partially
    }
}

fn spherical_visibility(r: f64, frame: &CameraFrame, b: &Box3) -> Visibility {
    let d = Deformation::Spherical { radius: r };
    let corners = [
        d.local_to_deformed(DVec3::new(b.min.x, b.min.y, b.min.z)),
        d.local_to_deformed(DVec3::new(b.max.x, b.min.y, b.min.z)),
        d.local_to_deformed(DVec3::new(b.max.x, b.max.y, b.min.z)),
        d.local_to_deformed(DVec3::new(b.min.x, b.max.y, b.min.z)),
    ];
    let a = (b.max.z + r) / (b.min.z + r);
    let dx = (b.max.x - b.min.x) / 2.0 * a;
    let dy = (b.max.y - b.min.y) / 2.0 * a;
    let dz = b.max.z + r;
    let f = (dx * dx + dy * dy + dz * dz).sqrt() / (b.min.z + r);

    let mut result = Visibility::Fully;
    for plane in &frame.frustum.planes[..5] {
        match corners_visibility(*plane, &corners, f) {
            Visibility::Invisible => return Visibility::Invisible,
            Visibility::Partially => result = Visibility::Partially,
            Visibility::Fully => {}
        }
    }

    // Plane through the horizon circle of the lowest point of the box, as
    // seen from the camera.
    let c = frame.deformed_camera;
    let rm = r + b.min.z.min(0.0);
    let rm_sq = rm * rm;
    let r_max = r + b.max.z;
    let horizon = DVec4::new(
        c.x,
        c.y,
        c.z,
        ((c.length_squared() - rm_sq) * (r_max * r_max - rm_sq)).sqrt() - rm_sq,
    );
    if horizon.is_finite() {
        match corners_visibility(horizon, &corners, f) {
            Visibility::Invisible => return Visibility::Invisible,
            Visibility::Partially => result = Visibility::Partially,
            Visibility::Fully => {}
        }
    }
    result
}

fn cylindrical_visibility(d: &Deformation, r: f64, frame: &CameraFrame, b: &Box3) -> Visibility {
    let span = (b.max.y - b.min.y) / r;
    if span > PI {
        return Visibility::Partially;
    }
    let center = d.local_to_deformed(b.center());
    let mut radius = b
        .corners()
        .iter()
        .map(|c| d.local_to_deformed(*c).distance(center))
        .fold(0.0, f64::max);
    // The arc between two corners bulges out of their chord.
    radius += (r - b.min.z) * (1.0 - (span / 2.0).cos());

    let mut result = Visibility::Fully;
    for plane in &frame.frustum.planes[..5] {
        let dist = plane_distance(*plane, center);
        if dist < -radius {
            return Visibility::Invisible;
        }
        if dist < radius {
            result = Visibility::Partially;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const R: f64 = 6_360_000.0;

    fn assert_vec_eq(a: DVec3, b: DVec3, epsilon: f64) {
        assert_relative_eq!(a.x, b.x, epsilon = epsilon);
        assert_relative_eq!(a.y, b.y, epsilon = epsilon);
        assert_relative_eq!(a.z, b.z, epsilon = epsilon);
    }

    #[test]
    fn local_points_round_trip() {
        let p = DVec3::new(120_000.0, -340_000.0, 2_500.0);
        for d in [
            Deformation::Identity,
            Deformation::Spherical { radius: R },
            Deformation::Cylindrical { radius: R },
        ] {
            assert_vec_eq(d.deformed_to_local(d.local_to_deformed(p)), p, 1e-5);
        }
    }

    #[test]
    fn spherical_root_center_is_the_north_pole() {
        let d = Deformation::Spherical { radius: R };
        assert_vec_eq(d.local_to_deformed(DVec3::new(0.0, 0.0, 100.0)), DVec3::new(0.0, 0.0, R + 100.0), 1e-6);
        let below = d.deformed_to_local(DVec3::new(0.0, 0.0, -R));
        assert!(below.x.is_infinite());
    }

    #[test]
    fn differential_matches_finite_differences() {
        let p = DVec3::new(800_000.0, 300_000.0, 0.0);
        let h = 1.0;
        for d in [Deformation::Spherical { radius: R }, Deformation::Cylindrical { radius: R }] {
            let m = d.local_to_deformed_differential(p, false);
            let origin = d.local_to_deformed(p);
            assert_vec_eq(m.transform_point3(DVec3::ZERO), origin, 1e-6);
            for axis in [DVec3::X, DVec3::Y, DVec3::Z] {
                let numeric = d.local_to_deformed(p + axis * h) - origin;
                let analytic = m.transform_vector3(axis * h);
                assert_vec_eq(analytic, numeric, 1e-3);
            }
        }
    }

    #[test]
    fn tangent_frame_puts_the_surface_at_the_origin() {
        let p = DVec3::new(250_000.0, -75_000.0, 0.0);
        for d in [
            Deformation::Identity,
            Deformation::Spherical { radius: R },
            Deformation::Cylindrical { radius: R },
        ] {
            let q = d.local_to_deformed(p);
            let t = d.deformed_to_tangent_frame(q).transform_point3(q);
            assert_vec_eq(t, DVec3::ZERO, 1e-6);
            let up = d.local_to_deformed(p + DVec3::Z * 10.0);
            let t = d.deformed_to_tangent_frame(q).transform_point3(up);
            assert_vec_eq(t, DVec3::new(0.0, 0.0, 10.0), 1e-6);
        }
    }

    #[test]
    fn spherical_bounds_cover_the_ball() {
        let d = Deformation::Spherical { radius: R };
        let r = 10_000.0;
        let bounds = d.deformed_to_local_bounds(d.local_to_deformed(DVec3::ZERO), r);
        assert_relative_eq!(bounds.min.x, -r, max_relative = 1e-3);
        assert_relative_eq!(bounds.max.x, r, max_relative = 1e-3);
        assert_relative_eq!(bounds.max.y, r, max_relative = 1e-3);
    }

    #[test]
    fn spherical_horizon_hides_far_quads() {
        let d = Deformation::Spherical { radius: R };
        let frame = CameraFrame {
            deformed_camera: DVec3::new(0.0, 0.0, 1.1 * R),
            ..CameraFrame::default()
        };
        let near = Box3::new(DVec3::new(-0.1 * R, -0.1 * R, 0.0), DVec3::new(0.1 * R, 0.1 * R, 0.0));
        let far = Box3::new(DVec3::new(5.0 * R, -0.1 * R, 0.0), DVec3::new(6.0 * R, 0.1 * R, 0.0));
        assert!(d.visibility(&frame, &near).is_visible());
        assert_eq!(d.visibility(&frame, &far), Visibility::Invisible);
    }

    #[test]
    fn non_finite_camera_is_partially_visible() {
        let frame = CameraFrame {
            deformed_camera: DVec3::splat(f64::NAN),
            local_camera: DVec3::splat(f64::NAN),
            ..CameraFrame::default()
        };
        let b = Box3::new(DVec3::splat(-1.0), DVec3::splat(1.0));
        for d in [
            Deformation::Identity,
            Deformation::Spherical { radius: R },
            Deformation::Cylindrical { radius: R },
        ] {
            assert_eq!(d.visibility(&frame, &b), Visibility::Partially);
        }
    }

    #[test]
    fn flat_quad_uniforms() {
        let frame = CameraFrame {
            local_camera: DVec3::new(5.0, 5.0, 20.0),
            split_dist: 2.0,
            ..CameraFrame::default()
        };
        let mut quad = TerrainQuad::root(10.0, 0.0, 0.0);
        quad.subdivide();
        let child = &quad.children().unwrap()[3];
        let u = Deformation::Identity.quad_uniforms(&frame, child);
        assert_eq!(u.offset, [0.0, 0.0, 10.0, 1.0]);
        assert_eq!(u.camera, [0.5, 0.5, 2.0, 20.0]);
        assert_eq!(u.blending[..2], [3.0, 1.0]);
        assert_eq!(u.screen_quad_corners[3], [10.0, 10.0, 0.0, 1.0]);
        assert_eq!(u.screen_quad_verticals[0], [0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn deformations_deserialize_from_tagged_json() {
        let d: Deformation = serde_json::from_str(r#"{"kind":"spherical","radius":1000.0}"#).unwrap();
        assert_eq!(d, Deformation::Spherical { radius: 1000.0 });
    }
}
