//! View controllers turning a few navigation parameters into camera views.
//!
//! Both controllers orbit a target point at distance `d`; `theta` tilts the
//! view away from the vertical and `phi` turns it around the vertical. The
//! camera never goes below the ground height set by a
//! [`TileSamplerZ`](crate::sampler::TileSamplerZ).

use glam::{DMat4, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::camera::CameraView;

/// Something that produces the camera view of the current frame.
pub trait ViewController {
    fn view(&self) -> CameraView;

    /// Height of the terrain below the camera.
    fn set_ground_height(&mut self, height: f64);

    /// Camera position in the deformed frame.
    fn position(&self) -> DVec3 {
        self.view().position()
    }
}

/// Orbit frame with rows `cx`, `cy`, `cz`; the camera looks along `-cz`.
fn orbit_axes(px: DVec3, py: DVec3, pz: DVec3, theta: f64, phi: f64) -> [DVec3; 3] {
    let (st, ct) = theta.sin_cos();
    let (sp, cp) = phi.sin_cos();
    let cx = px * cp + py * sp;
    let cy = -px * sp * ct + py * cp * ct + pz * st;
    let cz = px * sp * st - py * cp * st + pz * ct;
    [cx, cy, cz]
}

fn view_matrix(axes: [DVec3; 3], position: DVec3) -> DMat4 {
    let [cx, cy, cz] = axes;
    let rotation = DMat4::from_cols(
        cx.extend(0.0),
        cy.extend(0.0),
        cz.extend(0.0),
        glam::DVec4::W,
    )
    .transpose();
    rotation * DMat4::from_translation(-position)
}

/// Navigation over a flat terrain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainViewController {
    /// Target point on the ground.
    pub x0: f64,
    pub y0: f64,
    /// Tilt from the vertical, in radians.
    pub theta: f64,
    /// Azimuth, in radians.
    pub phi: f64,
    /// Distance from the target.
    pub d: f64,
    pub zoom: f64,
    /// Horizontal field of view, in radians.
    pub fov: f64,
    pub viewport: DVec2,
    pub ground_height: f64,
}

impl Default for TerrainViewController {
    fn default() -> Self {
        Self {
            x0: 0.0,
            y0: 0.0,
            theta: 0.0,
            phi: 0.0,
            d: 10_000.0,
            zoom: 1.0,
            fov: 80f64.to_radians(),
            viewport: DVec2::new(1024.0, 768.0),
            ground_height: 0.0,
        }
    }
}

impl TerrainViewController {
    /// Create a new controller looking down at `(x0, y0)` from `d`.
    pub fn new(x0: f64, y0: f64, d: f64) -> Self {
        Self {
            x0,
            y0,
            d,
            ..Self::default()
        }
    }

    /// Set the tilt and azimuth.
    pub const fn with_angles(mut self, theta: f64, phi: f64) -> Self {
        self.theta = theta;
        self.phi = phi;
        self
    }

    /// Set the viewport size in pixels.
    pub const fn with_viewport(mut self, viewport: DVec2) -> Self {
        self.viewport = viewport;
        self
    }

    /// Move the target point by `(dx, dy)` in the camera's heading.
    pub fn move_by(&mut self, dx: f64, dy: f64) {
        let (sp, cp) = self.phi.sin_cos();
        self.x0 += dx * cp - dy * sp;
        self.y0 += dx * sp + dy * cp;
    }

    fn axes(&self) -> [DVec3; 3] {
        orbit_axes(DVec3::X, DVec3::Y, DVec3::Z, self.theta, self.phi)
    }

    fn eye(&self) -> DVec3 {
        let target = DVec3::new(self.x0, self.y0, self.ground_height);
        let mut eye = target + self.axes()[2] * self.d * self.zoom;
        eye.z = eye.z.max(self.ground_height + 1.0);
        eye
    }
}

impl ViewController for TerrainViewController {
    fn view(&self) -> CameraView {
        let eye = self.eye();
        let h = (eye.z - self.ground_height).max(1.0);
        CameraView::perspective(
            view_matrix(self.axes(), eye),
            self.fov,
            self.viewport,
            0.1 * h,
            1e6 * h,
        )
    }

    fn set_ground_height(&mut self, height: f64) {
        self.ground_height = height;
    }

    fn position(&self) -> DVec3 {
        self.eye()
    }
}

/// Navigation around a spherical terrain of radius `radius`.
///
/// Longitude and latitude are measured from the center of the root face, so
/// `(0, 0)` is the point above the local origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanetViewController {
    pub radius: f64,
    pub longitude: f64,
    pub latitude: f64,
    pub theta: f64,
    pub phi: f64,
    pub d: f64,
    pub fov: f64,
    pub viewport: DVec2,
    pub ground_height: f64,
}

impl Default for PlanetViewController {
    fn default() -> Self {
        Self {
            radius: 6_360_000.0,
            longitude: 0.0,
            latitude: 0.0,
            theta: 0.0,
            phi: 0.0,
            d: 1e7,
            fov: 80f64.to_radians(),
            viewport: DVec2::new(1024.0, 768.0),
            ground_height: 0.0,
        }
    }
}

impl PlanetViewController {
    /// Create a new controller at distance `d` above the root face center.
    pub fn new(radius: f64, d: f64) -> Self {
        Self {
            radius,
            d,
            ..Self::default()
        }
    }

    /// Set the point looked at.
    pub const fn with_target(mut self, longitude: f64, latitude: f64) -> Self {
        self.longitude = longitude;
        self.latitude = latitude;
        self
    }

    /// Set the tilt and azimuth.
    pub const fn with_angles(mut self, theta: f64, phi: f64) -> Self {
        self.theta = theta;
        self.phi = phi;
        self
    }

    fn frame(&self) -> (DVec3, [DVec3; 3]) {
        let (so, co) = self.longitude.sin_cos();
        let (sa, ca) = self.latitude.sin_cos();
        let pz = DVec3::new(so * ca, sa, co * ca);
        let px = DVec3::new(co, 0.0, -so);
        let py = DVec3::new(-so * sa, ca, -co * sa);
        (pz * self.radius, orbit_axes(px, py, pz, self.theta, self.phi))
    }

    fn eye(&self) -> DVec3 {
        let (target, axes) = self.frame();
        let eye = target + axes[2] * self.d;
        let min = self.radius + 0.5 + self.ground_height;
        if eye.length() < min {
            eye.normalize_or(DVec3::Z) * min
        } else {
            eye
        }
    }
}

impl ViewController for PlanetViewController {
    fn view(&self) -> CameraView {
        let (_, axes) = self.frame();
        let eye = self.eye();
        let h = (eye.length() - self.radius - self.ground_height).max(0.5);
        CameraView::perspective(view_matrix(axes, eye), self.fov, self.viewport, 0.1 * h, 1e6 * h)
    }

    fn set_ground_height(&mut self, height: f64) {
        self.ground_height = height;
    }

    fn position(&self) -> DVec3 {
        self.eye()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn vertical_view_looks_down_at_the_target() {
        let controller = TerrainViewController::new(100.0, -50.0, 2000.0);
        let view = controller.view();
        let p = view.position();
        assert_relative_eq!(p.x, 100.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, -50.0, epsilon = 1e-6);
        assert_relative_eq!(p.z, 2000.0, epsilon = 1e-6);
        assert_relative_eq!(view.direction().z, -1.0, epsilon = 1e-9);
    }

    #[test]
    fn tilted_view_looks_along_y() {
        let controller = TerrainViewController::new(0.0, 0.0, 100.0)
            .with_angles(std::f64::consts::FRAC_PI_2, 0.0);
        let view = controller.view();
        assert_relative_eq!(view.direction().y, 1.0, epsilon = 1e-9);
        // Grazing views stay one unit above the ground.
        assert_relative_eq!(view.position().z, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn camera_stays_above_the_ground() {
        let mut controller = TerrainViewController::new(0.0, 0.0, 10.0);
        controller.set_ground_height(500.0);
        assert_relative_eq!(controller.position().z, 510.0, epsilon = 1e-9);
        controller.d = 0.0;
        assert_relative_eq!(controller.position().z, 501.0, epsilon = 1e-9);
    }

    #[test]
    fn planet_view_starts_above_the_root_face() {
        let controller = PlanetViewController::new(1000.0, 500.0);
        let p = controller.view().position();
        assert_relative_eq!(p.z, 1500.0, epsilon = 1e-6);
        assert_relative_eq!(controller.view().direction().z, -1.0, epsilon = 1e-9);

        let mut low = PlanetViewController::new(1000.0, 0.0);
        low.set_ground_height(10.0);
        assert_relative_eq!(low.position().length(), 1010.5, epsilon = 1e-9);
    }
}
