//! Horizon occlusion culling.
//!
//! The horizon is a 1D buffer of [`HORIZON_SIZE`] azimuth bins holding the
//! highest elevation slope seen so far from the camera. Boxes are projected
//! into a frame centered on the camera whose `y` axis is the horizontal view
//! direction; `x / y` selects bins and `dz / y` is compared with, or raises,
//! the stored slopes. Occluders must be submitted front to back.

use glam::{DVec2, DVec3};
use proland_core::constants::HORIZON_SIZE;
use proland_core::Box3;

/// Horizontal field covered by the bins, as a `x / y` scale.
const BIN_SCALE: f64 = 0.33;

/// Horizon line for one frame.
#[derive(Debug, Clone)]
pub struct Horizon {
    enabled: bool,
    camera: DVec3,
    forward: DVec2,
    bins: Box<[f32; HORIZON_SIZE]>,
}

impl Default for Horizon {
    fn default() -> Self {
        Self {
            enabled: false,
            camera: DVec3::ZERO,
            forward: DVec2::Y,
            bins: Box::new([f32::NEG_INFINITY; HORIZON_SIZE]),
        }
    }
}

impl Horizon {
    /// Clear the horizon for a camera at `camera` looking along `forward`.
    ///
    /// A degenerate direction (looking straight up or down) disables culling.
    pub fn reset(&mut self, camera: DVec3, forward: DVec2) {
        self.bins.fill(f32::NEG_INFINITY);
        let forward = forward.normalize_or_zero();
        self.enabled = camera.is_finite() && forward != DVec2::ZERO;
        self.camera = camera;
        self.forward = forward;
    }

    /// Turn culling off until the next [`reset`](Self::reset).
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn bins(&self) -> &[f32; HORIZON_SIZE] {
        &self.bins
    }

    /// Bin range and `(zmin, zmax)` slopes of a box, or `None` if any of its
    /// corners is not strictly in front of the camera.
    fn project(&self, b: &Box3) -> Option<(f32, f32, f32, f32)> {
        let o = self.camera.truncate();
        let right = DVec2::new(self.forward.y, -self.forward.x);
        let mut xmin = f64::INFINITY;
        let mut xmax = f64::NEG_INFINITY;
        let mut zmin = f64::INFINITY;
        let mut zmax = f64::NEG_INFINITY;
        let dzmin = b.min.z - self.camera.z;
        let dzmax = b.max.z - self.camera.z;
        for corner in [
            DVec2::new(b.min.x, b.min.y),
            DVec2::new(b.min.x, b.max.y),
            DVec2::new(b.max.x, b.min.y),
            DVec2::new(b.max.x, b.max.y),
        ] {
            let d = corner - o;
            let y = d.dot(self.forward);
            if y <= 0.0 || y.is_nan() {
                return None;
            }
            let x = d.dot(right) / y;
            xmin = xmin.min(x);
            xmax = xmax.max(x);
            zmin = zmin.min(dzmin / y);
            zmax = zmax.max(dzmax / y);
        }
        Some((
            (xmin * BIN_SCALE + 0.5) as f32,
            (xmax * BIN_SCALE + 0.5) as f32,
            zmin as f32,
            zmax as f32,
        ))
    }

    /// Returns true if the box is entirely below the current horizon.
    ///
    /// A box whose projection falls outside every bin is reported visible:
    /// the horizon has no data there, and drawing an extra quad is safe.
    pub fn is_occluded(&self, b: &Box3) -> bool {
        if !self.enabled {
            return false;
        }
        let Some((xmin, xmax, _, zmax)) = self.project(b) else {
            return false;
        };
        let (imin, imax) = bin_range(xmin, xmax, true);
        imin <= imax && self.bins[imin..=imax].iter().all(|&h| zmax <= h)
    }

    /// Test a box against the horizon and, if it is visible, raise the
    /// horizon with it. Returns true if the box is occluded.
    ///
    /// Boxes outside every bin are visible, as in [`is_occluded`](Self::is_occluded).
    pub fn add_occluder(&mut self, b: &Box3) -> bool {
        if !self.enabled {
            return false;
        }
        let Some((xmin, xmax, zmin, zmax)) = self.project(b) else {
            return false;
        };
        let (imin, imax) = bin_range(xmin, xmax, true);
        let occluded = imin <= imax && self.bins[imin..=imax].iter().all(|&h| zmax <= h);
        if !occluded {
            // Only bins fully covered by the box are raised.
            let (imin, imax) = bin_range(xmin, xmax, false);
            if imin <= imax {
                for h in &mut self.bins[imin..=imax] {
                    *h = h.max(zmin);
                }
            }
        }
        occluded
    }
}

/// Bins touched by (`outer`) or fully inside a `[min, max]` range of
/// horizon units, clamped to the buffer. Empty ranges have `imin > imax`.
fn bin_range(min: f32, max: f32, outer: bool) -> (usize, usize) {
    let n = HORIZON_SIZE as f32;
    let (min, max) = if outer {
        ((min * n).floor(), (max * n).ceil())
    } else {
        ((min * n).ceil(), (max * n).floor())
    };
    let max = max.min(n - 1.0);
    if !(max >= 0.0) {
        return (1, 0);
    }
    (min.max(0.0) as usize, max as usize)
}
