//! Camera views of a terrain.

use glam::{DMat4, DVec2, DVec3};
use proland_core::Frustum;

/// Camera placement relative to a terrain's deformed frame.
///
/// The terrain node works in its own (deformed) frame; `local_to_camera`
/// maps that frame to camera space and `camera_to_screen` is an OpenGL-style
/// projection with clip depth in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraView {
    pub local_to_camera: DMat4,
    pub camera_to_screen: DMat4,
    /// Viewport size in pixels.
    pub viewport: DVec2,
}

impl Default for CameraView {
    fn default() -> Self {
        Self::look_at(
            DVec3::new(0.0, 0.0, 5.0),
            DVec3::ZERO,
            DVec3::Y,
            80f64.to_radians(),
            DVec2::new(1024.0, 768.0),
            0.1,
            1000.0,
        )
    }
}

impl CameraView {
    /// Create a new view from explicit matrices.
    pub const fn new(local_to_camera: DMat4, camera_to_screen: DMat4, viewport: DVec2) -> Self {
        Self {
            local_to_camera,
            camera_to_screen,
            viewport,
        }
    }

    /// Perspective view with a horizontal field of view in radians.
    pub fn perspective(local_to_camera: DMat4, fov_x: f64, viewport: DVec2, near: f64, far: f64) -> Self {
        Self::new(
            local_to_camera,
            perspective(fov_x, viewport, near, far),
            viewport,
        )
    }

    /// Perspective view of `target` from `eye`.
    pub fn look_at(
        eye: DVec3,
        target: DVec3,
        up: DVec3,
        fov_x: f64,
        viewport: DVec2,
        near: f64,
        far: f64,
    ) -> Self {
        Self::perspective(DMat4::look_at_rh(eye, target, up), fov_x, viewport, near, far)
    }

    pub fn local_to_screen(&self) -> DMat4 {
        self.camera_to_screen * self.local_to_camera
    }

    pub fn camera_to_local(&self) -> DMat4 {
        self.local_to_camera.inverse()
    }

    /// Camera position in the terrain's deformed frame.
    pub fn position(&self) -> DVec3 {
        self.camera_to_local().transform_point3(DVec3::ZERO)
    }

    /// Viewing direction in the terrain's deformed frame.
    pub fn direction(&self) -> DVec3 {
        self.camera_to_local()
            .transform_vector3(DVec3::NEG_Z)
            .normalize_or_zero()
    }

    /// Clip planes in the terrain's deformed frame.
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.local_to_screen())
    }

    /// Camera uniforms for GPU.
    pub fn uniforms(&self) -> CameraUniforms {
        CameraUniforms::from(self)
    }
}

/// OpenGL perspective projection from a horizontal field of view.
pub fn perspective(fov_x: f64, viewport: DVec2, near: f64, far: f64) -> DMat4 {
    let aspect = viewport.x / viewport.y;
    let fov_y = 2.0 * ((fov_x / 2.0).tan() / aspect).atan();
    DMat4::perspective_rh_gl(fov_y, aspect, near, far)
}

/// Camera uniform buffer data for GPU.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniforms {
    pub local_to_camera: [[f32; 4]; 4],
    pub camera_to_screen: [[f32; 4]; 4],
    pub local_to_screen: [[f32; 4]; 4],
    pub position: [f32; 4],
    pub direction: [f32; 4],
    pub viewport: [f32; 4],
}

impl From<&CameraView> for CameraUniforms {
    fn from(view: &CameraView) -> Self {
        let position = view.position().as_vec3();
        let direction = view.direction().as_vec3();
        Self {
            local_to_camera: to_f32(view.local_to_camera),
            camera_to_screen: to_f32(view.camera_to_screen),
            local_to_screen: to_f32(view.local_to_screen()),
            position: [position.x, position.y, position.z, 1.0],
            direction: [direction.x, direction.y, direction.z, 0.0],
            viewport: [view.viewport.x as f32, view.viewport.y as f32, 0.0, 0.0],
        }
    }
}

/// Convert a double precision matrix for upload.
pub(crate) fn to_f32(m: DMat4) -> [[f32; 4]; 4] {
    m.as_mat4().to_cols_array_2d()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn position_and_direction_come_from_the_view_matrix() {
        let view = CameraView::look_at(
            DVec3::new(10.0, -4.0, 250.0),
            DVec3::new(10.0, 6.0, 0.0),
            DVec3::Z,
            1.0,
            DVec2::new(800.0, 600.0),
            1.0,
            1e5,
        );
        let p = view.position();
        assert_relative_eq!(p.x, 10.0, epsilon = 1e-9);
        assert_relative_eq!(p.y, -4.0, epsilon = 1e-9);
        assert_relative_eq!(p.z, 250.0, epsilon = 1e-9);
        let d = view.direction();
        let expected = DVec3::new(0.0, 10.0, -250.0).normalize();
        assert_relative_eq!(d.dot(expected), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn horizontal_fov_spans_the_viewport_width() {
        let view = CameraView::perspective(
            DMat4::IDENTITY,
            80f64.to_radians(),
            DVec2::new(1600.0, 900.0),
            0.1,
            100.0,
        );
        let frustum = view.frustum();
        let left = frustum.planes[0].truncate();
        let right = frustum.planes[1].truncate();
        let fov = (-left.dot(right)).acos();
        assert_relative_eq!(fov, 80f64.to_radians(), epsilon = 1e-9);
    }

    #[test]
    fn uniforms_match_view() {
        let view = CameraView::default();
        let uniforms = view.uniforms();
        assert_relative_eq!(uniforms.position[2], 5.0, epsilon = 1e-5);
        assert_eq!(uniforms.viewport[0], 1024.0);
    }
}
