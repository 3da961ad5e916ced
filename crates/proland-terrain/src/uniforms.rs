//! Per-quad uniform data for terrain draws.

/// Uniforms of one drawn terrain quad.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct QuadUniforms {
    /// `(ox, oy, l, level)`.
    pub offset: [f32; 4],
    /// Camera relative to the quad: `((x - ox) / l, (y - oy) / l,
    /// (z - ground) / (l * distFactor), z)` in local coordinates.
    pub camera: [f32; 4],
    /// Morphing range `(splitDist + 1, splitDist - 1)`.
    pub blending: [f32; 4],
    pub local_to_screen: [[f32; 4]; 4],
    /// Screen position of the four deformed corners, one per column.
    pub screen_quad_corners: [[f32; 4]; 4],
    /// Screen direction of the vertical at each corner, one per column.
    pub screen_quad_verticals: [[f32; 4]; 4],
    /// Distance scale at each corner (`1` without curvature).
    pub screen_quad_corner_norms: [f32; 4],
    /// Tangent frame at the quad center, axes as columns.
    pub tangent_frame_to_world: [[f32; 4]; 4],
}

/// Where a quad finds its tile inside a sampler's array texture.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TileUniforms {
    /// `(u, v, layer, 0)` of the quad's lower corner.
    pub coords: [f32; 4],
    /// `(du, dv, 0, 0)` spanned by the quad.
    pub size: [f32; 4],
}
