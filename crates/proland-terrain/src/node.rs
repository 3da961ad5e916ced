//! The terrain node: a deformed quadtree kept in sync with the camera.

use glam::{DMat4, DVec2, DVec3, DVec4};
use proland_core::constants::MIN_SPLIT_DISTANCE;
use proland_core::{Box3, Frustum, Visibility};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::camera::CameraView;
use crate::deformation::Deformation;
use crate::horizon::Horizon;
use crate::quad::TerrainQuad;

/// Per-frame camera state derived by [`TerrainNode::update`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraFrame {
    /// Deformed frame to camera space.
    pub local_to_camera: DMat4,
    /// Deformed frame to clip space.
    pub local_to_screen: DMat4,
    /// Camera position in the deformed frame.
    pub deformed_camera: DVec3,
    /// Camera position in local (undeformed) space.
    pub local_camera: DVec3,
    /// Clip planes in the deformed frame.
    pub frustum: Frustum,
    pub viewport: DVec2,
    /// Horizontal field of view in radians.
    pub fov: f64,
    /// Quads closer than `l * split_dist` are subdivided.
    pub split_dist: f64,
    /// Vertical stretch of the deformation at the camera.
    pub dist_factor: f64,
    /// Terrain height below the camera.
    pub ground_height: f64,
}

impl Default for CameraFrame {
    fn default() -> Self {
        Self {
            local_to_camera: DMat4::IDENTITY,
            local_to_screen: DMat4::IDENTITY,
            deformed_camera: DVec3::ZERO,
            local_camera: DVec3::ZERO,
            frustum: Frustum {
                planes: [DVec4::W; 6],
            },
            viewport: DVec2::new(1024.0, 1024.0),
            fov: 80f64.to_radians(),
            split_dist: MIN_SPLIT_DISTANCE,
            dist_factor: 1.0,
            ground_height: 0.0,
        }
    }
}

impl CameraFrame {
    /// Returns false if the camera position could not be resolved.
    pub fn is_finite(&self) -> bool {
        self.deformed_camera.is_finite() && self.local_camera.is_finite()
    }
}

/// Terrain node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainNodeConfig {
    /// Half side length of the root quad.
    pub size: f64,
    /// Initial elevation range of the root quad.
    pub zmin: f64,
    pub zmax: f64,
    /// Scales the distance at which quads subdivide.
    pub split_factor: f64,
    pub max_level: u32,
    /// Subdivide quads outside the view frustum too.
    pub split_invisible_quads: bool,
    pub horizon_culling: bool,
    pub deformation: Deformation,
}

impl Default for TerrainNodeConfig {
    fn default() -> Self {
        Self {
            size: 50_000.0,
            zmin: 0.0,
            zmax: 0.0,
            split_factor: 2.0,
            max_level: 16,
            split_invisible_quads: false,
            horizon_culling: true,
            deformation: Deformation::Identity,
        }
    }
}

impl TerrainNodeConfig {
    /// Set the root half size.
    pub const fn with_size(mut self, size: f64) -> Self {
        self.size = size;
        self
    }

    /// Set the initial elevation range.
    pub const fn with_z_range(mut self, zmin: f64, zmax: f64) -> Self {
        self.zmin = zmin;
        self.zmax = zmax;
        self
    }

    /// Set the split factor.
    pub const fn with_split_factor(mut self, split_factor: f64) -> Self {
        self.split_factor = split_factor;
        self
    }

    /// Set the deepest quadtree level.
    pub const fn with_max_level(mut self, max_level: u32) -> Self {
        self.max_level = max_level;
        self
    }

    /// Set whether invisible quads are subdivided.
    pub const fn with_split_invisible_quads(mut self, split: bool) -> Self {
        self.split_invisible_quads = split;
        self
    }

    /// Enable or disable horizon culling.
    pub const fn with_horizon_culling(mut self, enabled: bool) -> Self {
        self.horizon_culling = enabled;
        self
    }

    /// Set the deformation.
    pub const fn with_deformation(mut self, deformation: Deformation) -> Self {
        self.deformation = deformation;
        self
    }
}

/// A terrain quadtree and the camera state it was last updated with.
#[derive(Debug, Clone)]
pub struct TerrainNode {
    config: TerrainNodeConfig,
    root: TerrainQuad,
    frame: CameraFrame,
    horizon: Horizon,
}

impl TerrainNode {
    /// Create a new terrain with a single root quad.
    pub fn new(config: TerrainNodeConfig) -> Self {
        let root = TerrainQuad::root(config.size, config.zmin, config.zmax);
        Self {
            config,
            root,
            frame: CameraFrame::default(),
            horizon: Horizon::default(),
        }
    }

    pub const fn config(&self) -> &TerrainNodeConfig {
        &self.config
    }

    pub const fn deformation(&self) -> &Deformation {
        &self.config.deformation
    }

    pub const fn root(&self) -> &TerrainQuad {
        &self.root
    }

    /// Mutable root, used to refine elevation ranges between updates.
    pub fn root_mut(&mut self) -> &mut TerrainQuad {
        &mut self.root
    }

    /// Camera state of the last update.
    pub const fn frame(&self) -> &CameraFrame {
        &self.frame
    }

    pub const fn horizon(&self) -> &Horizon {
        &self.horizon
    }

    pub const fn split_distance(&self) -> f64 {
        self.frame.split_dist
    }

    pub const fn dist_factor(&self) -> f64 {
        self.frame.dist_factor
    }

    pub const fn local_camera(&self) -> DVec3 {
        self.frame.local_camera
    }

    pub const fn ground_height(&self) -> f64 {
        self.frame.ground_height
    }

    /// Set the terrain height below the camera, used by the next update.
    pub fn set_ground_height(&mut self, height: f64) {
        if height.is_finite() {
            self.frame.ground_height = height;
        }
    }

    /// Camera distance to a local box: the largest of the vertical distance
    /// to its top (scaled by the distance factor) and the horizontal axis
    /// distances to its nearest sides.
    pub fn camera_dist(&self, b: &Box3) -> f64 {
        camera_dist(&self.frame, b)
    }

    /// Visibility of a local box in the current frame.
    pub fn visibility(&self, b: &Box3) -> Visibility {
        self.config.deformation.visibility(&self.frame, b)
    }

    /// Update the camera state and the quadtree for a new view.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn update(&mut self, view: &CameraView) {
        let deformation = self.config.deformation;
        let deformed_camera = view.position();
        let local_camera = deformation.deformed_to_local(deformed_camera);
        let frustum = view.frustum();

        let m = deformation.local_to_deformed_differential(local_camera, true);
        let dist_factor = m
            .col(0)
            .truncate()
            .length()
            .max(m.col(1).truncate().length());

        let left = frustum.planes[0].truncate().normalize();
        let right = frustum.planes[1].truncate().normalize();
        let fov = (-left.dot(right)).clamp(-1.0, 1.0).acos();
        let mut split_dist = self.config.split_factor * view.viewport.x / 1024.0 * 40f64.to_radians().tan()
            / (fov / 2.0).tan();
        if !split_dist.is_finite() || split_dist < MIN_SPLIT_DISTANCE {
            split_dist = MIN_SPLIT_DISTANCE;
        }

        self.frame = CameraFrame {
            local_to_camera: view.local_to_camera,
            local_to_screen: view.local_to_screen(),
            deformed_camera,
            local_camera,
            frustum,
            viewport: view.viewport,
            fov,
            split_dist,
            dist_factor: if dist_factor.is_finite() && dist_factor > 0.0 { dist_factor } else { 1.0 },
            ground_height: self.frame.ground_height,
        };

        if self.config.horizon_culling && local_camera.z <= self.root.zmax {
            let ahead = deformation.deformed_to_local(deformed_camera + view.direction());
            self.horizon.reset(local_camera, (ahead - local_camera).truncate());
        } else {
            self.horizon.disable();
        }

        let mut pass = UpdatePass {
            frame: &self.frame,
            config: &self.config,
            horizon: &mut self.horizon,
        };
        pass.update(&mut self.root, Visibility::Partially);

        trace!(
            quads = self.root.count(),
            depth = self.root.depth(),
            split_dist,
            "Terrain updated"
        );
    }
}

fn camera_dist(frame: &CameraFrame, b: &Box3) -> f64 {
    let c = frame.local_camera;
    let dz = (c.z - b.max.z).abs() / frame.dist_factor;
    let dx = (c.x - b.min.x).abs().min((c.x - b.max.x).abs());
    let dy = (c.y - b.min.y).abs().min((c.y - b.max.y).abs());
    dz.max(dx.max(dy))
}

/// Borrowed state of one recursive quadtree update.
struct UpdatePass<'a> {
    frame: &'a CameraFrame,
    config: &'a TerrainNodeConfig,
    horizon: &'a mut Horizon,
}

impl UpdatePass<'_> {
    fn update(&mut self, quad: &mut TerrainQuad, parent: Visibility) {
        let local_box = quad.local_box();
        quad.visible = match parent {
            Visibility::Partially => self.config.deformation.visibility(self.frame, &local_box),
            inherited => inherited,
        };

        // A quad occluded last frame is tested again; one that was not is
        // assumed to still be unoccluded.
        if quad.visible.is_visible() && quad.occluded {
            quad.occluded = self.horizon.is_occluded(&local_box);
            if quad.occluded {
                quad.visible = Visibility::Invisible;
            }
        }

        let ground = self.frame.ground_height;
        let dist = camera_dist(
            self.frame,
            &Box3::from_footprint(quad.ox, quad.oy, quad.l, ground.min(0.0), ground.max(0.0)),
        );

        let split = (self.config.split_invisible_quads || quad.visible.is_visible())
            && dist < quad.l * self.frame.split_dist
            && quad.level() < self.config.max_level;

        if split {
            quad.subdivide();
            let order = quad.child_order(self.frame.local_camera.truncate());
            let visible = quad.visible;
            if let Some(children) = quad.children_mut() {
                for i in order {
                    self.update(&mut children[i], visible);
                }
                quad.occluded = children.iter().all(|c| c.occluded);
            }
        } else {
            if quad.visible.is_visible() {
                quad.occluded = self.horizon.add_occluder(&local_box);
                if quad.occluded {
                    quad.visible = Visibility::Invisible;
                }
            }
            quad.collapse();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn looking_down(height: f64) -> CameraView {
        CameraView::look_at(
            DVec3::new(0.0, 0.0, height),
            DVec3::ZERO,
            DVec3::Y,
            80f64.to_radians(),
            DVec2::new(1024.0, 1024.0),
            0.1,
            1e6,
        )
    }

    #[test]
    fn split_distance_follows_viewport_and_fov() {
        let mut node = TerrainNode::new(TerrainNodeConfig::default());
        node.update(&looking_down(1000.0));
        assert_relative_eq!(node.frame().fov, 80f64.to_radians(), epsilon = 1e-9);
        assert_relative_eq!(node.split_distance(), 2.0, epsilon = 1e-9);
        assert_relative_eq!(node.dist_factor(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn small_split_distance_is_clamped() {
        let config = TerrainNodeConfig::default().with_split_factor(0.1);
        let mut node = TerrainNode::new(config);
        node.update(&looking_down(1000.0));
        assert_relative_eq!(node.split_distance(), MIN_SPLIT_DISTANCE);
    }

    #[test]
    fn levels_never_exceed_max_level() {
        let config = TerrainNodeConfig::default().with_size(1000.0).with_max_level(4);
        let mut node = TerrainNode::new(config);
        node.update(&looking_down(1.0));
        assert_eq!(node.root().depth(), 4);
    }

    #[test]
    fn distant_camera_collapses_the_tree() {
        let config = TerrainNodeConfig::default().with_size(1000.0).with_max_level(6);
        let mut node = TerrainNode::new(config);
        node.update(&looking_down(10.0));
        assert!(node.root().count() > 1);
        node.update(&looking_down(1e5));
        assert!(node.root().is_leaf());
    }

    #[test]
    fn non_finite_camera_is_harmless() {
        let mut node = TerrainNode::new(TerrainNodeConfig::default());
        node.update(&looking_down(100.0));
        let broken = CameraView::new(DMat4::from_cols_array(&[f64::NAN; 16]), DMat4::IDENTITY, DVec2::new(1024.0, 1024.0));
        node.update(&broken);
        assert_relative_eq!(node.split_distance(), MIN_SPLIT_DISTANCE);
        node.root().visit(&mut |q| assert_eq!(q.visible, Visibility::Partially));
    }

    #[test]
    fn quads_behind_the_camera_are_invisible() {
        let config = TerrainNodeConfig::default().with_size(1000.0).with_max_level(3);
        let mut node = TerrainNode::new(config);
        let view = CameraView::look_at(
            DVec3::new(0.0, 0.0, 50.0),
            DVec3::new(0.0, 100.0, 0.0),
            DVec3::Z,
            60f64.to_radians(),
            DVec2::new(1024.0, 1024.0),
            1.0,
            1e5,
        );
        node.update(&view);
        let behind = node.root().find(proland_core::TileCoord::new(1, 0, 0)).map(|q| q.visible);
        assert_eq!(behind, Some(Visibility::Invisible));
    }
}
