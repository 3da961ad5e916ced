//! The draw pass: front-to-back traversal of an updated quadtree.

use proland_core::TileCoord;

use crate::node::TerrainNode;
use crate::quad::TerrainQuad;
use crate::sampler::TileSampler;
use crate::uniforms::{QuadUniforms, TileUniforms};

/// One quad to draw with the uniforms of each sampler's tile.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadDraw {
    pub coord: TileCoord,
    pub uniforms: QuadUniforms,
    /// One entry per sampler, in sampler order; `None` when no ancestor tile
    /// is ready either.
    pub tiles: Vec<Option<TileUniforms>>,
}

/// Collects the draws of a terrain for a set of samplers.
pub struct DrawPass<'a> {
    samplers: Vec<&'a TileSampler>,
}

impl<'a> DrawPass<'a> {
    /// Create a new draw pass over `samplers`.
    pub fn new(samplers: impl IntoIterator<Item = &'a TileSampler>) -> Self {
        Self {
            samplers: samplers.into_iter().collect(),
        }
    }

    /// Returns true if some asynchronous sampler still waits for the tile of
    /// `coord`. Coordinates a producer has no tile for never block.
    fn missing_tile(&self, coord: TileCoord) -> bool {
        self.samplers.iter().any(|s| {
            s.is_async() && s.producer().has_tile(coord) && s.ready_tile(coord).is_none()
        })
    }

    /// Set the drawable flag of every quad of the subtree.
    ///
    /// Invisible quads are drawable. A leaf is drawable once every async
    /// sampler's tile is ready; a subdivided quad is drawable if all its
    /// children are, or if its own tiles are ready.
    pub fn mark_drawable(&self, quad: &mut TerrainQuad) {
        quad.drawable = false;
        if !quad.is_visible() {
            quad.drawable = true;
            return;
        }
        let coord = quad.coord;
        let all_children = match quad.children_mut() {
            None => false,
            Some(children) => {
                let mut drawable = 0;
                for child in children.iter_mut() {
                    self.mark_drawable(child);
                    drawable += usize::from(child.drawable);
                }
                drawable == 4
            }
        };
        quad.drawable = all_children || !self.missing_tile(coord);
    }

    /// Mark drawable quads and list the draws, nearest first.
    ///
    /// Subdivided quads are drawn through their children when all four are
    /// drawable, and as a whole otherwise.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn run(&self, terrain: &mut TerrainNode) -> Vec<QuadDraw> {
        self.mark_drawable(terrain.root_mut());
        let mut draws = Vec::new();
        self.collect(terrain, terrain.root(), &mut draws);
        tracing::trace!(draws = draws.len(), "Collected terrain draws");
        draws
    }

    fn collect(&self, terrain: &TerrainNode, quad: &TerrainQuad, draws: &mut Vec<QuadDraw>) {
        if !quad.is_visible() {
            return;
        }
        if let Some(children) = quad.children() {
            if children.iter().all(|c| c.drawable) {
                for i in quad.child_order(terrain.local_camera().truncate()) {
                    self.collect(terrain, &children[i], draws);
                }
                return;
            }
        }
        draws.push(QuadDraw {
            coord: quad.coord,
            uniforms: terrain.deformation().quad_uniforms(terrain.frame(), quad),
            tiles: self
                .samplers
                .iter()
                .map(|s| s.lookup(quad.coord).map(|l| l.uniforms))
                .collect(),
        });
    }
}
