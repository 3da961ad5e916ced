//! Terrain quadtree and its binding to tile producers.
//!
//! A [`TerrainNode`] holds a quadtree of [`TerrainQuad`]s in local (planar)
//! space, embedded in the rendered frame by a [`Deformation`]. Every frame:
//!
//! 1. a [`ViewController`] yields a [`CameraView`];
//! 2. [`TerrainNode::update`] refines the quadtree for that view, culling
//!    against the frustum and the [`Horizon`];
//! 3. each [`TileSampler`] acquires the tiles of the new quads and returns
//!    the task graph to schedule;
//! 4. [`TileSamplerZ::read_back`] copies elevation ranges into the quads;
//! 5. a [`DrawPass`] walks the quadtree front to back and emits per-quad
//!    uniforms;
//! 6. [`TileSampler::end_frame`] releases the tiles no longer needed.

pub mod camera;
pub mod deformation;
pub mod draw;
pub mod horizon;
pub mod node;
pub mod quad;
pub mod sampler;
pub mod uniforms;
pub mod view;

pub use camera::{CameraUniforms, CameraView};
pub use deformation::Deformation;
pub use draw::{DrawPass, QuadDraw};
pub use horizon::Horizon;
pub use node::{CameraFrame, TerrainNode, TerrainNodeConfig};
pub use quad::TerrainQuad;
pub use sampler::{TileLookup, TileMap, TileSampler, TileSamplerConfig, TileSamplerZ};
pub use uniforms::{QuadUniforms, TileUniforms};
pub use view::{PlanetViewController, TerrainViewController, ViewController};
