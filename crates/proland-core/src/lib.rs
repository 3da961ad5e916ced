//! Core types, coordinates, and math for the Proland tile pipeline.
//!
//! This crate provides the foundational types used throughout the pipeline:
//! - Tile coordinates in the terrain quadtree
//! - Double precision boxes, frustum planes and visibility classes
//! - The pipeline-wide error type

pub mod coords;
pub mod error;
pub mod math;

pub use coords::TileCoord;
pub use error::{Error, Result};
pub use math::{Box2, Box3, Frustum, Visibility};

/// Pipeline-wide constants
pub mod constants {
    /// Deepest quadtree level a tile coordinate may address.
    pub const MAX_LEVEL: u32 = 30;
    /// Number of border samples on each side of an elevation or residual tile.
    pub const ELEVATION_BORDER: u32 = 2;
    /// Extra samples in each dimension of a residual tile (`tileSize + 5`).
    pub const RESIDUAL_EXTRA_SAMPLES: u32 = 5;
    /// Number of azimuth bins in the horizon occlusion buffer.
    pub const HORIZON_SIZE: usize = 256;
    /// Smallest split distance the quadtree accepts.
    pub const MIN_SPLIT_DISTANCE: f64 = 1.1;
}
