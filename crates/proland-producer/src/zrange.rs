//! Elevation range readback for producers whose tiles are height fields.

use crate::tile::Tile;

/// Reads elevation extrema and heights out of ready tiles.
///
/// The terrain copies these ranges into its quads so that culling and
/// camera distances use real bounds instead of the flat `[0, 0]` default.
pub trait ZRangeReader: Send + Sync {
    /// Minimum and maximum elevation of a ready tile, borders excluded.
    fn z_range(&self, tile: &Tile) -> Option<(f32, f32)>;

    /// Elevation at `(u, v) ∈ [0, 1]²` inside a ready tile, bilinearly filtered.
    fn height_at(&self, tile: &Tile, u: f64, v: f64) -> Option<f32>;
}
