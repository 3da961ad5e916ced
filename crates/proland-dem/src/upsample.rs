//! The separable 4-tap upsampling kernel.
//!
//! A tile of size `s` stores `s + 5` samples per row at grid positions
//! `j ∈ [-2, s + 2]`. Child position `j` falls on parent position
//! `off + j / 2`: even positions copy the parent sample, odd positions
//! interpolate the four nearest parent samples with
//! `{-1/16, 9/16, 9/16, -1/16}`.

use proland_core::{Error, Result, TileCoord};

/// Interpolation weights for odd child positions.
pub const KERNEL: [f32; 4] = [-1.0 / 16.0, 9.0 / 16.0, 9.0 / 16.0, -1.0 / 16.0];

/// Border samples on each side of a tile.
const BORDER: i64 = 2;

/// Parent grid positions and weights contributing to child position `j`.
///
/// Positions are relative to the parent sample under child position 0.
pub fn parent_taps(j: i64) -> impl Iterator<Item = (i64, f32)> {
    let (first, weights): (i64, &'static [f32]) = if j.rem_euclid(2) == 0 {
        (j / 2, &[1.0])
    } else {
        ((j - 1).div_euclid(2) - 1, &KERNEL)
    };
    weights
        .iter()
        .enumerate()
        .map(move |(k, &w)| (first + k as i64, w))
}

/// Offset in parent samples of the quarter a child tile covers.
pub const fn child_offset(coord: TileCoord, tile_size: u32) -> (u32, u32) {
    let half = tile_size / 2;
    ((coord.tx % 2) * half, (coord.ty % 2) * half)
}

/// Tap indices into a parent row for every child sample of one axis.
fn axis_taps(child_samples: usize, offset: u32, parent_samples: usize) -> Result<Vec<Vec<(usize, f32)>>> {
    (0..child_samples as i64)
        .map(|i| {
            parent_taps(i - BORDER)
                .map(|(p, w)| {
                    let index = p + i64::from(offset) + BORDER;
                    usize::try_from(index)
                        .ok()
                        .filter(|&index| index < parent_samples)
                        .map(|index| (index, w))
                        .ok_or_else(|| {
                            Error::OutOfBounds(format!(
                                "upsampling needs parent sample {index} of {parent_samples}"
                            ))
                        })
                })
                .collect()
        })
        .collect()
}

/// Upsample part of a parent tile into a child tile.
///
/// `parent` is `parent_samples²` values and `child` is `child_samples²`
/// values, both row-major. `offset` is the parent position under child
/// position 0 along x and y: [`child_offset`] for a quadtree child of the
/// same tile size, `(0, 0)` for a child at twice the parent resolution.
pub fn upsample(
    parent: &[f32],
    parent_samples: usize,
    offset: (u32, u32),
    child: &mut [f32],
    child_samples: usize,
) -> Result<()> {
    if parent.len() != parent_samples * parent_samples || child.len() != child_samples * child_samples {
        return Err(Error::InvalidData(format!(
            "upsampling {} samples into {}, expected {parent_samples}² and {child_samples}²",
            parent.len(),
            child.len()
        )));
    }
    let x_taps = axis_taps(child_samples, offset.0, parent_samples)?;
    let y_taps = axis_taps(child_samples, offset.1, parent_samples)?;

    // Horizontal pass over every parent row, then vertical.
    let mut rows = vec![0.0f32; parent_samples * child_samples];
    for (parent_row, row) in parent
        .chunks_exact(parent_samples)
        .zip(rows.chunks_exact_mut(child_samples))
    {
        for (out, taps) in row.iter_mut().zip(&x_taps) {
            *out = taps.iter().map(|&(p, w)| w * parent_row[p]).sum();
        }
    }
    for (child_row, taps) in child.chunks_exact_mut(child_samples).zip(&y_taps) {
        child_row.fill(0.0);
        for &(p, w) in taps {
            let row = &rows[p * child_samples..(p + 1) * child_samples];
            for (out, &v) in child_row.iter_mut().zip(row) {
                *out += w * v;
            }
        }
    }
    Ok(())
}
