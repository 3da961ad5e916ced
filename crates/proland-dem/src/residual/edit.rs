//! Editable residual overlay.
//!
//! Elevation edits are deposited as delta tiles. [`ResidualEditor::update_residuals`]
//! turns them into new residual tiles so that, after the elevation producer
//! re-creates its tiles, every edited tile reads its old elevation plus the
//! deposited delta. Edited residuals live in memory until
//! [`reset`](ResidualEditor::reset); [`save`](ResidualEditor::save) writes them
//! into a new residual file.
//!
//! With `D_k` the elevation delta at level `k` and `U` the upsampling kernel:
//! - `D_{k-1}(g) = D_k(2g)` aggregates deltas into ancestors,
//! - `r'_k = r_k + D_k - U(D_{k-1})` and `r'_0 = r_0 + D_0`,
//!
//! so `z'_k = U(z'_{k-1}) + r'_k = z_k + D_k`.

use std::collections::BTreeMap;
use std::path::Path;

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use proland_core::{Error, Result, TileCoord};
use proland_producer::Producer;

use super::producer::ResidualProducer;
use super::writer::ResidualWriter;
use crate::upsample::parent_taps;

/// Sparse elevation deltas of one level, keyed by global sample position.
type LevelDelta = HashMap<(i64, i64), f32>;

/// Tiles touched by one [`ResidualEditor::update_residuals`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditReport {
    /// Tiles whose elevation changed, edited tiles and their ancestors.
    pub edited: Vec<TileCoord>,
    /// Residual tiles rewritten, each edited tile's 3x3 neighborhood.
    pub residuals: Vec<TileCoord>,
}

/// Deposits elevation edits and folds them into a residual producer.
pub struct ResidualEditor {
    residuals: Producer,
    elevation: RwLock<Option<Producer>>,
    pending: Mutex<BTreeMap<u32, LevelDelta>>,
}

impl ResidualEditor {
    /// Create a new editor over a [`ResidualProducer`] rooted at the quadtree root.
    pub fn new(residuals: Producer) -> Result<Self> {
        let Some(producer) = residuals.downcast_ref::<ResidualProducer>() else {
            return Err(Error::InvalidData(format!(
                "{} is not a residual producer",
                residuals.name()
            )));
        };
        if producer.root() != TileCoord::ROOT {
            return Err(Error::InvalidData(format!(
                "edits need a residual pyramid rooted at the quadtree root, not {}",
                producer.root()
            )));
        }
        Ok(Self {
            residuals,
            elevation: RwLock::new(None),
            pending: Mutex::new(BTreeMap::new()),
        })
    }

    /// Invalidate `elevation` whenever residuals change.
    pub fn attach_elevation(&self, elevation: Producer) {
        *self.elevation.write() = Some(elevation);
    }

    pub const fn residuals(&self) -> &Producer {
        &self.residuals
    }

    fn producer(&self) -> Result<&ResidualProducer> {
        self.residuals
            .downcast_ref::<ResidualProducer>()
            .ok_or_else(|| Error::InvalidData("residual producer type changed".into()))
    }

    /// Whether deposits are waiting for [`update_residuals`](Self::update_residuals).
    pub fn has_pending(&self) -> bool {
        self.pending.lock().values().any(|level| !level.is_empty())
    }

    /// Add a full-resolution delta to elevation tile `coord`.
    ///
    /// `delta` holds `(tileSize + 5)²` samples laid out like the tile, borders
    /// included. Deposits on the same samples add up.
    pub fn deposit(&self, coord: TileCoord, delta: &[f32]) -> Result<()> {
        let producer = self.producer()?;
        if !producer.covers(coord) {
            return Err(Error::OutOfBounds(format!(
                "edit of {coord} outside the residual pyramid"
            )));
        }
        let n = producer.samples() as usize;
        if delta.len() != n * n {
            return Err(Error::InvalidData(format!(
                "{} delta samples for a {n}x{n} tile",
                delta.len()
            )));
        }
        let s = i64::from(producer.header().tile_size);
        let (x0, y0) = (i64::from(coord.tx) * s - 2, i64::from(coord.ty) * s - 2);
        let mut pending = self.pending.lock();
        let level = pending.entry(coord.level).or_default();
        for (j, row) in delta.chunks_exact(n).enumerate() {
            for (i, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    *level.entry((x0 + i as i64, y0 + j as i64)).or_insert(0.0) += v;
                }
            }
        }
        tracing::debug!(%coord, "Deposited elevation edit");
        Ok(())
    }

    /// Raise the samples `[x, x + width) × [y, y + height)` of tile `coord` by `dz`.
    ///
    /// Sample indices include the border, so `(2, 2)` is the tile's corner.
    pub fn edit_region(
        &self,
        coord: TileCoord,
        (x, y): (u32, u32),
        (width, height): (u32, u32),
        dz: f32,
    ) -> Result<()> {
        let n = self.producer()?.samples();
        if x + width > n || y + height > n {
            return Err(Error::OutOfBounds(format!(
                "region {width}x{height} at ({x}, {y}) outside a {n}x{n} tile"
            )));
        }
        let n = n as usize;
        let mut delta = vec![0.0; n * n];
        for j in y as usize..(y + height) as usize {
            delta[j * n + x as usize..j * n + (x + width) as usize].fill(dz);
        }
        self.deposit(coord, &delta)
    }

    /// Turn pending deposits into edited residual tiles.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn update_residuals(&self) -> Result<EditReport> {
        let mut deltas = std::mem::take(&mut *self.pending.lock());
        deltas.retain(|_, level| !level.is_empty());
        let Some(&finest) = deltas.keys().next_back() else {
            return Ok(EditReport::default());
        };
        let producer = self.producer()?;
        let s = i64::from(producer.header().tile_size);
        let n = producer.samples() as usize;

        for level in (1..=finest).rev() {
            let coarse: Vec<_> = deltas
                .get(&level)
                .into_iter()
                .flatten()
                .filter(|((gx, gy), _)| gx.rem_euclid(2) == 0 && gy.rem_euclid(2) == 0)
                .map(|(&(gx, gy), &v)| ((gx / 2, gy / 2), v))
                .collect();
            let parent = deltas.entry(level - 1).or_default();
            for (position, v) in coarse {
                *parent.entry(position).or_insert(0.0) += v;
            }
        }

        let empty = LevelDelta::new();
        let mut report = EditReport::default();
        for level in 0..=finest {
            let own = deltas.get(&level).unwrap_or(&empty);
            let parent = level
                .checked_sub(1)
                .and_then(|l| deltas.get(&l))
                .unwrap_or(&empty);

            let edited = owner_tiles(own.keys().copied(), level, s);
            let mut support = edited.clone();
            support.extend(owner_tiles(
                parent.keys().flat_map(|&(px, py)| {
                    (-3..=3).flat_map(move |dy| (-3..=3).map(move |dx| (2 * px + dx, 2 * py + dy)))
                }),
                level,
                s,
            ));
            let mut tiles: Vec<TileCoord> = support
                .iter()
                .flat_map(|coord| coord.neighborhood())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            tiles.sort_unstable_by_key(|c| (c.ty, c.tx));

            for coord in tiles {
                let (x0, y0) = (i64::from(coord.tx) * s - 2, i64::from(coord.ty) * s - 2);
                let mut changed = false;
                let mut residual_delta = vec![0.0f32; n * n];
                for (j, row) in residual_delta.chunks_exact_mut(n).enumerate() {
                    for (i, out) in row.iter_mut().enumerate() {
                        let g = (x0 + i as i64, y0 + j as i64);
                        let v = own.get(&g).copied().unwrap_or(0.0) - upsampled(parent, g);
                        if v != 0.0 {
                            *out = v;
                            changed = true;
                        }
                    }
                }
                if !changed {
                    continue;
                }
                let mut values = producer.read_tile(coord)?;
                for (v, d) in values.iter_mut().zip(&residual_delta) {
                    *v += d;
                }
                producer.set_override(coord, values)?;
                report.residuals.push(coord);
            }
            let mut edited: Vec<_> = edited.into_iter().collect();
            edited.sort_unstable_by_key(|c| (c.ty, c.tx));
            report.edited.extend(edited);
        }

        for &coord in &report.residuals {
            self.residuals.invalidate_tile(coord);
        }
        if let Some(elevation) = self.elevation.read().as_ref() {
            elevation.invalidate_tiles();
        }
        tracing::info!(
            edited = report.edited.len(),
            residuals = report.residuals.len(),
            "Updated residuals"
        );
        Ok(report)
    }

    /// Drop every edit and go back to the file's residuals.
    pub fn reset(&self) {
        self.pending.lock().clear();
        let Ok(producer) = self.producer() else {
            return;
        };
        let cleared = producer.clear_overrides();
        for &coord in &cleared {
            self.residuals.invalidate_tile(coord);
        }
        if let Some(elevation) = self.elevation.read().as_ref() {
            elevation.invalidate_tiles();
        }
        tracing::info!(tiles = cleared.len(), "Reset residual edits");
    }

    /// Write the file's pyramid with every edited tile in place.
    ///
    /// Edited samples are quantized by the file's scale. When the root tile
    /// is edited in a file with packed levels, the packed levels are written
    /// empty and the root tile holds the whole folded elevation.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let producer = self.producer()?;
        let file = producer.file();
        let header = *producer.header();
        let delta_level = producer.delta_level();
        let z_scale = if producer.z_scale() == 0.0 { 1.0 } else { producer.z_scale() };
        let root_edited = producer.override_tile(TileCoord::ROOT).is_some();

        let mut writer = ResidualWriter::new(header);
        let mut payload = Vec::new();
        for level in 0..delta_level {
            let id = header.tile_id(level, 0, 0);
            if root_edited {
                writer.set_payload(id, Vec::new())?;
            } else {
                file.read_payload(id, &mut payload)?;
                writer.set_payload(id, std::mem::take(&mut payload))?;
            }
        }
        for level in delta_level..=header.max_level {
            let depth = level - delta_level;
            let tiles = 1u32 << depth;
            for ty in 0..tiles {
                for tx in 0..tiles {
                    let coord = TileCoord::new(depth, tx, ty);
                    if let Some(values) = producer.override_tile(coord) {
                        let unscaled: Vec<f32> = values.iter().map(|v| v / z_scale).collect();
                        writer.set_tile_f32(level, tx, ty, &unscaled)?;
                    } else {
                        let id = header.tile_id(level, tx, ty);
                        file.read_payload(id, &mut payload)?;
                        writer.set_payload(id, std::mem::take(&mut payload))?;
                    }
                }
            }
        }
        writer.save(path)
    }
}

/// Tiles of `level` whose interior holds one of `positions`.
fn owner_tiles(positions: impl Iterator<Item = (i64, i64)>, level: u32, s: i64) -> HashSet<TileCoord> {
    let max = TileCoord::tiles_per_axis(level) as i64 - 1;
    positions
        .map(|(gx, gy)| {
            let tx = gx.div_euclid(s).clamp(0, max);
            let ty = gy.div_euclid(s).clamp(0, max);
            TileCoord::new(level, tx as u32, ty as u32)
        })
        .collect()
}

/// `U(parent)` at child global position `g`.
fn upsampled(parent: &LevelDelta, (gx, gy): (i64, i64)) -> f32 {
    if parent.is_empty() {
        return 0.0;
    }
    let mut total = 0.0;
    for (py, wy) in parent_taps(gy) {
        for (px, wx) in parent_taps(gx) {
            if let Some(&v) = parent.get(&(px, py)) {
                total += wx * wy * v;
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::file::ResidualFile;
    use crate::residual::format::ResidualHeader;
    use proland_producer::{CpuTileStorage, TileCache};
    use std::sync::Arc;

    fn residuals(header: ResidualHeader, fill: i16) -> Producer {
        let mut writer = ResidualWriter::new(header);
        let n = header.samples_at(header.min_level);
        writer.set_tile(0, 0, 0, &vec![fill; (n * n) as usize]).unwrap();
        let file = ResidualFile::from_bytes(writer.to_bytes().unwrap().into()).unwrap();
        let cache = Arc::new(TileCache::new(
            "residuals",
            Arc::new(CpuTileStorage::<f32>::new(n, 1, 16)),
        ));
        Producer::new(ResidualProducer::new("residuals", cache, file).unwrap())
    }

    #[test]
    fn region_edit_on_the_root_adds_to_residuals() {
        let p = residuals(ResidualHeader::new(0, 0, 6, 2.0), 100);
        let editor = ResidualEditor::new(p.clone()).unwrap();
        editor.edit_region(TileCoord::ROOT, (4, 4), (3, 3), 5.0).unwrap();
        assert!(editor.has_pending());

        let report = editor.update_residuals().unwrap();
        assert_eq!(report.edited, vec![TileCoord::ROOT]);
        assert_eq!(report.residuals, vec![TileCoord::ROOT]);
        assert!(!editor.has_pending());

        let values = p
            .downcast_ref::<ResidualProducer>()
            .unwrap()
            .read_tile(TileCoord::ROOT)
            .unwrap();
        for y in 0..11 {
            for x in 0..11 {
                let expected = if (4..7).contains(&x) && (4..7).contains(&y) {
                    205.0
                } else {
                    200.0
                };
                assert_eq!(values[y * 11 + x], expected, "sample ({x}, {y})");
            }
        }
    }

    #[test]
    fn edits_on_the_top_row_reach_ancestors_along_it() {
        let p = residuals(ResidualHeader::new(0, 3, 16, 1.0), 0);
        let editor = ResidualEditor::new(p).unwrap();
        editor
            .edit_region(TileCoord::new(3, 5, 0), (4, 4), (10, 10), 1.0)
            .unwrap();
        let report = editor.update_residuals().unwrap();
        assert_eq!(
            report.edited,
            vec![
                TileCoord::new(0, 0, 0),
                TileCoord::new(1, 1, 0),
                TileCoord::new(2, 2, 0),
                TileCoord::new(3, 5, 0),
            ]
        );
        for coord in &report.residuals {
            assert!(coord.ty <= 1, "{coord} is away from the top row");
        }
    }

    #[test]
    fn reset_restores_file_residuals() {
        let p = residuals(ResidualHeader::new(0, 0, 6, 1.0), 3);
        let editor = ResidualEditor::new(p.clone()).unwrap();
        editor.edit_region(TileCoord::ROOT, (0, 0), (11, 11), -3.0).unwrap();
        editor.update_residuals().unwrap();
        let producer = p.downcast_ref::<ResidualProducer>().unwrap();
        assert_eq!(producer.overridden(), vec![TileCoord::ROOT]);

        editor.reset();
        assert!(producer.overridden().is_empty());
        assert!(producer.read_tile(TileCoord::ROOT).unwrap().iter().all(|&v| v == 3.0));
    }

    #[test]
    fn save_writes_edited_tiles() {
        let p = residuals(ResidualHeader::new(0, 1, 4, 0.5), 10);
        let editor = ResidualEditor::new(p).unwrap();
        editor.edit_region(TileCoord::ROOT, (2, 2), (5, 5), 1.0).unwrap();
        editor.update_residuals().unwrap();

        let path = std::env::temp_dir().join(format!("proland-{}-edit.res", std::process::id()));
        editor.save(&path).unwrap();
        let saved = ResidualFile::open(&path, crate::residual::file::AccessMode::Memory).unwrap();
        std::fs::remove_file(&path).unwrap();

        let cache = Arc::new(TileCache::new(
            "saved",
            Arc::new(CpuTileStorage::<f32>::new(9, 1, 4)),
        ));
        let reread = ResidualProducer::new("saved", cache, saved).unwrap();
        let values = reread.read_tile(TileCoord::ROOT).unwrap();
        assert_eq!(values[0], 5.0);
        assert_eq!(values[4 * 9 + 4], 6.0);
    }

    #[test]
    fn deltas_must_match_the_tile_size() {
        let p = residuals(ResidualHeader::new(0, 0, 6, 1.0), 0);
        let editor = ResidualEditor::new(p).unwrap();
        assert!(editor.deposit(TileCoord::ROOT, &[1.0; 10]).is_err());
        assert!(editor.deposit(TileCoord::new(1, 0, 0), &[0.0; 121]).is_err());
        assert!(editor
            .edit_region(TileCoord::ROOT, (9, 0), (3, 1), 1.0)
            .is_err());
    }
}
