//! Synthetic terrain and the producers reading it.

use std::sync::Arc;

use anyhow::Context;
use noise::{NoiseFn, Perlin};
use proland_core::constants::{ELEVATION_BORDER, RESIDUAL_EXTRA_SAMPLES};
use proland_core::TileCoord;
use proland_dem::{
    AmplitudeNoiseLayer, ElevationProducer, ResidualEditor, ResidualFile, ResidualHeader,
    ResidualProducer, ResidualWriter,
};
use proland_producer::{CpuTileStorage, Producer, TileCache};
use tracing::info;

use crate::config::{DemoConfig, PyramidConfig};

/// Residual values of one tile: a hill at the root, noise below it.
fn residual_tile(config: &PyramidConfig, perlin: &Perlin, tile_size: u32, coord: TileCoord) -> Vec<f32> {
    let n = (tile_size + RESIDUAL_EXTRA_SAMPLES) as usize;
    let tiles = f64::from(1u32 << coord.level);
    let border = f64::from(ELEVATION_BORDER);
    let s = f64::from(tile_size);
    let amplitude = if coord.level == 0 {
        0.0
    } else {
        f64::from(config.roughness) / f64::from(1u32 << (coord.level - 1))
    };
    let mut values = Vec::with_capacity(n * n);
    for j in 0..n {
        let v = (f64::from(coord.ty) + (j as f64 - border) / s) / tiles;
        for i in 0..n {
            let u = (f64::from(coord.tx) + (i as f64 - border) / s) / tiles;
            let value = if coord.level == 0 {
                let r2 = (u - 0.5).powi(2) + (v - 0.5).powi(2);
                f64::from(config.hill_height) * (-r2 * 12.0).exp()
            } else {
                amplitude * perlin.get([u * tiles * 2.0, v * tiles * 2.0])
            };
            values.push(value as f32);
        }
    }
    values
}

/// Encode the synthetic pyramid into an in-memory residual file.
pub fn synthetic_residuals(config: &DemoConfig) -> anyhow::Result<ResidualFile> {
    let pyramid = &config.pyramid;
    let tile_size = config.elevation.tile_size;
    let header = ResidualHeader::new(0, pyramid.max_level, tile_size, pyramid.scale);
    let mut writer = ResidualWriter::new(header);
    let perlin = Perlin::new(pyramid.seed);
    for level in 0..=pyramid.max_level {
        for ty in 0..1u32 << level {
            for tx in 0..1u32 << level {
                let values = residual_tile(pyramid, &perlin, tile_size, TileCoord::new(level, tx, ty));
                writer.set_tile_f32(level, tx, ty, &values)?;
            }
        }
    }
    let bytes = writer.to_bytes()?;
    info!(
        levels = pyramid.max_level + 1,
        tile_size,
        bytes = bytes.len(),
        "Encoded synthetic residual pyramid"
    );
    Ok(ResidualFile::from_bytes(bytes.into())?)
}

/// The producers of the demo and the editor over their residuals.
pub struct Pipeline {
    pub residuals: Producer,
    pub elevation: Producer,
    pub editor: ResidualEditor,
}

impl Pipeline {
    pub fn new(config: &DemoConfig) -> anyhow::Result<Self> {
        let file = synthetic_residuals(config)?;
        let samples = config.elevation.tile_size + RESIDUAL_EXTRA_SAMPLES;
        let cache = Arc::new(TileCache::new(
            "residuals",
            Arc::new(CpuTileStorage::<f32>::new(samples, 1, config.pyramid.capacity)),
        ));
        let residuals = Producer::new(ResidualProducer::new("residuals", cache, file)?);

        let elevation = Producer::new(
            ElevationProducer::from_config(&config.elevation, Some(residuals.clone()), None)
                .context("creating the elevation producer")?,
        );
        if let Some(noise) = &config.noise {
            elevation.add_layer(Arc::new(AmplitudeNoiseLayer::new(noise.clone())));
        }

        let editor = ResidualEditor::new(residuals.clone())?;
        editor.attach_elevation(elevation.clone());
        Ok(Self {
            residuals,
            elevation,
            editor,
        })
    }

    /// Raise the whole residual tile of `level` containing the local point
    /// `(x, y)` by `dz`.
    pub fn raise_tile_at(
        &self,
        level: u32,
        root_size: f64,
        (x, y): (f64, f64),
        dz: f32,
    ) -> anyhow::Result<TileCoord> {
        let tiles = f64::from(1u32 << level);
        let to_index = |p: f64| {
            let t = ((p + root_size) / (2.0 * root_size) * tiles).floor();
            t.clamp(0.0, tiles - 1.0) as u32
        };
        let coord = TileCoord::new(level, to_index(x), to_index(y));
        // Slots hold the tile and its borders.
        let n = self.elevation.tile_size();
        self.editor.edit_region(coord, (0, 0), (n, n), dz)?;
        let report = self.editor.update_residuals()?;
        info!(
            %coord,
            dz,
            edited = report.edited.len(),
            residuals = report.residuals.len(),
            "Applied terrain edit"
        );
        Ok(coord)
    }
}
