//! Procedural detail added on top of reconstructed elevation.

use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use proland_core::constants::{ELEVATION_BORDER, RESIDUAL_EXTRA_SAMPLES};
use proland_core::{Result, TileCoord};
use proland_producer::{CreateTileTask, SlotId, TileLayer, TileStorage};
use serde::{Deserialize, Serialize};

use crate::elevation::{read_samples, write_samples};

/// Noise layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseLayerConfig {
    /// Seed for noise generation.
    pub seed: u32,
    /// Number of noise octaves per level.
    pub octaves: usize,
    /// Frequency multiplier between octaves.
    pub lacunarity: f64,
    /// Amplitude multiplier between octaves.
    pub persistence: f64,
    /// Noise periods across one tile.
    pub frequency: f64,
    /// Amplitude of the noise added at each level; levels past the end get none.
    pub amplitudes: Vec<f32>,
}

impl Default for NoiseLayerConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            octaves: 2,
            lacunarity: 2.0,
            persistence: 0.5,
            frequency: 1.0,
            amplitudes: Vec::new(),
        }
    }
}

impl NoiseLayerConfig {
    pub const fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    pub const fn with_octaves(mut self, octaves: usize) -> Self {
        self.octaves = octaves;
        self
    }

    pub const fn with_frequency(mut self, frequency: f64) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_amplitudes(mut self, amplitudes: impl Into<Vec<f32>>) -> Self {
        self.amplitudes = amplitudes.into();
        self
    }
}

/// Adds fractal noise with a per-level amplitude to elevation tiles.
///
/// Noise is evaluated at the sample's position in the root quad, so border
/// samples shared by neighboring tiles receive the same offset.
pub struct AmplitudeNoiseLayer {
    config: NoiseLayerConfig,
    noise: Fbm<Perlin>,
}

impl AmplitudeNoiseLayer {
    /// Create a new layer with the given configuration.
    pub fn new(config: NoiseLayerConfig) -> Self {
        let noise = Fbm::<Perlin>::new(config.seed)
            .set_octaves(config.octaves)
            .set_lacunarity(config.lacunarity)
            .set_persistence(config.persistence);
        Self { config, noise }
    }

    pub const fn config(&self) -> &NoiseLayerConfig {
        &self.config
    }

    /// Amplitude of the noise added at `level`.
    pub fn amplitude(&self, level: u32) -> f32 {
        self.config
            .amplitudes
            .get(level as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Noise offset at a point of the root quad, in `[0, 1]²` coordinates.
    pub fn offset_at(&self, level: u32, u: f64, v: f64) -> f32 {
        let amplitude = self.amplitude(level);
        if amplitude == 0.0 {
            return 0.0;
        }
        let scale = self.config.frequency * f64::from(1u32 << level.min(31));
        amplitude * self.noise.get([u * scale, v * scale]) as f32
    }
}

impl TileLayer for AmplitudeNoiseLayer {
    fn name(&self) -> &str {
        "amplitude-noise"
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn do_create_tile(
        &self,
        coord: TileCoord,
        slot: SlotId,
        storage: &dyn TileStorage,
        _task: &CreateTileTask,
    ) -> Result<()> {
        if self.amplitude(coord.level) == 0.0 {
            return Ok(());
        }
        let n = storage.tile_size() as usize;
        let s = f64::from(storage.tile_size() - RESIDUAL_EXTRA_SAMPLES);
        let tiles = f64::from(1u32 << coord.level.min(31));
        let border = f64::from(ELEVATION_BORDER);

        let mut z = read_samples(storage, slot)?;
        for (j, row) in z.chunks_exact_mut(n).enumerate() {
            let v = (f64::from(coord.ty) + (j as f64 - border) / s) / tiles;
            for (i, value) in row.iter_mut().enumerate() {
                let u = (f64::from(coord.tx) + (i as f64 - border) / s) / tiles;
                *value += self.offset_at(coord.level, u, v);
            }
        }
        write_samples(storage, slot, &z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevation::{ElevationProducer, ElevationProducerConfig};
    use approx::assert_abs_diff_eq;
    use proland_producer::{Deadline, InlineScheduler, Producer, Scheduler};
    use std::sync::Arc;

    fn layer(amplitudes: &[f32]) -> AmplitudeNoiseLayer {
        AmplitudeNoiseLayer::new(
            NoiseLayerConfig::default()
                .with_seed(7)
                .with_frequency(3.0)
                .with_amplitudes(amplitudes.to_vec()),
        )
    }

    #[test]
    fn levels_without_amplitude_are_untouched() {
        let layer = layer(&[0.0, 5.0]);
        assert_eq!(layer.amplitude(0), 0.0);
        assert_eq!(layer.amplitude(4), 0.0);
        assert_eq!(layer.offset_at(0, 0.3, 0.7), 0.0);
        assert!(layer.offset_at(1, 0.3, 0.7).abs() <= 5.0 * 2.0);
    }

    #[test]
    fn shared_borders_receive_the_same_noise() {
        let config = ElevationProducerConfig::default()
            .with_tile_size(8)
            .with_capacity(8);
        let elevation = Producer::new(ElevationProducer::from_config(&config, None, None).unwrap());
        elevation.add_layer(Arc::new(layer(&[0.0, 10.0])));

        let west = elevation.get_tile(TileCoord::new(1, 0, 0), Deadline::IMMEDIATE).unwrap();
        let east = elevation.get_tile(TileCoord::new(1, 1, 0), Deadline::IMMEDIATE).unwrap();
        InlineScheduler.schedule(elevation.task_graph(&west));
        InlineScheduler.schedule(elevation.task_graph(&east));

        let producer = elevation.downcast_ref::<ElevationProducer>().unwrap();
        let west = producer.read_tile(&west).unwrap();
        let east = producer.read_tile(&east).unwrap();
        let n = 13;
        // Column s + 2 of the west tile is column 2 of the east tile.
        for row in 0..n {
            assert_abs_diff_eq!(west[row * n + 10], east[row * n + 2], epsilon = 1e-4);
        }
        assert!(west.iter().any(|&z| z != 0.0));
    }
}
