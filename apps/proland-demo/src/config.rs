//! Demo descriptor and command line.

use std::path::Path;

use anyhow::Context;
use proland_dem::{ElevationProducerConfig, NoiseLayerConfig};
use proland_particles::{
    LifeCycleConfig, ParticleProducerConfig, ParticleStorageConfig, WorldLayerConfig,
};
use proland_producer::SchedulerConfig;
use proland_terrain::{TerrainNodeConfig, TileSamplerConfig};
use serde::{Deserialize, Serialize};

/// Synthetic residual pyramid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    pub seed: u32,
    /// Deepest residual level.
    pub max_level: u32,
    /// Height of the central hill, in meters.
    pub hill_height: f32,
    /// Amplitude of the level 1 residuals; halved at each level.
    pub roughness: f32,
    /// Meters per stored residual unit.
    pub scale: f32,
    /// Residual tiles kept in the cache.
    pub capacity: usize,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            max_level: 4,
            hill_height: 1200.0,
            roughness: 150.0,
            scale: 0.25,
            capacity: 128,
        }
    }
}

/// A deposit applied to the residuals during the flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditConfig {
    /// Frame at which the edit is applied; `None` disables it.
    pub frame: Option<u32>,
    pub level: u32,
    /// Height added to the whole tile under the camera target.
    pub dz: f32,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            frame: Some(60),
            level: 3,
            dz: 40.0,
        }
    }
}

/// Camera path: the target moves straight ahead at constant speed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    pub frames: u32,
    /// Seconds per frame.
    pub dt: f64,
    /// Meters per second.
    pub speed: f64,
    /// Distance from the target.
    pub distance: f64,
    /// Tilt from the vertical, in degrees.
    pub tilt: f64,
    /// Frames between two statistics lines.
    pub report_every: u32,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            frames: 120,
            dt: 1.0 / 30.0,
            speed: 600.0,
            distance: 2500.0,
            tilt: 60.0,
            report_every: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub pyramid: PyramidConfig,
    pub elevation: ElevationProducerConfig,
    pub noise: Option<NoiseLayerConfig>,
    pub terrain: TerrainNodeConfig,
    pub sampler: TileSamplerConfig,
    pub scheduler: SchedulerConfig,
    pub particles: ParticleProducerConfig,
    /// New particles per frame.
    pub spawn_rate: usize,
    pub flight: FlightConfig,
    pub edit: EditConfig,
}

impl Default for DemoConfig {
    fn default() -> Self {
        let pyramid = PyramidConfig::default();
        let size = 8000.0;
        Self {
            elevation: ElevationProducerConfig::default()
                .with_tile_size(24)
                .with_capacity(256)
                .with_max_level(pyramid.max_level + 2)
                .with_root_quad_size(2.0 * size),
            noise: Some(NoiseLayerConfig::default().with_seed(pyramid.seed).with_amplitudes(vec![
                0.0, 0.0, 0.0, 0.0, 0.0, 8.0, 4.0,
            ])),
            terrain: TerrainNodeConfig::default()
                .with_size(size)
                .with_max_level(pyramid.max_level + 2),
            sampler: TileSamplerConfig::default().with_async(true),
            scheduler: SchedulerConfig::default(),
            particles: ParticleProducerConfig {
                name: "dust".to_string(),
                storage: ParticleStorageConfig::default().with_capacity(512).with_pack(true),
                life_cycle: Some(
                    LifeCycleConfig::default()
                        .with_fade_in(0.5)
                        .with_active(2.0)
                        .with_fade_out(0.5),
                ),
                world: Some(WorldLayerConfig::default()),
            },
            spawn_rate: 4,
            flight: FlightConfig::default(),
            edit: EditConfig::default(),
            pyramid,
        }
    }
}

impl DemoConfig {
    /// Load a JSON descriptor; missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Build the configuration from command line arguments.
    ///
    /// `--config <path>` loads a descriptor; `--frames`, `--seed` and
    /// `--sync` then override it.
    pub fn from_args() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut config = match args.iter().position(|a| a == "--config") {
            Some(i) => {
                let path = args.get(i + 1).context("--config needs a path")?;
                Self::load(Path::new(path))?
            }
            None => Self::default(),
        };

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => i += 1,
                "--frames" => {
                    let value = args.get(i + 1).context("--frames needs a value")?;
                    config.flight.frames = value.parse().context("invalid --frames")?;
                    i += 1;
                }
                "--seed" => {
                    let value = args.get(i + 1).context("--seed needs a value")?;
                    config.pyramid.seed = value.parse().context("invalid --seed")?;
                    i += 1;
                }
                "--sync" => config.sampler.async_mode = false,
                other => anyhow::bail!("unknown argument {other}"),
            }
            i += 1;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_descriptors_keep_defaults() {
        let config: DemoConfig = serde_json::from_str(
            r#"{
                "flight": { "frames": 10 },
                "terrain": { "size": 1000.0, "max_level": 3 },
                "noise": null
            }"#,
        )
        .unwrap();
        assert_eq!(config.flight.frames, 10);
        assert_eq!(config.terrain.max_level, 3);
        assert!(config.noise.is_none());
        assert_eq!(config.pyramid.max_level, PyramidConfig::default().max_level);
        assert!(config.sampler.async_mode);
    }

    #[test]
    fn default_descriptor_round_trips() {
        let json = serde_json::to_string(&DemoConfig::default()).unwrap();
        let config: DemoConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.elevation.tile_size, 24);
        assert_eq!(config.particles.storage.capacity, 512);
    }
}
